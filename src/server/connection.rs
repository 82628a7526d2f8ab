//! Connection plumbing: the task entry that loops over transactions, the
//! shared per-connection flag word, and the reactor-side driver that
//! translates task yields into readiness waits and timers.

use crate::{
    coro::{Resume, Task, TaskHandle, Yield},
    http::{pump::Io, types::ConnFlags},
    limits::ReqLimits,
    router::Router,
    server::dispatch::process_request,
    Request,
};
use std::{cell::Cell, net::SocketAddr, rc::Rc, sync::Arc, time::Duration};
use tokio::{
    io::Interest,
    net::TcpStream,
    task::yield_now,
    time::{sleep, timeout},
};

/// Connection state shared between the task body and the driver.
#[derive(Debug, Default)]
pub(crate) struct ConnShared {
    flags: Cell<ConnFlags>,
    /// Sleep duration for the next `SuspendTimer` yield, in milliseconds.
    pub(crate) sleep_for: Cell<u64>,
}

impl ConnShared {
    #[inline(always)]
    pub(crate) fn contains(&self, flag: ConnFlags) -> bool {
        self.flags.get().contains(flag)
    }

    #[inline(always)]
    pub(crate) fn insert(&self, flag: ConnFlags) {
        let mut flags = self.flags.get();
        flags.insert(flag);
        self.flags.set(flags);
    }

    #[inline(always)]
    pub(crate) fn remove(&self, flag: ConnFlags) {
        let mut flags = self.flags.get();
        flags.remove(flag);
        self.flags.set(flags);
    }
}

/// Entry function of a connection task: serve transactions until the
/// connection stops being keep-alive or the peer goes away. Pipelined
/// follow-ups are picked up by the pump from the carry-over left in the
/// parser helper.
pub(crate) async fn connection_entry(
    task: TaskHandle,
    io: Rc<dyn Io>,
    peer: Option<SocketAddr>,
    router: Arc<Router>,
    limits: Arc<ReqLimits>,
    conn: Rc<ConnShared>,
) -> i32 {
    let mut req = Request::new(&limits, io, task, conn.clone(), peer);

    loop {
        let _next = process_request(&router, &limits, &mut req).await;

        if !conn.contains(ConnFlags::KEEP_ALIVE) {
            break;
        }
        req.reset_transaction();
    }

    0
}

/// Reactor side of one connection: resumes the task and satisfies
/// whatever it yielded for. Idle keep-alive connections are bounded by
/// the keep-alive timeout on readable waits.
pub(crate) async fn drive(
    task: &mut Task,
    stream: &TcpStream,
    conn: &ConnShared,
    keep_alive_timeout: Duration,
) {
    loop {
        match task.resume_async(0).await {
            Resume::Yielded(Yield::WantRead) => {
                match timeout(keep_alive_timeout, stream.readable()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            Resume::Yielded(Yield::WantWrite) => {
                if stream.writable().await.is_err() {
                    break;
                }
            }
            Resume::Yielded(Yield::WantReadWrite) => {
                if stream
                    .ready(Interest::READABLE | Interest::WRITABLE)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Resume::Yielded(Yield::Reschedule) => yield_now().await,
            Resume::Yielded(Yield::SuspendTimer) => {
                let ms = conn.sleep_for.replace(0);
                sleep(Duration::from_millis(ms)).await;
            }
            Resume::Yielded(Yield::Abort) => break,
            Resume::Finished(_) => break,
        }
    }
}
