//! Server bring-up: listener configuration, the accept loop, and the
//! worker pool.
//!
//! The listener thread accepts sockets and pushes them onto a shared
//! queue; worker threads each run a single-threaded reactor hosting a
//! fixed number of connection slots. A slot keeps one task alive and
//! resets it for every connection it takes, so the steady state allocates
//! nothing per accept. Queue overflow is answered with an immediate 503.

use crate::{
    coro::{Task, TaskHandle},
    limits::{ReqLimits, ServerLimits},
    router::Router,
    server::connection::{connection_entry, drive, ConnShared},
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream, ToSocketAddrs},
    rc::Rc,
    sync::Arc,
    thread,
    time::Duration,
};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

type StreamQueue = Arc<SegQueue<(StdTcpStream, SocketAddr)>>;

/// A configured HTTP server. Built with [`Server::builder`], run with
/// [`Server::launch`].
pub struct Server {
    listener: StdTcpListener,
    router: Arc<Router>,
    server_limits: ServerLimits,
    req_limits: Arc<ReqLimits>,
}

/// Builder for [`Server`] instances.
pub struct ServerBuilder {
    addr: Option<SocketAddr>,
    router: Option<Router>,
    server_limits: ServerLimits,
    req_limits: ReqLimits,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            addr: None,
            router: None,
            server_limits: ServerLimits::default(),
            req_limits: ReqLimits::default(),
        }
    }

    /// Spawns the worker pool and serves on the calling thread until the
    /// accept loop fails fatally.
    pub fn launch(self) -> io::Result<()> {
        let queue: StreamQueue = Arc::new(SegQueue::new());
        let overflow: StreamQueue = Arc::new(SegQueue::new());

        for worker in 0..self.server_limits.workers.max(1) {
            let queue = queue.clone();
            let router = self.router.clone();
            let limits = self.req_limits.clone();
            let conns = self.server_limits.conns_per_worker.max(1);

            thread::Builder::new()
                .name(format!("wren-worker-{worker}"))
                .spawn(move || worker_loop(queue, router, limits, conns))?;
        }

        {
            let overflow = overflow.clone();
            thread::Builder::new()
                .name("wren-overflow".into())
                .spawn(move || overflow_loop(overflow))?;
        }

        info!(
            addr = %self.listener.local_addr()?,
            workers = self.server_limits.workers,
            "serving",
        );

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);

                    if queue.len() < self.server_limits.max_pending_connections {
                        queue.push((stream, addr));
                    } else {
                        overflow.push((stream, addr));
                    }
                }
                Err(error) => {
                    warn!(%error, "accept failed");
                }
            }
        }
    }
}

impl ServerBuilder {
    /// Address to listen on. **Required.**
    pub fn bind<A: ToSocketAddrs>(mut self, addr: A) -> Self {
        self.addr = addr.to_socket_addrs().ok().and_then(|mut it| it.next());
        self
    }

    /// Route table served by every worker. **Required.**
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = limits;
        self
    }

    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.req_limits = limits;
        self
    }

    /// Binds the listening socket and finalizes the server.
    ///
    /// # Panics
    ///
    /// Panics when `bind` or `router` was not called.
    #[track_caller]
    pub fn build(self) -> io::Result<Server> {
        let addr = self
            .addr
            .expect("The `bind` method must be called to create");
        let router = self
            .router
            .expect("The `router` method must be called to create");

        let listener = bind_listener(addr, &self.server_limits)?;

        Ok(Server {
            listener,
            router: Arc::new(router),
            server_limits: self.server_limits,
            req_limits: Arc::new(self.req_limits),
        })
    }
}

fn bind_listener(addr: SocketAddr, limits: &ServerLimits) -> io::Result<StdTcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if limits.reuse_port {
        // Best effort; older kernels do not have it.
        let _ = socket.set_reuse_port(true);
    }

    socket.bind(&addr.into())?;
    socket.listen(limits.backlog)?;

    Ok(socket.into())
}

fn worker_loop(queue: StreamQueue, router: Arc<Router>, limits: Arc<ReqLimits>, conns: usize) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "worker runtime failed to start");
            return;
        }
    };

    let local = tokio::task::LocalSet::new();

    for _ in 0..conns {
        let queue = queue.clone();
        let router = router.clone();
        let limits = limits.clone();

        local.spawn_local(async move {
            // One task allocation serves every connection this slot takes;
            // resetting it runs the previous connection's deferred actions.
            let mut task: Option<Task> = None;

            loop {
                let (stream, peer) = pop_stream(&queue).await;

                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let Ok(stream) = TcpStream::from_std(stream) else {
                    continue;
                };
                let stream = Rc::new(stream);
                let conn = Rc::new(ConnShared::default());

                let entry_stream = stream.clone();
                let entry_conn = conn.clone();
                let entry_router = router.clone();
                let entry_limits = limits.clone();
                let entry = move |handle: TaskHandle| {
                    connection_entry(
                        handle,
                        entry_stream,
                        Some(peer),
                        entry_router,
                        entry_limits,
                        entry_conn,
                    )
                };

                match task.as_mut() {
                    Some(task) => task.reset(entry),
                    None => task = Some(Task::new(entry)),
                }

                if let Some(task) = task.as_mut() {
                    drive(task, &stream, &conn, limits.keep_alive_timeout).await;
                    task.cancel();
                }
            }
        });
    }

    runtime.block_on(local);
}

async fn pop_stream(queue: &SegQueue<(StdTcpStream, SocketAddr)>) -> (StdTcpStream, SocketAddr) {
    loop {
        if let Some(value) = queue.pop() {
            return value;
        }
        tokio::time::sleep(Duration::from_micros(50)).await;
    }
}

/// Answers queue overflow with a canned 503 and closes the socket.
fn overflow_loop(queue: StreamQueue) {
    const RESPONSE: &[u8] =
        b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

    loop {
        let Some((mut stream, _)) = queue.pop() else {
            thread::sleep(Duration::from_micros(50));
            continue;
        };

        use std::io::Write;
        let _ = stream.write_all(RESPONSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listener_produces_a_listening_socket() {
        let limits = ServerLimits::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &limits).unwrap();

        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);

        // A client can connect while the listener is alive.
        std::net::TcpStream::connect(addr).unwrap();
    }
}
