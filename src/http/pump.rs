//! The read-buffer pump.
//!
//! Feeds socket bytes to a finalizer until a request head or body is
//! complete, yielding back to the reactor whenever the socket has nothing
//! for us. Two guards bound slow clients: a packet counter (slow-loris)
//! and, for bodies, a wall-clock deadline.

use crate::{
    coro::{TaskHandle, Yield},
    errors::RequestError,
    http::{
        parser::MIN_REQUEST_SIZE,
        proxy::{V2_ADDR_MAX, V2_SIG_LEN, V2_SIG_TAIL},
        request::Helper,
    },
};
use memchr::memmem;
use std::{io, time::Instant};

/// Byte-level socket access. The engine only ever uses the nonblocking
/// forms; readiness waiting happens through task yields.
pub(crate) trait Io {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl Io for tokio::net::TcpStream {
    #[inline(always)]
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_read(self, buf)
    }

    #[inline(always)]
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_write(self, buf)
    }
}

/// Packet budget for reading `total` bytes: roughly twice the expected
/// count at a 1480-byte MTU, never below five.
#[inline(always)]
pub(crate) fn calculate_n_packets(total: usize) -> u32 {
    (total / 740).max(5) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Done,
    TryAgain,
    ErrorTimeout,
}

/// Reads until the buffer holds a complete request head.
///
/// A pipelined carry-over is moved to the buffer start and finalized
/// before touching the socket. `EAGAIN` yields `WantRead`, `EINTR` yields
/// a reschedule, peer close aborts the task, and a fatal error before any
/// bytes arrived is a plain bad request.
pub(crate) async fn read_request_head(
    io: &dyn Io,
    task: &TaskHandle,
    helper: &mut Helper,
    allow_proxy: bool,
) -> Result<(), RequestError> {
    let cap = helper.buf.len();
    let mut pipelined = false;
    let mut n_packets: u32 = 0;

    if let Some(next) = helper.next_request.take() {
        if next <= helper.len {
            let carry = helper.len - next;
            helper.buf.copy_within(next..next + carry, 0);
            helper.len = carry;
            pipelined = true;

            match head_finalizer(helper, allow_proxy, &mut pipelined, n_packets) {
                Verdict::Done => return Ok(()),
                Verdict::ErrorTimeout => return Err(RequestError::Timeout),
                Verdict::TryAgain => {
                    task.pause(Yield::Reschedule).await;
                }
            }
        } else {
            helper.len = 0;
        }
    }

    loop {
        if cap - helper.len == 0 {
            return Err(RequestError::TooLarge);
        }

        let n = match io.try_read(&mut helper.buf[helper.len..cap]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                task.pause(Yield::WantRead).await;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                task.pause(Yield::Reschedule).await;
                continue;
            }
            Err(_) => {
                // Unexpected error before reading anything.
                if helper.len == 0 {
                    return Err(RequestError::BadRequest);
                }
                match task.closed().await {}
            }
        };

        if n == 0 {
            // Peer shut down orderly; tear the task down.
            match task.closed().await {}
        }

        helper.len += n;
        n_packets += 1;

        match head_finalizer(helper, allow_proxy, &mut pipelined, n_packets) {
            Verdict::Done => return Ok(()),
            Verdict::ErrorTimeout => return Err(RequestError::Timeout),
            Verdict::TryAgain => {
                task.pause(Yield::Reschedule).await;
            }
        }
    }
}

/// Done once `\r\n\r\n` is buffered and either enough bytes precede it
/// for a minimal request, or a PROXY v2 signature follows it. The packet
/// budget caps clients trickling a byte at a time.
fn head_finalizer(
    helper: &Helper,
    allow_proxy: bool,
    pipelined: &mut bool,
    n_packets: u32,
) -> Verdict {
    const MIN_PROXIED_REQUEST_SIZE: usize = MIN_REQUEST_SIZE + V2_SIG_LEN + V2_ADDR_MAX;

    if n_packets > helper.error_when_n_packets {
        return Verdict::ErrorTimeout;
    }

    let buf = &helper.buf[..helper.len];
    if let Some(at) = memmem::find(buf, b"\r\n\r\n") {
        // A carried-over request already survived the minimum-size check
        // when it was first read.
        if *pipelined {
            *pipelined = false;
            return Verdict::Done;
        }

        if at >= MIN_REQUEST_SIZE - 4 {
            return Verdict::Done;
        }

        if helper.len > MIN_PROXIED_REQUEST_SIZE && allow_proxy {
            if buf.get(at + 4..at + 12) == Some(&V2_SIG_TAIL[..]) {
                return Verdict::Done;
            }
        }
    }

    Verdict::TryAgain
}

/// Reads exactly `dst.len()` body bytes, bounded by the wall-clock
/// deadline and the packet budget.
pub(crate) async fn read_body_bytes(
    io: &dyn Io,
    task: &TaskHandle,
    dst: &mut [u8],
    deadline: Option<Instant>,
    max_packets: u32,
) -> Result<(), RequestError> {
    let cap = dst.len();
    let mut total = 0;
    let mut n_packets: u32 = 0;

    while total < cap {
        let n = match io.try_read(&mut dst[total..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                task.pause(Yield::WantRead).await;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                task.pause(Yield::Reschedule).await;
                continue;
            }
            Err(_) => {
                if total == 0 {
                    return Err(RequestError::BadRequest);
                }
                match task.closed().await {}
            }
        };

        if n == 0 {
            match task.closed().await {}
        }

        total += n;
        n_packets += 1;

        if total == cap {
            break;
        }

        // Bodies cross small MTUs; bound them by time as well as packets.
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(RequestError::Timeout);
            }
        }
        if n_packets > max_packets {
            return Err(RequestError::Timeout);
        }

        task.pause(Yield::Reschedule).await;
    }

    Ok(())
}

/// Writes all of `bytes`, yielding `WantWrite` on a full socket buffer.
pub(crate) async fn send_all(io: &dyn Io, task: &TaskHandle, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match io.try_write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                task.pause(Yield::WantWrite).await;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                task.pause(Yield::Reschedule).await;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}


#[cfg(test)]
pub(crate) use mock::MockIo;
