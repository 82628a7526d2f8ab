//! Server configuration limits and timeouts.
//!
//! Defaults are intentionally conservative: a fixed-size read buffer per
//! connection, a bounded header table, a capped request body, and two
//! independent slow-client guards (wall clock and packet count). Raise
//! them only for workloads that demonstrably need it.

use std::time::Duration;

/// Controls listener bring-up and worker-pool sizing.
///
/// A worker thread runs its own single-threaded reactor and hosts many
/// connection tasks; exactly one task runs at a time on a worker. Accepted
/// sockets flow through a shared queue from the listener thread to the
/// workers, which reuse their tasks across sequential connections.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker threads (default: `4`).
    pub workers: usize,

    /// Connection tasks hosted per worker (default: `128`).
    ///
    /// This bounds how many sockets a single worker multiplexes; sockets
    /// beyond `workers * conns_per_worker` wait in the admission queue.
    pub conns_per_worker: usize,

    /// Maximum sockets waiting in the admission queue (default: `256`).
    ///
    /// Overflowing connections receive an immediate `503` and are closed.
    pub max_pending_connections: usize,

    /// Listen backlog passed to the kernel (default: `512`).
    pub backlog: i32,

    /// Sets `SO_REUSEPORT` on the listening socket where available
    /// (default: `false`).
    pub reuse_port: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: 4,
            conns_per_worker: 128,
            max_pending_connections: 256,
            backlog: 512,
            reuse_port: false,

            _priv: (),
        }
    }
}

/// Request parsing and body-ingestion limits.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Read-buffer size per connection in bytes (default: `4096`).
    ///
    /// A request head (request line plus headers) must fit in this buffer;
    /// anything larger is answered with `413`.
    pub buffer_size: usize,

    /// Maximum accepted `Content-Length` for POST bodies in bytes
    /// (default: `10 MiB`).
    pub max_post_data_size: usize,

    /// Idle deadline between requests on a keep-alive connection, and the
    /// wall-clock budget for receiving a request body (default: `15 s`).
    pub keep_alive_timeout: Duration,

    /// Allows spilling POST bodies of 1 MiB and more into an unlinked
    /// temporary file mapped into memory (default: `false`).
    ///
    /// Without this, bodies that do not fit the heap path are answered
    /// with `500`.
    pub allow_post_temp_file: bool,

    /// Accepts a PROXY protocol v1/v2 prefix on the first request of each
    /// connection and records the advertised endpoints (default: `false`).
    pub allow_proxy_reqs: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            max_post_data_size: 10 * 1024 * 1024,
            keep_alive_timeout: Duration::from_secs(15),
            allow_post_temp_file: false,
            allow_proxy_reqs: false,

            _priv: (),
        }
    }
}
