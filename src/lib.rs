//! wren_web - cooperative-task HTTP/1.x serving engine
//!
//! A small, allocation-averse HTTP/1.0 / HTTP/1.1 server core. Every
//! connection runs as a cooperative task with scoped cleanup, reading as
//! if the socket were blocking while a per-worker reactor multiplexes
//! thousands of connections on one thread. The request parser works in a
//! single pass, in place, on the connection's read buffer.
//!
//! # Features
//!
//! - **Cooperative tasks** - explicit yield points, LIFO deferred
//!   cleanup, task reuse across keep-alive connections.
//! - **In-place parsing** - request line, headers, query strings,
//!   cookies, and form bodies are spans over one buffer; values decode in
//!   place and are parsed on first access.
//! - **Pipelining** - a follow-up request already sitting in the buffer
//!   is served without touching the socket.
//! - **Slow-client defenses** - packet-count and wall-clock guards on
//!   request heads and bodies.
//! - **PROXY protocol** - v1 and v2 prefixes on the first request of a
//!   connection.
//! - **WebSocket handshake** - key validation and the `101` upgrade
//!   response.
//!
//! # Quick start
//!
//! ```no_run
//! use wren_web::{FnHandler, Request, Response, RouteFlags, Router, Server, StatusCode};
//!
//! fn main() -> std::io::Result<()> {
//!     let router = Router::new().add(
//!         "/",
//!         RouteFlags::empty(),
//!         FnHandler(|_req: &mut Request, resp: &mut Response| {
//!             resp.write("Hello, world!");
//!             StatusCode::Ok
//!         }),
//!     );
//!
//!     Server::builder()
//!         .bind("127.0.0.1:8080")
//!         .router(router)
//!         .build()?
//!         .launch()
//! }
//! ```
pub mod coro;
pub(crate) mod http {
    pub(crate) mod body;
    pub(crate) mod parser;
    pub(crate) mod proxy;
    pub(crate) mod pump;
    pub(crate) mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod ws;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod dispatch;
    pub(crate) mod server_impl;
}
pub mod errors;
pub mod limits;
pub mod router;

pub use crate::{
    errors::RequestError,
    http::{
        proxy::ProxyInfo,
        request::{RangeSpec, Request},
        response::Response,
        types::{Method, StatusCode},
    },
    router::{Authorizer, FnHandler, HandlerFuture, Route, RouteFlags, RouteHandler, Router},
    server::server_impl::{Server, ServerBuilder},
};
