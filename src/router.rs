//! URL-prefix routing.
//!
//! Routes map a URL prefix to a handler plus flags; lookup picks the
//! longest matching prefix. The table is built once and read-only during
//! serving, so workers share it without locks.

use crate::{http::types::StatusCode, Request, Response};
use bitflags::bitflags;
use std::{future::Future, pin::Pin};

bitflags! {
    /// Per-route behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RouteFlags: u8 {
        /// Gate the route behind HTTP Basic authorization.
        const MUST_AUTHORIZE = 1 << 0;
        /// Parse `Accept-Encoding` into request flags before the handler
        /// runs.
        const PARSE_ACCEPT_ENCODING = 1 << 1;
        /// The route consumes POST bodies; POSTs to routes without this
        /// are answered with 405.
        const HAS_POST_DATA = 1 << 2;
        /// The handler may rewrite the URL and be re-dispatched.
        const CAN_REWRITE_URL = 1 << 3;
    }
}

/// Boxed handler future; handlers run inside the connection's task and
/// may borrow the request and response for their whole run.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = StatusCode> + 'a>>;

/// A request handler attached to a route.
pub trait RouteHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: &'a mut Request, resp: &'a mut Response) -> HandlerFuture<'a>;
}

/// Adapter for plain synchronous handler functions.
pub struct FnHandler<F>(pub F);

impl<F> RouteHandler for FnHandler<F>
where
    F: Fn(&mut Request, &mut Response) -> StatusCode + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, req: &'a mut Request, resp: &'a mut Response) -> HandlerFuture<'a> {
        let status = (self.0)(req, resp);
        Box::pin(std::future::ready(status))
    }
}

/// Checks HTTP Basic credentials for routes with
/// [`RouteFlags::MUST_AUTHORIZE`].
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, user: &str, password: &str) -> bool;
}

pub struct Route {
    pub(crate) prefix: String,
    pub(crate) flags: RouteFlags,
    pub(crate) handler: Box<dyn RouteHandler>,
    pub(crate) realm: Option<String>,
    pub(crate) authorizer: Option<Box<dyn Authorizer>>,
}

/// Read-only prefix table.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Router { routes: Vec::new() }
    }

    /// Adds a route. Longer prefixes win over shorter ones regardless of
    /// insertion order.
    pub fn add(
        mut self,
        prefix: impl Into<String>,
        flags: RouteFlags,
        handler: impl RouteHandler,
    ) -> Self {
        self.push(Route {
            prefix: prefix.into(),
            flags,
            handler: Box::new(handler),
            realm: None,
            authorizer: None,
        });
        self
    }

    /// Adds a route gated behind HTTP Basic authorization.
    pub fn add_authorized(
        mut self,
        prefix: impl Into<String>,
        flags: RouteFlags,
        realm: impl Into<String>,
        authorizer: impl Authorizer,
        handler: impl RouteHandler,
    ) -> Self {
        self.push(Route {
            prefix: prefix.into(),
            flags: flags | RouteFlags::MUST_AUTHORIZE,
            handler: Box::new(handler),
            realm: Some(realm.into()),
            authorizer: Some(Box::new(authorizer)),
        });
        self
    }

    fn push(&mut self, route: Route) {
        self.routes.push(route);
        self.routes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }

    /// Longest-prefix match against the (decoded) URL.
    pub(crate) fn lookup_prefix(&self, url: &[u8]) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| url.starts_with(route.prefix.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop() -> FnHandler<impl Fn(&mut Request, &mut Response) -> StatusCode> {
        FnHandler(|_: &mut Request, _: &mut Response| StatusCode::Ok)
    }

    fn table() -> Router {
        Router::new()
            .add("/", RouteFlags::empty(), nop())
            .add("/api", RouteFlags::empty(), nop())
            .add("/api/users", RouteFlags::HAS_POST_DATA, nop())
    }

    #[test]
    fn longest_prefix_wins() {
        let router = table();

        #[rustfmt::skip]
        let cases = [
            ("/",               Some("/")),
            ("/index.html",     Some("/")),
            ("/api",            Some("/api")),
            ("/api/other",      Some("/api")),
            ("/api/users",      Some("/api/users")),
            ("/api/users/42",   Some("/api/users")),
            ("no-slash",        None),
        ];

        for (url, expected) in cases {
            let found = router.lookup_prefix(url.as_bytes()).map(|r| r.prefix.as_str());
            assert_eq!(found, expected, "{url:?}");
        }
    }

    #[test]
    fn flags_ride_along() {
        let router = table();
        let route = router.lookup_prefix(b"/api/users/42").unwrap();
        assert!(route.flags.contains(RouteFlags::HAS_POST_DATA));
    }
}
