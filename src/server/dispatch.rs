//! Per-transaction dispatch: pump, parse, route, prepare, handle,
//! rewrite, respond.

use crate::{
    coro::TaskHandle,
    errors::RequestError,
    http::{
        body::{drain_post_data, read_post_data},
        pump::{read_request_head, Io},
        request::UrlStorage,
        response::{send_default, send_response, Response},
        types::{RequestFlags, Span},
    },
    limits::ReqLimits,
    router::{Route, RouteFlags, Router},
    Request,
};

/// Drives one HTTP transaction to completion.
///
/// Returns the start of a pipelined follow-up request, if one is already
/// buffered, so the connection loop can serve it without touching the
/// socket. A request head that never materializes tears the task down;
/// a bad request with a located follow-up only abandons the transaction.
pub(crate) async fn process_request(
    router: &Router,
    limits: &ReqLimits,
    req: &mut Request,
) -> Option<usize> {
    let io = req.io.clone();
    let task = req.task.clone();

    let allow_proxy = req.flags.contains(RequestFlags::ALLOW_PROXY_REQS);
    if let Err(error) = read_request_head(io.as_ref(), &task, &mut req.helper, allow_proxy).await {
        if error == RequestError::BadRequest && req.helper.next_request.is_some() {
            // This request was bad, but a good one may be pipelined
            // behind it.
            return req.helper.next_request;
        }

        let _ = send_default(io.as_ref(), &task, req, error, None).await;
        match task.closed().await {}
    }

    let parsed = req.parse();
    req.flags.remove(RequestFlags::ALLOW_PROXY_REQS);

    if let Err(error) = parsed {
        let _ = send_default(io.as_ref(), &task, req, error, None).await;
        return req.helper.next_request;
    }

    let mut resp = Response::new();
    let mut realm: Option<String> = None;

    let outcome = loop {
        let Some(route) = router.lookup_prefix(req.url()) else {
            break Err(RequestError::NotFound);
        };

        if let Err(error) = prepare_for_response(io.as_ref(), &task, route, limits, req).await {
            if error == RequestError::NotAuthorized {
                realm = route.realm.clone();
            }
            break Err(error);
        }

        let status = route.handler.handle(req, &mut resp).await;

        if route.flags.contains(RouteFlags::CAN_REWRITE_URL)
            && req.flags.contains(RequestFlags::URL_REWRITTEN)
        {
            if handle_rewrite(req) {
                continue;
            }
            break Err(RequestError::Internal);
        }

        break Ok(status);
    };

    match outcome {
        Ok(status) => {
            if send_response(io.as_ref(), &task, req, &resp, status)
                .await
                .is_err()
            {
                match task.closed().await {}
            }
        }
        Err(error) => {
            let _ = send_default(io.as_ref(), &task, req, error, realm.as_deref()).await;
        }
    }

    req.helper.next_request
}

/// Route preparation: prefix strip, authorization gate, optional
/// `Accept-Encoding` parse, POST body ingestion.
async fn prepare_for_response(
    io: &dyn Io,
    task: &TaskHandle,
    route: &Route,
    limits: &ReqLimits,
    req: &mut Request,
) -> Result<(), RequestError> {
    let prefix_len = route.prefix.len();
    req.url.start += prefix_len;
    req.url.len -= prefix_len;

    if route.flags.contains(RouteFlags::MUST_AUTHORIZE) && !authorize(req, route) {
        return Err(RequestError::NotAuthorized);
    }

    while req.url.len > 0 && req.url_backing()[req.url.start] == b'/' {
        req.url.start += 1;
        req.url.len -= 1;
    }

    if route.flags.contains(RouteFlags::PARSE_ACCEPT_ENCODING) {
        req.parse_accept_encoding();
    }

    if req.flags.contains(RequestFlags::METHOD_POST) {
        if !route.flags.contains(RouteFlags::HAS_POST_DATA) {
            // Consume the declared body first; leftover body bytes would
            // otherwise masquerade as the next pipelined request.
            drain_post_data(io, task, limits, req).await?;
            return Err(RequestError::NotAllowed);
        }

        read_post_data(io, task, limits, req).await?;
    }

    Ok(())
}

fn authorize(req: &Request, route: &Route) -> bool {
    let Some(authorizer) = route.authorizer.as_deref() else {
        return false;
    };

    let Some(header) = req.header(b"Authorization") else {
        return false;
    };
    let Some(encoded) = header.strip_prefix(b"Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::decode(encoded) else {
        return false;
    };
    let Ok(credentials) = simdutf8::basic::from_utf8(&decoded) else {
        return false;
    };
    let Some((user, password)) = credentials.split_once(':') else {
        return false;
    };

    authorizer.authorize(user, password)
}

/// Re-splits query and fragment out of the rewritten URL and counts the
/// iteration. More than four rewrites for one request is a hard failure.
fn handle_rewrite(req: &mut Request) -> bool {
    req.flags.remove(RequestFlags::URL_REWRITTEN);

    req.helper.url_storage = UrlStorage::Rewritten;
    req.url = Span::new(0, req.helper.rewritten_url.len());

    req.helper.query_string = None;
    req.helper.query_params.clear();
    req.flags.remove(RequestFlags::PARSED_QUERY_STRING);

    let end = req.url.len;
    req.parse_fragment_and_query(end);

    req.helper.urls_rewritten += 1;
    req.helper.urls_rewritten <= 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coro::Task,
        http::pump::MockIo,
        router::{Authorizer, FnHandler, HandlerFuture, RouteHandler},
        server::connection::{connection_entry, ConnShared},
        tools::drive_to_end,
        Response, StatusCode,
    };
    use std::{rc::Rc, sync::Arc};

    fn serve(router: Router, io: MockIo) -> (String, Rc<ConnShared>) {
        serve_with(router, ReqLimits::default(), io)
    }

    fn serve_with(router: Router, limits: ReqLimits, io: MockIo) -> (String, Rc<ConnShared>) {
        let router = Arc::new(router);
        let limits = Arc::new(limits);
        let io = Rc::new(io);
        let conn = Rc::new(ConnShared::default());

        let task_io = io.clone();
        let task_conn = conn.clone();
        let mut task = Task::new(move |handle| {
            connection_entry(handle, task_io, None, router, limits, task_conn)
        });

        drive_to_end(&mut task);
        (io.written_string(), conn)
    }

    fn echo_url() -> FnHandler<impl Fn(&mut Request, &mut Response) -> StatusCode> {
        FnHandler(|req: &mut Request, resp: &mut Response| {
            let url = req.url().to_vec();
            resp.write(url);
            StatusCode::Ok
        })
    }

    #[test]
    fn serves_a_simple_request() {
        let router = Router::new().add(
            "/",
            RouteFlags::empty(),
            FnHandler(|_: &mut Request, resp: &mut Response| {
                resp.write("hello");
                StatusCode::Ok
            }),
        );

        let io = MockIo::one_request("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let (written, conn) = serve(router, io);

        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(written.ends_with("hello"));
        assert!(!conn.contains(crate::http::types::ConnFlags::KEEP_ALIVE));
    }

    #[test]
    fn missing_route_is_404() {
        let router = Router::new().add("/api", RouteFlags::empty(), echo_url());

        let io = MockIo::one_request("GET /elsewhere HTTP/1.1\r\nConnection: close\r\n\r\n");
        let (written, _) = serve(router, io);

        assert!(written.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn pipelined_requests_are_served_in_order() {
        let router = Router::new().add("/", RouteFlags::empty(), echo_url());

        let io = MockIo::one_request(
            "GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n",
        );
        let (written, _) = serve(router, io);

        let first = written.find("\r\n\r\na").expect("first body");
        let second = written.find("\r\n\r\nb").expect("second body");
        assert!(first < second);
        assert_eq!(written.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[test]
    fn post_form_round_trip() {
        let router = Router::new().add(
            "/p",
            RouteFlags::HAS_POST_DATA,
            FnHandler(|req: &mut Request, resp: &mut Response| {
                let x = req.post_param(b"x").unwrap().to_vec();
                let y = req.post_param(b"y").unwrap().to_vec();
                assert_eq!(req.body().unwrap().len(), 7);

                resp.write(x).write(",").write(y);
                StatusCode::Ok
            }),
        );

        let io = MockIo::one_request(
            "POST /p HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 7\r\nConnection: close\r\n\r\nx=1&y=2",
        );
        let (written, _) = serve(router, io);

        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(written.ends_with("1,2"));
    }

    #[test]
    fn post_without_post_route_drains_and_keeps_the_pipeline() {
        let router = Router::new().add("/", RouteFlags::empty(), echo_url());

        let io = MockIo::one_request(
            "POST /n HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc\
             GET /ok HTTP/1.1\r\nConnection: close\r\n\r\n",
        );
        let (written, _) = serve(router, io);

        let not_allowed = written.find("HTTP/1.1 405 Not Allowed").expect("405 first");
        let ok = written.find("HTTP/1.1 200 OK").expect("200 after");
        assert!(not_allowed < ok);
        assert!(written.ends_with("ok"));
    }

    struct OneUser;

    impl Authorizer for OneUser {
        fn authorize(&self, user: &str, password: &str) -> bool {
            user == "wren" && password == "sesame"
        }
    }

    fn authorized_router() -> Router {
        Router::new().add_authorized(
            "/vault",
            RouteFlags::empty(),
            "vault",
            OneUser,
            FnHandler(|_: &mut Request, resp: &mut Response| {
                resp.write("secret");
                StatusCode::Ok
            }),
        )
    }

    #[test]
    fn missing_credentials_get_401_with_realm() {
        let io = MockIo::one_request("GET /vault HTTP/1.1\r\nConnection: close\r\n\r\n");
        let (written, _) = serve(authorized_router(), io);

        assert!(written.starts_with("HTTP/1.1 401 Not Authorized\r\n"));
        assert!(written.contains("WWW-Authenticate: Basic realm=\"vault\"\r\n"));
    }

    #[test]
    fn good_credentials_pass_the_gate() {
        let io = MockIo::one_request(
            "GET /vault HTTP/1.1\r\nAuthorization: Basic d3JlbjpzZXNhbWU=\r\n\
             Connection: close\r\n\r\n",
        );
        let (written, _) = serve(authorized_router(), io);

        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(written.ends_with("secret"));
    }

    #[test]
    fn bad_credentials_are_rejected() {
        let io = MockIo::one_request(
            "GET /vault HTTP/1.1\r\nAuthorization: Basic d3JlbjpndWVzcw==\r\n\
             Connection: close\r\n\r\n",
        );
        let (written, _) = serve(authorized_router(), io);

        assert!(written.starts_with("HTTP/1.1 401 Not Authorized\r\n"));
    }

    #[test]
    fn rewrite_redispatches_once() {
        let router = Router::new().add(
            "/",
            RouteFlags::CAN_REWRITE_URL,
            FnHandler(|req: &mut Request, resp: &mut Response| {
                if req.url() == b"old" {
                    req.rewrite(b"/new?tag=1");
                    return StatusCode::Ok;
                }

                assert_eq!(req.url(), b"new");
                let tag = req.query_param(b"tag").unwrap().to_vec();
                resp.write("rewritten:").write(tag);
                StatusCode::Ok
            }),
        );

        let io = MockIo::one_request("GET /old HTTP/1.1\r\nConnection: close\r\n\r\n");
        let (written, _) = serve(router, io);

        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(written.ends_with("rewritten:1"));
    }

    #[test]
    fn endless_rewrites_hit_the_cap() {
        let router = Router::new().add(
            "/",
            RouteFlags::CAN_REWRITE_URL,
            FnHandler(|req: &mut Request, _: &mut Response| {
                req.rewrite(b"/again");
                StatusCode::Ok
            }),
        );

        let io = MockIo::one_request("GET /loop HTTP/1.1\r\nConnection: close\r\n\r\n");
        let (written, _) = serve(router, io);

        assert!(written.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    struct WsHandler;

    impl RouteHandler for WsHandler {
        fn handle<'a>(&'a self, req: &'a mut Request, _: &'a mut Response) -> HandlerFuture<'a> {
            Box::pin(async move {
                match req.websocket_upgrade().await {
                    Ok(()) => StatusCode::SwitchingProtocols,
                    Err(error) => error.status(),
                }
            })
        }
    }

    #[test]
    fn websocket_upgrade_handshake() {
        let router = Router::new().add("/ws", RouteFlags::empty(), WsHandler);

        let io = MockIo::one_request(
            "GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );
        let (written, conn) = serve(router, io);

        assert!(written.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(written.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(conn.contains(crate::http::types::ConnFlags::IS_WEBSOCKET));
        // The upgrade wrote its own head; no second response follows.
        assert_eq!(written.matches("HTTP/1.1").count(), 1);
    }

    #[test]
    fn bad_websocket_key_is_bad_request() {
        let router = Router::new().add("/ws", RouteFlags::empty(), WsHandler);

        let io = MockIo::one_request(
            "GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Key: !!!\r\nConnection: close\r\n\r\n",
        );
        let (written, _) = serve(router, io);

        assert!(written.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn unknown_method_gets_405_and_the_connection_survives() {
        let router = Router::new().add("/", RouteFlags::empty(), echo_url());

        // Keep-alive is established by the first request; the bad-method
        // transaction answers 405 without tearing the connection down, so
        // a later request is still served.
        let io = MockIo::with_chunks([
            b"GET /first HTTP/1.1\r\n\r\nPATCH /x HTTP/1.1\r\n\r\n".to_vec(),
            b"GET /after HTTP/1.1\r\nConnection: close\r\n\r\n".to_vec(),
        ]);
        let (written, _) = serve(router, io);

        let first = written.find("\r\n\r\nfirst").expect("first body");
        let not_allowed = written.find("HTTP/1.1 405 Not Allowed").expect("405 next");
        let after = written.find("\r\n\r\nafter").expect("served after the 405");
        assert!(first < not_allowed && not_allowed < after);
    }
}
