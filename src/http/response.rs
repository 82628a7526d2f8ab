//! Response assembly and the socket-side send path.
//!
//! Handlers fill a [`Response`] (mime type, body, extra headers) and
//! return a status; the dispatcher serializes the head and body into one
//! buffer and pushes it through the pump's write path. Default responses
//! for error statuses are built here too.

use crate::{
    coro::TaskHandle,
    errors::RequestError,
    http::{
        pump::{send_all, Io},
        types::{ConnFlags, RequestFlags, StatusCode},
    },
    Request,
};
use std::{borrow::Cow, io::Write, time::SystemTime};

/// Response under construction for one transaction.
pub struct Response {
    pub(crate) mime_type: Cow<'static, str>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) headers: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

impl Response {
    pub(crate) fn new() -> Self {
        Response {
            mime_type: Cow::Borrowed("text/plain"),
            buffer: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Sets the `Content-Type` of the response body.
    #[inline]
    pub fn set_mime_type(&mut self, mime: impl Into<Cow<'static, str>>) -> &mut Self {
        self.mime_type = mime.into();
        self
    }

    /// Appends bytes to the response body.
    #[inline]
    pub fn write(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.buffer.extend_from_slice(bytes.as_ref());
        self
    }

    /// Adds a header to the response head.
    #[inline]
    pub fn header(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

/// Serializes and sends a handler response.
pub(crate) async fn send_response(
    io: &dyn Io,
    task: &TaskHandle,
    req: &mut Request,
    resp: &Response,
    status: StatusCode,
) -> std::io::Result<()> {
    // A websocket upgrade already wrote its own head.
    if req.flags.contains(RequestFlags::RESPONSE_SENT_HEADERS) {
        return Ok(());
    }

    let head_only = req.flags.contains(RequestFlags::METHOD_HEAD);
    let mut out = Vec::with_capacity(resp.buffer.len() + 256);

    write_head(
        &mut out,
        status,
        req,
        Some((&resp.mime_type, resp.buffer.len())),
        &resp.headers,
    );
    if !head_only {
        out.extend_from_slice(&resp.buffer);
    }

    req.flags.insert(RequestFlags::RESPONSE_SENT_HEADERS);
    send_all(io, task, &out).await
}

/// Sends the canned response for a failed transaction.
pub(crate) async fn send_default(
    io: &dyn Io,
    task: &TaskHandle,
    req: &mut Request,
    error: RequestError,
    realm: Option<&str>,
) -> std::io::Result<()> {
    if req.flags.contains(RequestFlags::RESPONSE_SENT_HEADERS) {
        return Ok(());
    }

    let status = error.status();
    let body = status.default_body();

    let mut headers: Vec<(Cow<'static, str>, Cow<'static, str>)> = Vec::new();
    if let (RequestError::NotAuthorized, Some(realm)) = (error, realm) {
        headers.push((
            Cow::Borrowed("WWW-Authenticate"),
            Cow::Owned(format!("Basic realm=\"{realm}\"")),
        ));
    }

    let mut out = Vec::with_capacity(256);
    write_head(&mut out, status, req, Some(("text/plain", body.len())), &headers);
    if !req.flags.contains(RequestFlags::METHOD_HEAD) {
        out.extend_from_slice(body.as_bytes());
    }

    req.flags.insert(RequestFlags::RESPONSE_SENT_HEADERS);
    send_all(io, task, &out).await
}

fn write_head(
    out: &mut Vec<u8>,
    status: StatusCode,
    req: &Request,
    content: Option<(&str, usize)>,
    headers: &[(Cow<'static, str>, Cow<'static, str>)],
) {
    let http_1_0 = req.flags.contains(RequestFlags::IS_HTTP_1_0);
    let keep_alive = req.conn.contains(ConnFlags::KEEP_ALIVE);

    out.extend_from_slice(status.status_line(http_1_0));

    let _ = write!(out, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
    let _ = write!(
        out,
        "Connection: {}\r\n",
        if keep_alive { "keep-alive" } else { "close" }
    );

    if let Some((mime, len)) = content {
        let _ = write!(out, "Content-Type: {mime}\r\n");
        let _ = write!(out, "Content-Length: {len}\r\n");
    }

    for (name, value) in headers {
        let _ = write!(out, "{name}: {value}\r\n");
    }

    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{coro::Task, http::pump::MockIo, tools::drive_to_end, Request};
    use std::{cell::RefCell, rc::Rc};

    fn send(req: &str, build: impl FnOnce(&mut Response) -> StatusCode + 'static) -> String {
        let io = Rc::new(MockIo::default());
        let done = Rc::new(RefCell::new(false));
        let request = req.to_string();

        let task_io = io.clone();
        let task_done = done.clone();
        let mut task = Task::new(move |handle| async move {
            let mut req = Request::from_req(&request);
            req.parse().unwrap();

            let mut resp = Response::new();
            let status = build(&mut resp);

            send_response(task_io.as_ref(), &handle, &mut req, &resp, status)
                .await
                .unwrap();
            *task_done.borrow_mut() = true;
            0
        });

        drive_to_end(&mut task);
        assert!(*done.borrow());
        io.written_string()
    }

    #[test]
    fn response_head_and_body() {
        let written = send("GET / HTTP/1.1\r\n\r\n", |resp| {
            resp.set_mime_type("text/html").write("<p>hi</p>");
            StatusCode::Ok
        });

        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(written.contains("Connection: keep-alive\r\n"));
        assert!(written.contains("Content-Type: text/html\r\n"));
        assert!(written.contains("Content-Length: 9\r\n"));
        assert!(written.contains("Date: "));
        assert!(written.ends_with("\r\n\r\n<p>hi</p>"));
    }

    #[test]
    fn head_requests_suppress_the_body() {
        let written = send("HEAD / HTTP/1.1\r\n\r\n", |resp| {
            resp.write("invisible");
            StatusCode::Ok
        });

        assert!(written.contains("Content-Length: 9\r\n"));
        assert!(written.ends_with("\r\n\r\n"));
    }

    #[test]
    fn http_1_0_close_connection() {
        let written = send("GET / HTTP/1.0\r\n\r\n", |_| StatusCode::Ok);

        assert!(written.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(written.contains("Connection: close\r\n"));
    }

    #[test]
    fn default_response_carries_the_realm() {
        let io = Rc::new(MockIo::default());

        let task_io = io.clone();
        let mut task = Task::new(move |handle| async move {
            let mut req = Request::from_req("GET /secret HTTP/1.1\r\n\r\n");
            req.parse().unwrap();

            send_default(
                task_io.as_ref(),
                &handle,
                &mut req,
                RequestError::NotAuthorized,
                Some("vault"),
            )
            .await
            .unwrap();
            0
        });

        drive_to_end(&mut task);
        let written = io.written_string();

        assert!(written.starts_with("HTTP/1.1 401 Not Authorized\r\n"));
        assert!(written.contains("WWW-Authenticate: Basic realm=\"vault\"\r\n"));
        assert!(written.ends_with("401 Not Authorized"));
    }
}
