//! The per-transaction request object and its lazy accessors.
//!
//! A [`Request`] is bound to one connection for the duration of one HTTP
//! transaction. Everything the parser extracts lives as spans over the
//! connection's read buffer; cookies, query parameters, form bodies, the
//! `Range` header, and `If-Modified-Since` are parsed on first access,
//! gated by flags in the request flag word.

use crate::{
    coro::{TaskHandle, Yield},
    http::{
        body::PostBody,
        proxy::ProxyInfo,
        pump::{calculate_n_packets, Io},
        query::{self, KvArray, ValueDecoder},
        types::{ConnFlags, Method, RequestFlags, Span},
    },
    limits::ReqLimits,
    server::connection::ConnShared,
};
use std::{
    net::SocketAddr,
    rc::Rc,
    time::{Instant, SystemTime},
};

/// Which backing store the url/query spans currently index: the read
/// buffer, or the side buffer a handler rewrite installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum UrlStorage {
    #[default]
    Request,
    Rewritten,
}

/// A parsed `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeSpec {
    /// No `Range` header, or one without the `bytes=` unit.
    #[default]
    None,
    /// `bytes=FROM-TO`; `bytes=-TO` parses as `FromTo(0, TO)`.
    FromTo(u64, u64),
    /// `bytes=FROM-`.
    From(u64),
    /// Values beyond the file-offset range, or an unparsable byte range.
    Invalid,
}

/// Parser working state. One per connection, reused across transactions;
/// the buffer allocation survives resets.
pub(crate) struct Helper {
    pub(crate) buf: Box<[u8]>,
    pub(crate) len: usize,
    /// Start of a pipelined follow-up request located after `\r\n\r\n`.
    pub(crate) next_request: Option<usize>,

    /// Collected header lines, bounded by the parser.
    pub(crate) headers: Vec<Span>,

    pub(crate) accept_encoding: Option<Span>,
    pub(crate) connection: Option<Span>,
    pub(crate) content_type: Option<Span>,
    pub(crate) content_length: Option<Span>,
    pub(crate) if_modified_since: Option<Span>,
    pub(crate) range: Option<Span>,
    pub(crate) query_string: Option<Span>,

    pub(crate) body: PostBody,

    pub(crate) cookies: KvArray,
    pub(crate) query_params: KvArray,
    pub(crate) post_params: KvArray,
    pub(crate) if_modified_since_parsed: Option<SystemTime>,
    pub(crate) range_parsed: RangeSpec,

    pub(crate) rewritten_url: Vec<u8>,
    pub(crate) url_storage: UrlStorage,
    pub(crate) urls_rewritten: u32,

    pub(crate) error_when_time: Option<Instant>,
    pub(crate) error_when_n_packets: u32,
}

impl Helper {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Helper {
            buf: vec![0; buffer_size].into_boxed_slice(),
            len: 0,
            next_request: None,

            headers: Vec::new(),

            accept_encoding: None,
            connection: None,
            content_type: None,
            content_length: None,
            if_modified_since: None,
            range: None,
            query_string: None,

            body: PostBody::None,

            cookies: KvArray::new(),
            query_params: KvArray::new(),
            post_params: KvArray::new(),
            if_modified_since_parsed: None,
            range_parsed: RangeSpec::None,

            rewritten_url: Vec::new(),
            url_storage: UrlStorage::Request,
            urls_rewritten: 0,

            error_when_time: None,
            error_when_n_packets: calculate_n_packets(buffer_size),
        }
    }

    /// Clears per-transaction state. The buffer and a located pipelined
    /// carry-over survive; the pump moves the carry-over to the buffer
    /// start on the next read.
    pub(crate) fn reset(&mut self) {
        if self.next_request.is_none() {
            self.len = 0;
        }

        self.headers.clear();

        self.accept_encoding = None;
        self.connection = None;
        self.content_type = None;
        self.content_length = None;
        self.if_modified_since = None;
        self.range = None;
        self.query_string = None;

        self.body = PostBody::None;

        self.cookies.clear();
        self.query_params.clear();
        self.post_params.clear();
        self.if_modified_since_parsed = None;
        self.range_parsed = RangeSpec::None;

        self.rewritten_url.clear();
        self.url_storage = UrlStorage::Request;
        self.urls_rewritten = 0;

        self.error_when_time = None;
        self.error_when_n_packets = calculate_n_packets(self.buf.len());
    }
}

/// One HTTP transaction on one connection.
pub struct Request {
    pub(crate) flags: RequestFlags,
    pub(crate) url: Span,
    pub(crate) original_url: Span,
    pub(crate) proxy: Option<ProxyInfo>,
    pub(crate) helper: Helper,

    pub(crate) conn: Rc<ConnShared>,
    pub(crate) task: TaskHandle,
    pub(crate) io: Rc<dyn Io>,
    pub(crate) peer: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn new(
        limits: &ReqLimits,
        io: Rc<dyn Io>,
        task: TaskHandle,
        conn: Rc<ConnShared>,
        peer: Option<SocketAddr>,
    ) -> Self {
        let mut flags = RequestFlags::empty();
        if limits.allow_proxy_reqs {
            flags.insert(RequestFlags::ALLOW_PROXY_REQS);
        }

        Request {
            flags,
            url: Span::default(),
            original_url: Span::default(),
            proxy: None,
            helper: Helper::new(limits.buffer_size),

            conn,
            task,
            io,
            peer,
        }
    }

    /// Rearms the request for the next transaction on the same connection.
    /// The proxy endpoints recorded from the first request survive.
    pub(crate) fn reset_transaction(&mut self) {
        self.flags = self.flags.intersection(RequestFlags::PROXIED);
        self.url = Span::default();
        self.original_url = Span::default();
        self.helper.reset();
    }

    #[inline]
    pub(crate) fn url_backing(&self) -> &[u8] {
        match self.helper.url_storage {
            UrlStorage::Request => &self.helper.buf,
            UrlStorage::Rewritten => &self.helper.rewritten_url,
        }
    }

    pub(crate) fn find_header(&self, name: &[u8]) -> Option<Span> {
        for line in &self.helper.headers {
            if line.len < name.len() + 2 {
                continue;
            }

            let (n, rest) = line.slice(&self.helper.buf).split_at(name.len());
            if n.eq_ignore_ascii_case(name) && rest.starts_with(b": ") {
                return Some(Span::new(
                    line.start + name.len() + 2,
                    line.len - name.len() - 2,
                ));
            }
        }

        None
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub fn method(&self) -> Method {
        Method::from_flags(self.flags)
    }

    /// The decoded URL, after router prefix-stripping and any handler
    /// rewrite.
    #[inline(always)]
    pub fn url(&self) -> &[u8] {
        self.url.slice(self.url_backing())
    }

    /// The decoded URL as received, untouched by prefix-stripping and
    /// rewrites.
    #[inline(always)]
    pub fn original_url(&self) -> &[u8] {
        self.original_url.slice(&self.helper.buf)
    }

    #[inline]
    pub fn url_str(&self) -> Option<&str> {
        simdutf8::basic::from_utf8(self.url()).ok()
    }

    pub const fn is_http_1_0(&self) -> bool {
        self.flags.contains(RequestFlags::IS_HTTP_1_0)
    }

    /// First header whose name matches case-insensitively. The known
    /// headers the parser extracts itself are matched case-sensitively on
    /// their canonical spelling; this accessor is the lenient path.
    #[inline]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.find_header(name).map(|s| s.slice(&self.helper.buf))
    }

    /// Raw request body, when one was ingested.
    #[inline]
    pub fn body(&self) -> Option<&[u8]> {
        self.helper.body.bytes(&self.helper.buf)
    }

    #[inline]
    pub fn content_type(&self) -> Option<&[u8]> {
        self.helper.content_type.map(|s| s.slice(&self.helper.buf))
    }

    /// Source and destination the PROXY prefix advertised, if one was
    /// accepted on this connection.
    #[inline]
    pub const fn proxy(&self) -> Option<&ProxyInfo> {
        self.proxy.as_ref()
    }

    /// The peer address: the PROXY-advertised source when proxied
    /// (`None` for a LOCAL command), otherwise the socket peer.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        if self.flags.contains(RequestFlags::PROXIED) {
            return self.proxy.as_ref().and_then(|p| p.from);
        }
        self.peer
    }

    #[inline(always)]
    pub const fn accepts_deflate(&self) -> bool {
        self.flags.contains(RequestFlags::ACCEPT_DEFLATE)
    }

    #[inline(always)]
    pub const fn accepts_gzip(&self) -> bool {
        self.flags.contains(RequestFlags::ACCEPT_GZIP)
    }

    #[inline(always)]
    pub const fn accepts_brotli(&self) -> bool {
        self.flags.contains(RequestFlags::ACCEPT_BROTLI)
    }

    /// Replaces the URL and asks the dispatcher to route again. Takes
    /// effect only on routes that permit rewriting; bounded to four
    /// rewrites per request.
    pub fn rewrite(&mut self, new_url: &[u8]) {
        self.helper.rewritten_url.clear();
        self.helper.rewritten_url.extend_from_slice(new_url);
        self.flags.insert(RequestFlags::URL_REWRITTEN);
    }

    /// Parks the task on the worker's timer for `ms` milliseconds.
    pub async fn sleep(&mut self, ms: u64) {
        self.conn.sleep_for.set(ms);

        if !self.conn.contains(ConnFlags::HAS_REMOVE_SLEEP_DEFER) {
            self.conn.insert(ConnFlags::HAS_REMOVE_SLEEP_DEFER);

            let conn = self.conn.clone();
            self.task.defer(move || {
                conn.remove(ConnFlags::SUSPENDED_TIMER);
                conn.remove(ConnFlags::HAS_REMOVE_SLEEP_DEFER);
            });
        }

        self.conn.insert(ConnFlags::SUSPENDED_TIMER);
        self.task.pause(Yield::SuspendTimer).await;
        self.conn.remove(ConnFlags::SUSPENDED_TIMER);
    }
}

// Lazy accessors. Each parses once, gated by a flag in the request flag
// word; the parse mutates the backing buffer in place.
impl Request {
    pub fn cookie(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.parse_cookies_once();
        query::lookup(&self.helper.buf, &self.helper.cookies, key)
    }

    pub fn query_param(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.parse_query_string_once();

        let backing = match self.helper.url_storage {
            UrlStorage::Request => &self.helper.buf[..],
            UrlStorage::Rewritten => &self.helper.rewritten_url[..],
        };
        query::lookup(backing, &self.helper.query_params, key)
    }

    pub fn post_param(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.parse_post_params_once();

        let backing = match &self.helper.body {
            PostBody::None => return None,
            PostBody::Inline(_) => &self.helper.buf[..],
            PostBody::Heap(heap) => &heap[..],
            PostBody::File(map) => &map[..],
        };
        query::lookup(backing, &self.helper.post_params, key)
    }

    pub fn range(&mut self) -> RangeSpec {
        if !self.flags.contains(RequestFlags::PARSED_RANGE) {
            self.flags.insert(RequestFlags::PARSED_RANGE);

            if let Some(span) = self.helper.range {
                self.helper.range_parsed = parse_range_value(span.slice(&self.helper.buf));
            }
        }

        self.helper.range_parsed
    }

    pub fn if_modified_since(&mut self) -> Option<SystemTime> {
        if !self.flags.contains(RequestFlags::PARSED_IF_MODIFIED_SINCE) {
            self.flags.insert(RequestFlags::PARSED_IF_MODIFIED_SINCE);

            // Anything other than the exact IMF-fixdate shape is ignored.
            const IMF_FIXDATE_LEN: usize = "Wed, 17 Apr 2019 13:59:27 GMT".len();

            if let Some(span) = self.helper.if_modified_since {
                if span.len == IMF_FIXDATE_LEN {
                    self.helper.if_modified_since_parsed =
                        simdutf8::basic::from_utf8(span.slice(&self.helper.buf))
                            .ok()
                            .and_then(|raw| httpdate::parse_http_date(raw).ok());
                }
            }
        }

        self.helper.if_modified_since_parsed
    }

    fn parse_cookies_once(&mut self) {
        if self.flags.contains(RequestFlags::PARSED_COOKIES) {
            return;
        }
        self.flags.insert(RequestFlags::PARSED_COOKIES);

        let Some(span) = self.find_header(b"Cookie") else {
            return;
        };
        self.helper.cookies =
            query::parse_key_values(&mut self.helper.buf, span, b';', ValueDecoder::Identity);
    }

    fn parse_query_string_once(&mut self) {
        if self.flags.contains(RequestFlags::PARSED_QUERY_STRING) {
            return;
        }
        self.flags.insert(RequestFlags::PARSED_QUERY_STRING);

        let Some(span) = self.helper.query_string else {
            return;
        };

        let helper = &mut self.helper;
        helper.query_params = match helper.url_storage {
            UrlStorage::Request => {
                query::parse_key_values(&mut helper.buf, span, b'&', ValueDecoder::Url)
            }
            UrlStorage::Rewritten => {
                query::parse_key_values(&mut helper.rewritten_url, span, b'&', ValueDecoder::Url)
            }
        };
    }

    fn parse_post_params_once(&mut self) {
        if self.flags.contains(RequestFlags::PARSED_POST_DATA) {
            return;
        }
        self.flags.insert(RequestFlags::PARSED_POST_DATA);

        const FORM_URLENCODED: &[u8] = b"application/x-www-form-urlencoded";

        let Some(ct) = self.helper.content_type else {
            return;
        };
        if ct.len < FORM_URLENCODED.len()
            || &ct.slice(&self.helper.buf)[..FORM_URLENCODED.len()] != FORM_URLENCODED
        {
            return;
        }

        let helper = &mut self.helper;
        helper.post_params = match &mut helper.body {
            PostBody::None => KvArray::new(),
            PostBody::Inline(span) => {
                let span = *span;
                query::parse_key_values(&mut helper.buf, span, b'&', ValueDecoder::Url)
            }
            PostBody::Heap(heap) => {
                let span = Span::new(0, heap.len());
                query::parse_key_values(heap, span, b'&', ValueDecoder::Url)
            }
            PostBody::File(map) => {
                let span = Span::new(0, map.len());
                query::parse_key_values(map, span, b'&', ValueDecoder::Url)
            }
        };
    }
}

const OFF_MAX: u64 = i64::MAX as u64;

fn parse_range_value(raw: &[u8]) -> RangeSpec {
    let Some(rest) = raw.strip_prefix(b"bytes=") else {
        return RangeSpec::None;
    };
    if rest.is_empty() {
        return RangeSpec::None;
    }

    let (first, after) = take_u64(rest);
    match first {
        Ok(Some(from)) => {
            if after.first() != Some(&b'-') {
                return RangeSpec::Invalid;
            }
            match take_u64(&after[1..]).0 {
                Ok(Some(to)) if from <= OFF_MAX && to <= OFF_MAX => RangeSpec::FromTo(from, to),
                Ok(None) if from <= OFF_MAX => RangeSpec::From(from),
                _ => RangeSpec::Invalid,
            }
        }
        Ok(None) => {
            if rest.first() != Some(&b'-') {
                return RangeSpec::Invalid;
            }
            match take_u64(&rest[1..]).0 {
                Ok(Some(to)) if to <= OFF_MAX => RangeSpec::FromTo(0, to),
                _ => RangeSpec::Invalid,
            }
        }
        Err(()) => RangeSpec::Invalid,
    }
}

/// Leading decimal run; `Err` on arithmetic overflow, trailing bytes are
/// handed back for the caller to inspect.
fn take_u64(s: &[u8]) -> (Result<Option<u64>, ()>, &[u8]) {
    let digits = s.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return (Ok(None), s);
    }

    let mut value: u64 = 0;
    for &b in &s[..digits] {
        value = match value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
        {
            Some(v) => v,
            None => return (Err(()), &s[digits..]),
        };
    }

    (Ok(Some(value)), &s[digits..])
}


#[cfg(test)]
mod accessors {
    use super::*;
    use crate::tools::str;

    fn parsed(req: &str) -> Request {
        let mut request = Request::from_req(req);
        request.parse().unwrap();
        request
    }

    #[test]
    fn query_params_decode_and_gate() {
        let mut t = parsed("GET /a?b=1&c=%20 HTTP/1.0\r\n\r\n");

        assert_eq!(t.url(), b"/a");
        assert!(t.is_http_1_0());
        assert!(!t.flags.contains(RequestFlags::PARSED_QUERY_STRING));

        assert_eq!(str(t.query_param(b"b")), Some("1"));
        assert_eq!(str(t.query_param(b"c")), Some(" "));
        assert!(t.flags.contains(RequestFlags::PARSED_QUERY_STRING));

        // Idempotent: repeated access sees the same values.
        assert_eq!(str(t.query_param(b"b")), Some("1"));
        assert_eq!(t.query_param(b"missing"), None);
    }

    #[test]
    fn cookies() {
        let mut t = parsed("GET / HTTP/1.1\r\nCookie: name=wren; theme=dark\r\n\r\n");

        assert_eq!(str(t.cookie(b"name")), Some("wren"));
        assert_eq!(str(t.cookie(b"theme")), Some("dark"));
        assert_eq!(t.cookie(b"other"), None);
        assert_eq!(str(t.cookie(b"name")), Some("wren"));
    }

    #[test]
    fn generic_header_is_case_insensitive() {
        let t = parsed("GET / HTTP/1.1\r\nHost: x\r\nX-Custom: yes\r\n\r\n");

        assert_eq!(str(t.header(b"host")), Some("x"));
        assert_eq!(str(t.header(b"HOST")), Some("x"));
        assert_eq!(str(t.header(b"x-custom")), Some("yes"));
        assert_eq!(t.header(b"missing"), None);
    }

    #[test]
    fn range_specs() {
        #[rustfmt::skip]
        let cases = [
            ("bytes=0-499",            RangeSpec::FromTo(0, 499)),
            ("bytes=500-",             RangeSpec::From(500)),
            ("bytes=-500",             RangeSpec::FromTo(0, 500)),
            ("bytes=1-2,5-6",          RangeSpec::FromTo(1, 2)),
            ("bytes=9223372036854775807-", RangeSpec::From(9223372036854775807)),
            ("bytes=9223372036854775808-", RangeSpec::Invalid),
            ("bytes=99999999999999999999-", RangeSpec::Invalid),
            ("bytes=-",                RangeSpec::Invalid),
            ("bytes=a-b",              RangeSpec::Invalid),
            ("items=0-499",            RangeSpec::None),
        ];

        for (header, expected) in cases {
            let mut t = parsed(&format!("GET / HTTP/1.1\r\nRange: {header}\r\n\r\n"));
            assert_eq!(t.range(), expected, "{header:?}");
            assert_eq!(t.range(), expected, "second access of {header:?}");
        }
    }

    #[test]
    fn range_absent() {
        let mut t = parsed("GET / HTTP/1.1\r\n\r\n");
        assert_eq!(t.range(), RangeSpec::None);
    }

    #[test]
    fn if_modified_since_requires_imf_fixdate() {
        let mut t = parsed("GET / HTTP/1.1\r\nIf-Modified-Since: Wed, 17 Apr 2019 13:59:27 GMT\r\n\r\n");
        let parsed_time = t.if_modified_since().unwrap();
        assert_eq!(
            httpdate::fmt_http_date(parsed_time),
            "Wed, 17 Apr 2019 13:59:27 GMT"
        );

        // Wrong shape is silently ignored.
        let mut t = parsed("GET / HTTP/1.1\r\nIf-Modified-Since: 17 Apr 2019 13:59 GMT\r\n\r\n");
        assert_eq!(t.if_modified_since(), None);
    }

    #[test]
    fn rewrite_marks_the_request() {
        let mut t = parsed("GET /old HTTP/1.1\r\n\r\n");

        t.rewrite(b"/new?x=1");
        assert!(t.flags.contains(RequestFlags::URL_REWRITTEN));
        assert_eq!(t.helper.rewritten_url, b"/new?x=1");
    }
}
