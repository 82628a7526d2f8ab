//! Core HTTP protocol types shared by the parser and the dispatcher.

use bitflags::bitflags;

// SPAN

/// Byte range into a connection-owned buffer.
///
/// The parser never hands out raw pointers into the read buffer: every
/// extracted value is a span, resolved against the backing buffer at access
/// time. Decoding in place only ever shrinks a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Span {
    pub(crate) start: usize,
    pub(crate) len: usize,
}

impl Span {
    #[inline(always)]
    pub(crate) const fn new(start: usize, len: usize) -> Self {
        Span { start, len }
    }

    #[inline(always)]
    pub(crate) const fn end(&self) -> usize {
        self.start + self.len
    }

    #[inline(always)]
    pub(crate) fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end()]
    }
}

// FLAGS

bitflags! {
    /// Per-request flag word. Holds the method bits plus every lazily
    /// parsed / negotiated property of the transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct RequestFlags: u32 {
        const METHOD_GET     = 1 << 0;
        const METHOD_POST    = 1 << 1;
        const METHOD_HEAD    = 1 << 2;
        const METHOD_PUT     = 1 << 3;
        const METHOD_DELETE  = 1 << 4;
        const METHOD_OPTIONS = 1 << 5;

        const PROXIED          = 1 << 6;
        const IS_HTTP_1_0      = 1 << 7;
        const ALLOW_PROXY_REQS = 1 << 8;

        const ACCEPT_DEFLATE = 1 << 9;
        const ACCEPT_GZIP    = 1 << 10;
        const ACCEPT_BROTLI  = 1 << 11;

        const PARSED_RANGE             = 1 << 12;
        const PARSED_IF_MODIFIED_SINCE = 1 << 13;
        const PARSED_COOKIES           = 1 << 14;
        const PARSED_QUERY_STRING      = 1 << 15;
        const PARSED_POST_DATA         = 1 << 16;

        const URL_REWRITTEN         = 1 << 17;
        const RESPONSE_SENT_HEADERS = 1 << 18;
    }
}

bitflags! {
    /// Per-connection flag word; outlives individual transactions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct ConnFlags: u8 {
        const KEEP_ALIVE             = 1 << 0;
        const IS_UPGRADE             = 1 << 1;
        const IS_WEBSOCKET           = 1 << 2;
        const SUSPENDED_TIMER        = 1 << 3;
        const HAS_REMOVE_SLEEP_DEFER = 1 << 4;
    }
}

// METHOD

/// Recognized HTTP request methods.
///
/// The parser stores the method as a bit in the request flag word; this
/// enum is the public face of those bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Options,
}

impl Method {
    /// Matches a recognized method prefix (including its trailing space)
    /// against the start of the request line. Returns the flag bit and the
    /// cursor advance.
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Option<(RequestFlags, usize)> {
        match src {
            [b'G', b'E', b'T', b' ', ..] => Some((RequestFlags::METHOD_GET, 4)),
            [b'P', b'U', b'T', b' ', ..] => Some((RequestFlags::METHOD_PUT, 4)),
            [b'P', b'O', b'S', b'T', b' ', ..] => Some((RequestFlags::METHOD_POST, 5)),
            [b'H', b'E', b'A', b'D', b' ', ..] => Some((RequestFlags::METHOD_HEAD, 5)),
            [b'D', b'E', b'L', b'E', b'T', b'E', b' ', ..] => {
                Some((RequestFlags::METHOD_DELETE, 7))
            }
            [b'O', b'P', b'T', b'I', b'O', b'N', b'S', b' ', ..] => {
                Some((RequestFlags::METHOD_OPTIONS, 8))
            }
            _ => None,
        }
    }

    pub(crate) fn from_flags(flags: RequestFlags) -> Method {
        if flags.contains(RequestFlags::METHOD_POST) {
            Method::Post
        } else if flags.contains(RequestFlags::METHOD_HEAD) {
            Method::Head
        } else if flags.contains(RequestFlags::METHOD_PUT) {
            Method::Put
        } else if flags.contains(RequestFlags::METHOD_DELETE) {
            Method::Delete
        } else if flags.contains(RequestFlags::METHOD_OPTIONS) {
            Method::Options
        } else {
            Method::Get
        }
    }
}

// STATUS CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP status codes used by the engine and its handlers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            // First response line, e.g. `b"HTTP/1.1 200 OK\r\n"`.
            #[inline]
            pub(crate) const fn status_line(&self, http_1_0: bool) -> &'static [u8] {
                match (self, http_1_0) { $(
                    (StatusCode::$name, false) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, true) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            // Body of the default response for this status.
            #[inline]
            pub(crate) const fn default_body(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => concat!($num, " ", $str),
                )+ }
            }
        }
    }
}

set_status_codes! {
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    PartialContent = (206, "Partial Content");

    MovedPermanently = (301, "Moved Permanently");
    NotModified = (304, "Not Modified");

    BadRequest = (400, "Bad Request");
    NotAuthorized = (401, "Not Authorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    NotAllowed = (405, "Not Allowed");
    Timeout = (408, "Request Timeout");
    TooLarge = (413, "Request Entity Too Large");
    RangeUnsatisfiable = (416, "Requested Range Unsatisfiable");
    /// Unconditionally reserved for the teapots.
    ImATeapot = (418, "I'm a Teapot");

    InternalError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    Unavailable = (503, "Service Unavailable");
}

// PARSE HELPERS

/// Strict ASCII-decimal parse with checked arithmetic; tolerates
/// surrounding whitespace, rejects anything else.
#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    let trimmed = trim_ascii(bytes);
    if trimmed.is_empty() {
        return None;
    }

    let mut result: usize = 0;
    for &byte in trimmed {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

#[inline(always)]
pub(crate) fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
