//! Single-pass HTTP/1.x request-head parser.
//!
//! Operates in place on the connection's read buffer once the pump has
//! located a complete head: optional PROXY prefix, request line, bounded
//! header collection, known-header extraction, URL decode, and the
//! `Connection` token scan. Nothing is copied; every extracted value is a
//! span over the buffer.

use crate::{
    errors::RequestError,
    http::{
        proxy,
        request::Request,
        types::{ConnFlags, Method, RequestFlags, Span},
    },
};
use memchr::{memchr, memrchr};

/// Smallest parseable request head.
pub(crate) const MIN_REQUEST_SIZE: usize = "GET / HTTP/1.1\r\n\r\n".len();

/// Bound on collected header lines; one slot is reserved, so requests may
/// carry at most 63 headers.
pub(crate) const N_HEADER_START: usize = 64;

impl Request {
    /// Structures the buffered request head. On error the transaction is
    /// abandoned; the caller decides whether a pipelined follow-up keeps
    /// the connection alive.
    pub(crate) fn parse(&mut self) -> Result<(), RequestError> {
        let mut cursor = 0;

        if self.flags.contains(RequestFlags::ALLOW_PROXY_REQS) {
            cursor = proxy::parse_proxy_protocol(self, cursor).ok_or(RequestError::BadRequest)?;
        }

        cursor = self.skip_leading_whitespace(cursor);
        if cursor + MIN_REQUEST_SIZE > self.helper.len {
            return Err(RequestError::BadRequest);
        }

        // An unknown method gets 405 rather than 400 so that an already
        // pipelined follow-up request survives the failed transaction.
        let path = self
            .identify_method(cursor)
            .ok_or(RequestError::NotAllowed)?;
        let headers = self.identify_path(path).ok_or(RequestError::BadRequest)?;
        self.collect_headers(headers)?;

        let url = self.url;
        let decoded = url_decode(&mut self.helper.buf, url).ok_or(RequestError::BadRequest)?;
        self.url.len = decoded;
        self.original_url.len = decoded;

        self.parse_connection_header();

        Ok(())
    }

    fn skip_leading_whitespace(&self, mut cursor: usize) -> usize {
        while cursor < self.helper.len && is_space(self.helper.buf[cursor]) {
            cursor += 1;
        }
        cursor
    }

    fn identify_method(&mut self, cursor: usize) -> Option<usize> {
        let (bits, advance) = Method::from_bytes(&self.helper.buf[cursor..self.helper.len])?;
        self.flags.insert(bits);
        Some(cursor + advance)
    }

    /// Parses `/path[?query][#fragment] HTTP/1.x` and returns the offset
    /// of the first header line.
    fn identify_path(&mut self, path: usize) -> Option<usize> {
        const MIN_LINE: usize = "/ HTTP/1.0".len();
        const VERSION_LEN: usize = "HTTP/X.X".len();

        let len = self.helper.len;
        if *self.helper.buf.get(path)? != b'/' {
            return None;
        }

        let line_end = path + memchr(b'\r', &self.helper.buf[path..len])?;
        if line_end - path < MIN_LINE {
            return None;
        }

        // The byte before the version is taken as the separator; the URL
        // is everything from the path start up to it.
        let space = line_end - VERSION_LEN - 1;
        self.url = Span::new(path, space - path);
        self.parse_fragment_and_query(space);
        self.original_url = self.url;

        let version = &self.helper.buf[space + 1..line_end];
        if version == b"HTTP/1.0" {
            self.flags.insert(RequestFlags::IS_HTTP_1_0);
        } else if version != b"HTTP/1.1" {
            return None;
        }

        Some(line_end + 2)
    }

    /// Splits `#fragment` (discarded) and `?query` out of the current URL
    /// span. `end` is the offset just past the URL.
    pub(crate) fn parse_fragment_and_query(&mut self, mut end: usize) {
        // Fragments should never reach a server; tolerate them anyway.
        if let Some(fragment) = memrchr(b'#', self.url.slice(self.url_backing())) {
            end = self.url.start + fragment;
            self.url.len = fragment;
        }

        if let Some(query) = memchr(b'?', self.url.slice(self.url_backing())) {
            let at = self.url.start + query;
            self.helper.query_string = Some(Span::new(at + 1, end - at - 1));
            self.url.len = query;
        }
    }

    fn collect_headers(&mut self, start: usize) -> Result<(), RequestError> {
        let helper = &mut self.helper;
        let len = helper.len;
        let mut pos = start;

        if pos > len {
            return Err(RequestError::BadRequest);
        }

        loop {
            let cr = pos + memchr(b'\r', &helper.buf[pos..len]).ok_or(RequestError::BadRequest)?;

            if cr == pos {
                // Empty line terminates the block; bytes after it are a
                // pipelined follow-up request.
                if len - pos > 2 && helper.buf[pos..pos + 2] == *b"\r\n" {
                    helper.next_request = Some(pos + 2);
                }
                break;
            }

            // Minimal header shape is "H: V".
            if cr - pos < 4 {
                return Err(RequestError::BadRequest);
            }
            if helper.headers.len() >= N_HEADER_START - 1 {
                return Err(RequestError::BadRequest);
            }
            helper.headers.push(Span::new(pos, cr - pos));

            pos = cr + 2;
            if pos >= len {
                return Err(RequestError::BadRequest);
            }
        }

        // Known headers are matched by their canonical spelling, dispatched
        // on the first four bytes.
        for i in 0..helper.headers.len() {
            let line = helper.headers[i];

            let mut four = [0u8; 4];
            four.copy_from_slice(&helper.buf[line.start..line.start + 4]);

            match &four {
                b"Acce" => {
                    if let Some(v) = header_value(&helper.buf, line, b"Accept-Encoding") {
                        helper.accept_encoding = Some(v);
                    }
                }
                b"Conn" => {
                    if let Some(v) = header_value(&helper.buf, line, b"Connection") {
                        helper.connection = Some(v);
                    }
                }
                b"Cont" => {
                    if let Some(v) = header_value(&helper.buf, line, b"Content-Type") {
                        helper.content_type = Some(v);
                    } else if let Some(v) = header_value(&helper.buf, line, b"Content-Length") {
                        helper.content_length = Some(v);
                    }
                }
                b"If-M" => {
                    if let Some(v) = header_value(&helper.buf, line, b"If-Modified-Since") {
                        helper.if_modified_since = Some(v);
                    }
                }
                b"Rang" => {
                    if let Some(v) = header_value(&helper.buf, line, b"Range") {
                        helper.range = Some(v);
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Scans comma-separated `Connection` tokens. `upgrade` marks the
    /// connection; keep-alive is the HTTP/1.1 default unless `close`
    /// appears, and off for HTTP/1.0 unless explicitly requested.
    fn parse_connection_header(&mut self) {
        let mut has_keep_alive = false;
        let mut has_close = false;
        let mut has_upgrade = false;

        if let Some(span) = self.helper.connection {
            let value = span.slice(&self.helper.buf);
            let mut at = 0;

            loop {
                let token = &value[at..];
                let token = match token.first() {
                    Some(b' ') => &token[1..],
                    _ => token,
                };

                if token.len() >= 4 {
                    let mut four = [0u8; 4];
                    four.copy_from_slice(&token[..4]);
                    four.make_ascii_lowercase();

                    match &four {
                        b"keep" => has_keep_alive = true,
                        b"clos" => has_close = true,
                        b"upgr" => has_upgrade = true,
                        _ => {}
                    }
                }

                match memchr(b',', &value[at..]) {
                    Some(comma) => at += comma + 1,
                    None => break,
                }
            }
        }

        if has_upgrade {
            self.conn.insert(ConnFlags::IS_UPGRADE);
        }

        if !self.flags.contains(RequestFlags::IS_HTTP_1_0) {
            has_keep_alive = !has_close;
        }
        if has_keep_alive {
            self.conn.insert(ConnFlags::KEEP_ALIVE);
        } else {
            self.conn.remove(ConnFlags::KEEP_ALIVE);
        }
    }

    /// Scans `Accept-Encoding` tokens into request flags. Only invoked for
    /// routes that ask for it.
    pub(crate) fn parse_accept_encoding(&mut self) {
        let Some(span) = self.helper.accept_encoding else {
            return;
        };

        let mut add = RequestFlags::empty();
        let value = span.slice(&self.helper.buf);
        let mut at = 0;

        loop {
            let token = &value[at..];
            let token = match token.first() {
                Some(b' ') => &token[1..],
                _ => token,
            };

            let known = if token.len() >= 4 {
                let mut four = [0u8; 4];
                four.copy_from_slice(&token[..4]);
                match &four {
                    b"defl" => Some(RequestFlags::ACCEPT_DEFLATE),
                    b"gzip" => Some(RequestFlags::ACCEPT_GZIP),
                    _ => None,
                }
            } else {
                None
            };

            match known {
                Some(flag) => add.insert(flag),
                None => {
                    #[cfg(feature = "brotli")]
                    {
                        let trimmed = match token.iter().position(|b| *b != b' ') {
                            Some(i) => &token[i..],
                            None => &token[..0],
                        };
                        if trimmed.starts_with(b"br") {
                            add.insert(RequestFlags::ACCEPT_BROTLI);
                        }
                    }
                }
            }

            match memchr(b',', &value[at..]) {
                Some(comma) => at += comma + 1,
                None => break,
            }
        }

        self.flags.insert(add);
    }
}

fn header_value(buf: &[u8], line: Span, name: &[u8]) -> Option<Span> {
    let bytes = line.slice(buf);

    if bytes.len() < name.len() + 2 {
        return None;
    }
    if &bytes[..name.len()] != name {
        return None;
    }
    if &bytes[name.len()..name.len() + 2] != b": " {
        return None;
    }

    Some(Span::new(
        line.start + name.len() + 2,
        line.len - name.len() - 2,
    ))
}

#[inline(always)]
const fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Decodes percent-escapes and `+` in place within `span`, returning the
/// decoded length. `%00` and truncated or undecodable escapes are
/// rejected.
pub(crate) fn url_decode(buf: &mut [u8], span: Span) -> Option<usize> {
    let end = span.end();
    let mut read = span.start;
    let mut write = span.start;

    while read < end {
        match buf[read] {
            b'%' => {
                if read + 2 >= end {
                    return None;
                }

                let decoded =
                    decode_hex_digit(buf[read + 1]) << 4 | decode_hex_digit(buf[read + 2]);
                if decoded == 0 {
                    return None;
                }

                buf[write] = decoded;
                write += 1;
                read += 3;
            }
            b'+' => {
                buf[write] = b' ';
                write += 1;
                read += 1;
            }
            other => {
                buf[write] = other;
                write += 1;
                read += 1;
            }
        }
    }

    Some(write - span.start)
}

#[inline(always)]
const fn decode_hex_digit(ch: u8) -> u8 {
    match ch {
        b'0'..=b'9' => ch - b'0',
        b'a'..=b'f' => ch - b'a' + 10,
        b'A'..=b'F' => ch - b'A' + 10,
        _ => 0,
    }
}


#[cfg(test)]
mod url_decoding {
    use super::*;
    use crate::http::types::Span;

    fn decode(input: &str) -> Option<String> {
        let mut buf = input.as_bytes().to_vec();
        let len = url_decode(&mut buf, Span::new(0, input.len()))?;
        Some(String::from_utf8(buf[..len].to_vec()).unwrap())
    }

    #[test]
    fn cases() {
        #[rustfmt::skip]
        let cases = [
            ("/plain",      Some("/plain")),
            ("/a%20b",      Some("/a b")),
            ("/a+b",        Some("/a b")),
            ("%41%42%43",   Some("ABC")),
            ("%e2%82%ac",   Some("\u{20ac}")),
            ("",            Some("")),

            ("/%00",        None),
            ("/%",          None),
            ("/%4",         None),
            ("/%zz",        None),
        ];

        for (input, expected) in cases {
            assert_eq!(decode(input).as_deref(), expected, "{input:?}");
        }
    }

    #[test]
    fn round_trip_of_unreserved_and_escaped_printables() {
        // Decoding an encoded string and re-encoding it yields the same
        // decoded bytes again.
        let decoded = decode("/p%61th%2Fwith%20mixed+chars").unwrap();
        assert_eq!(decoded, "/path/with mixed chars");

        let reencoded: String = decoded
            .bytes()
            .map(|b| {
                if b == b' ' {
                    "%20".to_string()
                } else {
                    (b as char).to_string()
                }
            })
            .collect();
        assert_eq!(decode(&reencoded).unwrap(), decoded);
    }
}
