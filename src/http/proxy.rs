//! PROXY protocol v1 (text) and v2 (binary) prefixes.
//!
//! When a connection is created with proxy support, the first request may
//! carry the real peer endpoints in front of the HTTP bytes. The v1 form
//! is a single CRLF-terminated ASCII line; the v2 form is a 16-byte
//! header followed by a declared number of address bytes.

use crate::http::{request::Request, types::RequestFlags};
use memchr::memchr;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Source and destination endpoints recovered from a PROXY prefix.
///
/// Both endpoints are `None` for a v2 `LOCAL` command, whose address
/// family is unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyInfo {
    pub from: Option<SocketAddr>,
    pub to: Option<SocketAddr>,
}

const V1_LINE_MAX: usize = 108;

pub(crate) const V2_SIG_LEN: usize = 16;
/// Two IPv6 addresses plus two ports; the largest address block v2 can
/// declare.
pub(crate) const V2_ADDR_MAX: usize = 36;
/// Bytes 4..12 of the v2 signature, located after the leading `\r\n\r\n`.
pub(crate) const V2_SIG_TAIL: [u8; 8] = [0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a];

/// Dispatches on the first four bytes: `PROX` starts a v1 line,
/// `\r\n\r\n` a v2 header, anything else leaves the cursor unchanged.
pub(crate) fn parse_proxy_protocol(req: &mut Request, cursor: usize) -> Option<usize> {
    let Some(first) = req.helper.buf.get(cursor..cursor + 4) else {
        return Some(cursor);
    };

    match first {
        [b'P', b'R', b'O', b'X'] => parse_v1(req, cursor),
        [b'\r', b'\n', b'\r', b'\n'] => parse_v2(req, cursor),
        _ => Some(cursor),
    }
}

fn parse_v1(req: &mut Request, cursor: usize) -> Option<usize> {
    let len = req.helper.len;
    let buf = &req.helper.buf[..len];

    let window_end = (cursor + V1_LINE_MAX).min(len);
    let cr = cursor + memchr(b'\r', &buf[cursor..window_end])?;
    if buf.get(cr + 1) != Some(&b'\n') {
        return None;
    }

    let mut tokens = buf[cursor..cr].split(|&b| b == b' ');
    if tokens.next()? != b"PROXY" {
        return None;
    }
    let protocol = tokens.next()?;
    let src_addr = tokens.next()?;
    let dst_addr = tokens.next()?;
    let src_port = tokens.next()?;
    let dst_port = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }

    let (from, to) = if protocol == b"TCP4" {
        (
            SocketAddr::from((parse_ipv4(src_addr)?, parse_port(src_port)?)),
            SocketAddr::from((parse_ipv4(dst_addr)?, parse_port(dst_port)?)),
        )
    } else if protocol == b"TCP6" {
        (
            SocketAddr::from((parse_ipv6(src_addr)?, parse_port(src_port)?)),
            SocketAddr::from((parse_ipv6(dst_addr)?, parse_port(dst_port)?)),
        )
    } else {
        return None;
    };

    req.proxy = Some(ProxyInfo {
        from: Some(from),
        to: Some(to),
    });
    req.flags.insert(RequestFlags::PROXIED);

    Some(cr + 2)
}

fn parse_v2(req: &mut Request, cursor: usize) -> Option<usize> {
    const LOCAL: u8 = 0x20;
    const PROXY: u8 = 0x21;
    const TCP4: u8 = 0x11;
    const TCP6: u8 = 0x21;

    let len = req.helper.len;
    let buf = &req.helper.buf[..len];

    let header = buf.get(cursor..cursor + V2_SIG_LEN)?;
    let cmd_ver = header[12];
    let family = header[13];
    let declared = u16::from_be_bytes([header[14], header[15]]) as usize;

    let size = V2_SIG_LEN + declared;
    if declared > V2_ADDR_MAX {
        return None;
    }
    // The HTTP request must follow the prefix within the buffer.
    if cursor + size >= len {
        return None;
    }

    let body = &buf[cursor + V2_SIG_LEN..cursor + size];

    let info = match cmd_ver {
        PROXY => match family {
            TCP4 => {
                if body.len() < 12 {
                    return None;
                }

                let src: [u8; 4] = body[0..4].try_into().ok()?;
                let dst: [u8; 4] = body[4..8].try_into().ok()?;
                let src_port = u16::from_be_bytes([body[8], body[9]]);
                let dst_port = u16::from_be_bytes([body[10], body[11]]);

                ProxyInfo {
                    from: Some(SocketAddr::from((Ipv4Addr::from(src), src_port))),
                    to: Some(SocketAddr::from((Ipv4Addr::from(dst), dst_port))),
                }
            }
            TCP6 => {
                if body.len() < 36 {
                    return None;
                }

                let src: [u8; 16] = body[0..16].try_into().ok()?;
                let dst: [u8; 16] = body[16..32].try_into().ok()?;
                let src_port = u16::from_be_bytes([body[32], body[33]]);
                let dst_port = u16::from_be_bytes([body[34], body[35]]);

                ProxyInfo {
                    from: Some(SocketAddr::from((Ipv6Addr::from(src), src_port))),
                    to: Some(SocketAddr::from((Ipv6Addr::from(dst), dst_port))),
                }
            }
            _ => return None,
        },
        LOCAL => ProxyInfo::default(),
        _ => return None,
    };

    req.proxy = Some(info);
    req.flags.insert(RequestFlags::PROXIED);

    Some(cursor + size)
}

fn parse_ipv4(bytes: &[u8]) -> Option<Ipv4Addr> {
    simdutf8::basic::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_ipv6(bytes: &[u8]) -> Option<Ipv6Addr> {
    simdutf8::basic::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_port(bytes: &[u8]) -> Option<u16> {
    if bytes.is_empty() || !bytes.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    simdutf8::basic::from_utf8(bytes).ok()?.parse().ok()
}
