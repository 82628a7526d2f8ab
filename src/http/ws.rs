//! WebSocket upgrade handshake.
//!
//! The engine only performs the handshake: key validation, the accept
//! digest, and the `101 Switching Protocols` response. After the upgrade
//! the task yields for read/write readiness and the handler owns the
//! socket bytes.

use crate::{
    coro::Yield,
    errors::RequestError,
    http::types::{ConnFlags, RequestFlags, StatusCode},
    Request,
};
use sha1::{Digest, Sha1};

const WEBSOCKET_UUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(SHA1(key || websocket uuid))` for a base64-valid client key.
pub(crate) fn handshake_accept(key: &[u8]) -> Option<String> {
    if key.is_empty() || base64::decode(key).is_err() {
        return None;
    }

    let mut digest = Sha1::new();
    digest.update(key);
    digest.update(WEBSOCKET_UUID);

    Some(base64::encode(digest.finalize()))
}

impl Request {
    /// Performs the WebSocket handshake for a handler that decided to
    /// upgrade. Emits the `101` response, marks the connection as a
    /// websocket, and waits for read/write readiness.
    pub async fn websocket_upgrade(&mut self) -> Result<(), RequestError> {
        if self.flags.contains(RequestFlags::RESPONSE_SENT_HEADERS) {
            return Err(RequestError::Internal);
        }
        if !self.conn.contains(ConnFlags::IS_UPGRADE) {
            return Err(RequestError::BadRequest);
        }

        let upgrade = self.header(b"Upgrade").ok_or(RequestError::BadRequest)?;
        if upgrade != b"websocket" {
            return Err(RequestError::BadRequest);
        }

        let key = self
            .header(b"Sec-WebSocket-Key")
            .ok_or(RequestError::BadRequest)?;
        let accept = handshake_accept(key).ok_or(RequestError::BadRequest)?;

        let mut head = Vec::with_capacity(160);
        head.extend_from_slice(
            StatusCode::SwitchingProtocols.status_line(self.flags.contains(RequestFlags::IS_HTTP_1_0)),
        );
        head.extend_from_slice(b"Upgrade: websocket\r\nConnection: Upgrade\r\n");
        head.extend_from_slice(b"Sec-WebSocket-Accept: ");
        head.extend_from_slice(accept.as_bytes());
        head.extend_from_slice(b"\r\n\r\n");

        let io = self.io.clone();
        crate::http::pump::send_all(io.as_ref(), &self.task, &head)
            .await
            .map_err(|_| RequestError::Internal)?;

        self.flags.insert(RequestFlags::RESPONSE_SENT_HEADERS);
        self.conn.insert(ConnFlags::IS_WEBSOCKET);
        self.task.pause(Yield::WantReadWrite).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_from_rfc_example() {
        assert_eq!(
            handshake_accept(b"dGhlIHNhbXBsZSBub25jZQ==").as_deref(),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert_eq!(handshake_accept(b""), None);
        assert_eq!(handshake_accept(b"not base64 at all!!"), None);
    }
}
