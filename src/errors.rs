use crate::http::types::StatusCode;
use thiserror::Error;

/// Request failures surfaced to the client as default responses.
///
/// Parser errors are never retried: each kind maps to one canned response,
/// the transaction is abandoned, and the connection survives only when a
/// pipelined follow-up request was already located in the buffer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed request")]
    BadRequest,
    #[error("authorization required")]
    NotAuthorized,
    #[error("method not allowed for this url")]
    NotAllowed,
    #[error("request entity over the configured limit")]
    TooLarge,
    #[error("client was too slow sending the request")]
    Timeout,
    #[error("no handler matches the url")]
    NotFound,
    #[error("internal error")]
    Internal,
}

impl RequestError {
    pub(crate) const fn status(self) -> StatusCode {
        match self {
            RequestError::BadRequest => StatusCode::BadRequest,
            RequestError::NotAuthorized => StatusCode::NotAuthorized,
            RequestError::NotAllowed => StatusCode::NotAllowed,
            RequestError::TooLarge => StatusCode::TooLarge,
            RequestError::Timeout => StatusCode::Timeout,
            RequestError::NotFound => StatusCode::NotFound,
            RequestError::Internal => StatusCode::InternalError,
        }
    }
}
