//! Request rejection taxonomy.
//!
//! Every way a request can fail before or during dispatch is one variant
//! here. The connection handler maps a [`Reject`] to a response at a
//! single point, so status codes, diagnostics and the keep/close decision
//! live in one table instead of being scattered through the pipeline.

use crate::http::types::StatusCode;
use thiserror::Error;

/// Framing failures raised by the HTTP parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{0}")]
    BadRequest(&'static str),
    /// The request target exceeds the configured URL length cap.
    #[error("request target too long")]
    UriTooLong,
    /// Declared `Content-Length` exceeds the body size cap.
    #[error("request body too large")]
    BodyTooLarge,
}

/// A rejected request, carrying everything needed to answer it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Reject {
    /// Malformed framing: bad request line, bad header, invalid
    /// `Content-Length`, disallowed `Transfer-Encoding`, oversized header
    /// block, or a body that never arrived.
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("request target too long")]
    UriTooLong,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("missing Host header")]
    HostMissing,
    #[error("host not allowed")]
    HostMismatch,
    /// Denied by the rate limiter; `retry_after` is whole seconds.
    #[error("{reason}")]
    RateLimited {
        reason: &'static str,
        retry_after: u64,
    },
    /// Path traversal or a resolved path escaping the resource root.
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("resource not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("{0}")]
    UnsupportedMediaType(&'static str),
    /// Body carried a syntactically invalid JSON document.
    #[error("invalid JSON body")]
    InvalidJson,
    #[error("internal server error")]
    Internal,
}

impl Reject {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Reject::BadRequest(_) | Reject::HostMissing | Reject::InvalidJson => {
                StatusCode::BadRequest
            }
            Reject::UriTooLong => StatusCode::UriTooLong,
            Reject::BodyTooLarge => StatusCode::PayloadTooLarge,
            Reject::HostMismatch | Reject::Forbidden(_) => StatusCode::Forbidden,
            Reject::RateLimited { .. } => StatusCode::TooManyRequests,
            Reject::NotFound => StatusCode::NotFound,
            Reject::MethodNotAllowed => StatusCode::MethodNotAllowed,
            Reject::UnsupportedMediaType(_) => StatusCode::UnsupportedMediaType,
            Reject::Internal => StatusCode::InternalServerError,
        }
    }

    /// Whether this rejection also tears the connection down.
    ///
    /// Framing and host failures close because the byte stream can no
    /// longer be trusted; application-level failures (404, 405, 415,
    /// traversal 403, rate 429, invalid JSON 400) keep the connection.
    pub(crate) fn closes_connection(&self) -> bool {
        match self {
            Reject::BadRequest(_)
            | Reject::UriTooLong
            | Reject::BodyTooLarge
            | Reject::HostMissing
            | Reject::HostMismatch
            | Reject::Internal => true,
            Reject::RateLimited { .. }
            | Reject::Forbidden(_)
            | Reject::NotFound
            | Reject::MethodNotAllowed
            | Reject::UnsupportedMediaType(_)
            | Reject::InvalidJson => false,
        }
    }

    /// Whether this rejection came from the admission layer (sizes,
    /// host, rate, path) as opposed to ordinary dispatch outcomes.
    pub(crate) fn is_admission(&self) -> bool {
        matches!(
            self,
            Reject::BadRequest(_)
                | Reject::UriTooLong
                | Reject::BodyTooLarge
                | Reject::HostMissing
                | Reject::HostMismatch
                | Reject::RateLimited { .. }
                | Reject::Forbidden(_)
        )
    }

    /// Short machine-readable label used for the rejection metrics.
    pub(crate) fn metric_reason(&self) -> &'static str {
        match self {
            Reject::BadRequest(_) => "bad_request",
            Reject::UriTooLong => "uri_too_long",
            Reject::BodyTooLarge => "body_too_large",
            Reject::HostMissing => "host_missing",
            Reject::HostMismatch => "host_mismatch",
            Reject::RateLimited { .. } => "rate_limited",
            Reject::Forbidden(_) => "forbidden_path",
            Reject::NotFound => "not_found",
            Reject::MethodNotAllowed => "method_not_allowed",
            Reject::UnsupportedMediaType(_) => "unsupported_media_type",
            Reject::InvalidJson => "invalid_json",
            Reject::Internal => "internal",
        }
    }
}

impl From<ParseError> for Reject {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::BadRequest(msg) => Reject::BadRequest(msg),
            ParseError::UriTooLong => Reject::UriTooLong,
            ParseError::BodyTooLarge => Reject::BodyTooLarge,
        }
    }
}
