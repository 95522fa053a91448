//! Error type shared by every gateway operation.

use crate::protocol::ErrorShape;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The handshake did not complete within the connect budget.
    #[error("timed out connecting to gateway")]
    ConnectTimeout,

    /// The gateway answered the connect request with anything but hello-ok.
    #[error("gateway rejected connect: {0}")]
    ConnectRejected(String),

    #[error("request {method} timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    /// The socket closed while the request was in flight.
    #[error("connection to gateway lost")]
    ConnectionLost,

    #[error("not connected to gateway")]
    NotConnected,

    /// Structured error returned by the gateway for a request.
    #[error("gateway error {code}: {message}")]
    Remote {
        code: String,
        message: String,
        retryable: bool,
    },

    /// The client was shut down with `destroy()`.
    #[error("gateway client destroyed")]
    Destroyed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl GatewayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::ConnectTimeout => "connect_timeout",
            Self::ConnectRejected(_) => "connect_rejected",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::ConnectionLost => "connection_lost",
            Self::NotConnected => "not_connected",
            Self::Remote { .. } => "remote_error",
            Self::Destroyed => "destroyed",
            Self::Transport(_) => "transport_error",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }

    /// Whether the same call could succeed if issued again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectTimeout
            | Self::RequestTimeout { .. }
            | Self::ConnectionLost
            | Self::NotConnected
            | Self::Transport(_) => true,
            Self::Remote { retryable, .. } => *retryable,
            Self::ConnectRejected(_) | Self::Destroyed | Self::InvalidPayload(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::RequestTimeout { .. })
    }
}

impl From<ErrorShape> for GatewayError {
    fn from(shape: ErrorShape) -> Self {
        Self::Remote {
            code: shape.code,
            message: shape.message,
            retryable: shape.retryable.unwrap_or(false),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
