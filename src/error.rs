//! Error handling for the mock AMQP broker.
//!
//! This module defines the single error type shared by the codec, the
//! connection state machine, the broker state, and the HTTP control plane.
//! Every failure case in this crate eventually resolves to one of two
//! policies ("close the TCP connection" or "return an HTTP status"), so the
//! error type exists mostly to make that resolution a `match` at the top of
//! each driver loop rather than scattered `stream.shutdown()` calls.
//!
//! # Examples
//!
//! ```rust
//! use mock_amqp_broker::error::{AmqpError, AmqpResult};
//!
//! fn decode_tag(byte: u8) -> AmqpResult<()> {
//!     match byte {
//!         b's' | b'S' | b'I' => Ok(()),
//!         other => Err(AmqpError::invalid_field(other, 0)),
//!     }
//! }
//! ```

use thiserror::Error;

/// Errors produced anywhere in the broker.
#[derive(Error, Debug)]
pub enum AmqpError {
    #[error("frame error: {0}")]
    Frame(String),

    #[error("invalid field tag {tag:#x} at offset {offset}")]
    InvalidField { tag: u8, offset: usize },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("wait timed out")]
    WaitTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type used throughout the crate.
pub type AmqpResult<T> = Result<T, AmqpError>;

impl AmqpError {
    pub fn frame(msg: impl Into<String>) -> Self {
        AmqpError::Frame(msg.into())
    }

    pub fn invalid_field(tag: u8, offset: usize) -> Self {
        AmqpError::InvalidField { tag, offset }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        AmqpError::Protocol(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        AmqpError::Handshake(msg.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        AmqpError::Http(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AmqpError::InvalidState(msg.into())
    }

    /// A short machine-readable tag for the error kind, used in logging.
    pub fn error_code(&self) -> &'static str {
        match self {
            AmqpError::Frame(_) => "frame-error",
            AmqpError::InvalidField { .. } => "invalid-field",
            AmqpError::Protocol(_) => "protocol-error",
            AmqpError::Handshake(_) => "handshake-error",
            AmqpError::Http(_) => "http-error",
            AmqpError::WaitTimeout => "wait-timeout",
            AmqpError::Io(_) => "io-error",
            AmqpError::Serialization(_) => "serialization-error",
            AmqpError::InvalidState(_) => "invalid-state-error",
        }
    }

    /// Whether this error means the owning TCP connection must be closed.
    /// Every variant except `WaitTimeout` and `Http` (which resolve to a
    /// status code on an otherwise-reusable-until-closed connection) does.
    pub fn closes_connection(&self) -> bool {
        !matches!(self, AmqpError::WaitTimeout | AmqpError::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_formats_message() {
        let err = AmqpError::frame("short buffer");
        assert_eq!(err.to_string(), "frame error: short buffer");
        assert_eq!(err.error_code(), "frame-error");
    }

    #[test]
    fn invalid_field_carries_tag_and_offset() {
        let err = AmqpError::invalid_field(0x99, 42);
        match err {
            AmqpError::InvalidField { tag, offset } => {
                assert_eq!(tag, 0x99);
                assert_eq!(offset, 42);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn wait_timeout_does_not_close_connection() {
        assert!(!AmqpError::WaitTimeout.closes_connection());
    }

    #[test]
    fn protocol_error_closes_connection() {
        assert!(AmqpError::protocol("bad method").closes_connection());
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: AmqpError = io_err.into();
        assert_eq!(err.error_code(), "io-error");
    }
}
