//! # Common RPC Engine Types
//!
//! Shared vocabulary between the server engine and its embedders. The engine
//! treats requests and responses as opaque byte payloads; everything here is
//! about identifying calls and describing their outcomes, never about wire
//! encoding.
//!
//! ## Type Aliases
//!
//! - [`Payload`] - An opaque request or response body
//! - [`Reply`] - The outcome a handler produces: a payload or a [`Status`]
//!
//! ## Types
//!
//! - [`CallToken`] - Correlation token for one in-flight call
//! - [`ClusterId`] - Identity used for token-authenticated services
//! - [`Status`] / [`StatusCode`] - Failure descriptor for failed replies

use bytes::Bytes;
use core::fmt;

/// An opaque request or response body.
///
/// Decoding and validation belong to the embedding application; the engine
/// only moves these around.
pub type Payload = Bytes;

/// What a handler produces for one call: a response payload on success, or a
/// [`Status`] describing why the call failed.
pub type Reply = core::result::Result<Payload, Status>;

/// Correlation token identifying one in-flight call on its owning queue.
///
/// Tokens are allocated per queue and never reused within a queue's
/// lifetime; a completed call's token dangles on purpose, the engine panics
/// if an event ever references it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallToken(u64);

impl CallToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cluster identity required by token-authenticated services.
///
/// The all-zero value is "nil" and counts as absent: registering a
/// token-auth service against a nil identity fails at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId([u8; 16]);

impl ClusterId {
    pub const NIL: Self = Self([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Coarse classification of a failed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The client aborted the call.
    Cancelled,
    /// The client's deadline passed before a reply was written.
    DeadlineExceeded,
    /// The request was malformed or out of bounds.
    InvalidArgument,
    /// The handler hit an internal error.
    Internal,
    /// The server cannot take the call (e.g. shutting down).
    Unavailable,
    /// Anything else.
    Unknown,
}

/// Failure descriptor a handler attaches to an unsuccessful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_cluster_id_is_detected() {
        assert!(ClusterId::NIL.is_nil());
        assert!(ClusterId::from_bytes([0; 16]).is_nil());
        assert!(!ClusterId::from_bytes([7; 16]).is_nil());
    }

    #[test]
    fn cluster_id_displays_as_hex() {
        let id = ClusterId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }

    #[test]
    fn status_carries_code_and_message() {
        let status = Status::unavailable("draining");
        assert_eq!(status.code(), StatusCode::Unavailable);
        assert_eq!(status.message(), "draining");
        assert_eq!(status.to_string(), "Unavailable: draining");
    }

    #[test]
    fn call_token_roundtrips_raw_value() {
        let token = CallToken::new(42);
        assert_eq!(token.raw(), 42);
        assert_eq!(token.to_string(), "#42");
    }
}
