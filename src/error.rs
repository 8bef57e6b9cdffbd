use thiserror::Error;

/// Errors produced by the streamux core.
///
/// `NegotiationFailed` and `MalformedHeader` are session-fatal: once
/// returned, the [`crate::Protocol`] that produced them latches a failed
/// state and every subsequent call returns the same error. Everything else
/// is recoverable: the session continues and only the triggering call
/// fails.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("malformed header: reserved bits 0x{0:x} were nonzero")]
    MalformedHeader(u32),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("id pool exhausted (id_bits too small for current load)")]
    IdPoolExhausted,

    #[error("sendable message for id {0} has already been ended")]
    MessageAlreadyEnded(u32),

    #[error("transport error: {0}")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;
