//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding a reply stream.
///
/// Every variant is fatal for the decoder instance: once byte alignment is
/// lost there is no safe point to resume from, so the decoder must be reset
/// and every pending request flushed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid type tag: {0:#04x}")]
    InvalidTag(u8),

    #[error("invalid digit in numeric field: {byte:#04x}")]
    InvalidDigit { byte: u8 },

    #[error("invalid length: {0}")]
    InvalidLength(i64),

    #[error("numeric field overflow")]
    Overflow,

    #[error("expected CRLF terminator, got {found:#04x}")]
    ExpectedCrlf { found: u8 },

    #[error("invalid boolean: {0:#04x}")]
    InvalidBoolean(u8),

    #[error("invalid double literal")]
    InvalidDouble,

    #[error("invalid verbatim string: missing format prefix")]
    InvalidVerbatim,

    #[error("decoder poisoned by an earlier protocol error")]
    Poisoned,
}
