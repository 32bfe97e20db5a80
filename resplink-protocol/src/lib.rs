//! # resplink-protocol
//!
//! RESP2/RESP3 wire protocol implementation for resplink.
//!
//! This crate provides:
//! - The `ReplyValue` model covering every RESP3 type
//! - Per-request decode configuration (`DecodeConfig`, `ReplyShape`)
//! - A resumable, chunk-driven reply decoder
//! - The request encoder (arrays of blob strings)

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod value;

pub use config::{
    BigNumberMode, BlobMode, DecodeConfig, DoubleMode, MapMode, ReplyShape, SetMode,
};
pub use decoder::{Decoder, Reply};
pub use encoder::Encoder;
pub use error::ProtocolError;
pub use value::{BigNumber, Blob, Double, ErrorKind, ErrorReply, MapReply, ReplyValue, SetReply};

/// Default port of RESP servers.
pub const DEFAULT_PORT: u16 = 6379;

/// Line terminator used by every RESP type.
pub const CRLF: &[u8; 2] = b"\r\n";
