//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid node ID: {0}")]
    InvalidNodeId(u16),

    #[error("Node {0} cannot be addressed in a classic frame")]
    NotClassicNode(u16),

    #[error("Frame truncated: needed {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("Invalid header type: {0:#04x}")]
    InvalidHeaderType(u8),

    #[error("Too many repeaters: {0} (max 4)")]
    TooManyRepeaters(usize),

    #[error("Header extension too long: {len} bytes (max {max})")]
    ExtensionTooLong { len: usize, max: usize },

    #[error("Length field mismatch: header says {declared}, frame is {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Frame type {0} not supported by this channel profile")]
    UnsupportedFrameType(&'static str),

    #[error("Invalid explore header: {0}")]
    InvalidExploreHeader(String),
}
