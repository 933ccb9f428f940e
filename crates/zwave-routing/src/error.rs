//! Routing error types

use thiserror::Error;

/// Routing-specific errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Invalid node for routing: {0}")]
    InvalidNode(u16),

    #[error("Route too long: {0} repeaters (max 4)")]
    RouteTooLong(usize),

    #[error("Node mask too long: {0} bytes (max 29)")]
    MaskTooLong(usize),

    #[error("Route cache is locked")]
    CacheLocked,

    #[error("Protocol error: {0}")]
    Protocol(#[from] zwave_protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
