//! Error types for the transmission engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zwave_protocol::ProtocolError;
use zwave_routing::RoutingError;

pub type Result<T> = std::result::Result<T, TxError>;

/// Synchronous failures of engine operations
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Transmit queue full")]
    QueueFull,

    #[error("No slot left for delayed transmissions")]
    DelayedBudgetExhausted,

    #[error("Frame too large: {size} bytes payload (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Handle does not refer to a live transmission")]
    StaleHandle,

    #[error("Explore queue full")]
    NoExploreSlot,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Radio error: {0}")]
    Radio(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

/// Final outcome of an accepted transmission, reported through its callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Ok,
    /// Every route was tried and none was acknowledged
    NoAck,
    /// No route to the destination could be found
    NoRoute,
    /// The radio refused the frame as too long
    FrameTooLarge,
    Cancelled,
}

impl TxStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, TxStatus::Ok)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStatus::Ok => write!(f, "OK"),
            TxStatus::NoAck => write!(f, "No ACK"),
            TxStatus::NoRoute => write!(f, "No Route"),
            TxStatus::FrameTooLarge => write!(f, "Frame Too Large"),
            TxStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}
