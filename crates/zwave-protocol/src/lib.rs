//! Z-Wave Protocol Module
//!
//! This module defines the node addressing types and the bit-exact frame
//! header codecs for the 2-channel, 3-channel and long-range profiles.

pub mod error;
pub mod explore;
pub mod frame;
pub mod types;

pub use error::{ProtocolError, Result};
pub use explore::{ExploreCommand, ExploreHeader, ExploreOptions};
pub use frame::{
    Addressing, Frame, FrameHeader, Header2ch, Header3ch, HeaderExtension, HeaderLr, HeaderType,
    LrFrameKind, RouteStatus, RoutedHeader, WakeupBeam,
};
pub use types::{ChannelProfile, HomeId, ListeningMode, NodeId, Speed, MAX_REPEATERS};
