//! Core protocol types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Highest node id in the classic (mesh routed) range
pub const MAX_CLASSIC_NODE_ID: u16 = 232;

/// First node id of the long-range range
pub const LR_FIRST_NODE_ID: u16 = 256;

/// Last node id of the long-range range
pub const LR_LAST_NODE_ID: u16 = 4000;

/// Broadcast sentinel in classic frames
pub const BROADCAST_CLASSIC: u16 = 0xFF;

/// Broadcast sentinel in long-range frames
pub const BROADCAST_LR: u16 = 0xFFF;

/// Maximum number of repeaters in a routed frame
pub const MAX_REPEATERS: usize = 4;

/// Identifier of a node in a Z-Wave network
///
/// Two disjoint ranges exist: classic ids (1..=232), which take part in mesh
/// routing, and long-range ids (256..=4000), which are always reached direct.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u16);

impl NodeId {
    /// Create a node id, rejecting 0, broadcast and ids outside both ranges
    pub fn new(id: u16) -> Result<Self> {
        let classic = (1..=MAX_CLASSIC_NODE_ID).contains(&id);
        let long_range = (LR_FIRST_NODE_ID..=LR_LAST_NODE_ID).contains(&id);
        if classic || long_range {
            Ok(NodeId(id))
        } else {
            Err(ProtocolError::InvalidNodeId(id))
        }
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_long_range(&self) -> bool {
        self.0 >= LR_FIRST_NODE_ID
    }

    /// Single-byte form used in 2CH/3CH headers
    pub fn classic_byte(&self) -> Result<u8> {
        if self.is_long_range() {
            return Err(ProtocolError::NotClassicNode(self.0));
        }
        Ok(self.0 as u8)
    }

    /// Zero-based bit index into a node mask
    pub fn mask_index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

impl TryFrom<u16> for NodeId {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self> {
        NodeId::new(value)
    }
}

impl TryFrom<u8> for NodeId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        NodeId::new(value as u16)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network identifier shared by every node in one network
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct HomeId(u32);

impl HomeId {
    pub fn new(id: u32) -> Self {
        HomeId(id)
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        HomeId(u32::from_be_bytes(bytes))
    }

    /// Parse from an 8 digit hex string
    pub fn from_hex(s: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let arr: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("Invalid HomeId length: expected 4, got {}", bytes.len()))?;
        Ok(HomeId::from_bytes(arr))
    }
}

impl fmt::Debug for HomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HomeId({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for HomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.to_bytes()))
    }
}

/// Radio data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Speed {
    Kbps9_6 = 1,
    Kbps40 = 2,
    Kbps100 = 3,
    Kbps100Lr = 4,
}

impl Speed {
    /// Classic speeds, fastest first
    pub const CLASSIC_DESCENDING: [Speed; 3] = [Speed::Kbps100, Speed::Kbps40, Speed::Kbps9_6];

    /// Largest frame the radio accepts at this speed (header, payload and trailer)
    pub fn max_frame_len(&self) -> usize {
        match self {
            Speed::Kbps9_6 | Speed::Kbps40 => 64,
            Speed::Kbps100 | Speed::Kbps100Lr => 170,
        }
    }

    /// Bytes of checksum/CRC appended by the PHY
    pub fn trailer_len(&self) -> usize {
        match self {
            Speed::Kbps9_6 | Speed::Kbps40 => 1,
            Speed::Kbps100 | Speed::Kbps100Lr => 2,
        }
    }

    /// Next classic speed below this one
    pub fn lower(&self) -> Option<Speed> {
        match self {
            Speed::Kbps100 => Some(Speed::Kbps40),
            Speed::Kbps40 => Some(Speed::Kbps9_6),
            Speed::Kbps9_6 | Speed::Kbps100Lr => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Speed> {
        match value {
            1 => Some(Speed::Kbps9_6),
            2 => Some(Speed::Kbps40),
            3 => Some(Speed::Kbps100),
            4 => Some(Speed::Kbps100Lr),
            _ => None,
        }
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speed::Kbps9_6 => write!(f, "9.6k"),
            Speed::Kbps40 => write!(f, "40k"),
            Speed::Kbps100 => write!(f, "100k"),
            Speed::Kbps100Lr => write!(f, "100k LR"),
        }
    }
}

/// Channel configuration, which decides the header layout on air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelProfile {
    #[default]
    TwoChannel,
    ThreeChannel,
    LongRange,
}

impl ChannelProfile {
    /// Total beam train duration for fragmented beams, in milliseconds
    pub fn fragmented_beam_train_ms(&self) -> Option<u32> {
        match self {
            ChannelProfile::TwoChannel => None,
            ChannelProfile::ThreeChannel => Some(3000),
            ChannelProfile::LongRange => Some(2000),
        }
    }
}

/// How often a node listens for traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Receiver always on
    #[default]
    AlwaysListening,
    /// FLiRS node waking every 250 ms
    Frequent250ms,
    /// FLiRS node waking every 1000 ms
    Frequent1000ms,
    /// Battery node reachable only after its own wake-up notification
    Sleeping,
}

impl ListeningMode {
    pub fn needs_beam(&self) -> bool {
        matches!(
            self,
            ListeningMode::Frequent250ms | ListeningMode::Frequent1000ms
        )
    }

    /// Continuous 2CH beam length in milliseconds
    pub fn beam_ms(&self) -> Option<u32> {
        match self {
            ListeningMode::Frequent250ms => Some(250),
            ListeningMode::Frequent1000ms => Some(1000),
            _ => None,
        }
    }
}
