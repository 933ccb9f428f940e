//! Explore (flood search) header
//!
//! Layout following the destination id of an explore frame:
//! - ver_cmd (1 byte): version in bits 5-7, command in bits 0-4
//! - option (1 byte): source-routed, direction and stop flags
//! - random interval (1 byte): back-off window in 2 ms ticks
//! - ttl_count (1 byte): session TTL in bits 4-7, repeater count in bits 0-3
//! - repeaters (count bytes)

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::{NodeId, MAX_REPEATERS};

pub const EXPLORE_VERSION: u8 = 0x20;
pub const EXPLORE_VERSION_MASK: u8 = 0xE0;
pub const EXPLORE_COMMAND_MASK: u8 = 0x1F;
pub const EXPLORE_COUNT_MASK: u8 = 0x0F;
pub const EXPLORE_TTL_MASK: u8 = 0xF0;

/// Default random interval: 250 ticks of 2 ms
pub const EXPLORE_RANDOM_INTERVAL_DEFAULT: u8 = 250;

/// Default session TTL
pub const EXPLORE_TTL_DEFAULT: u8 = 4;

/// Fixed part of the explore header
pub const EXPLORE_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExploreCommand {
    Normal = 0x00,
    AutoInclusion = 0x01,
    SearchResult = 0x02,
    StopExplore = 0x03,
}

impl ExploreCommand {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ExploreCommand::Normal),
            0x01 => Ok(ExploreCommand::AutoInclusion),
            0x02 => Ok(ExploreCommand::SearchResult),
            0x03 => Ok(ExploreCommand::StopExplore),
            other => Err(ProtocolError::InvalidExploreHeader(format!(
                "unknown command {:#04x}",
                other
            ))),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExploreOptions: u8 {
        /// Route is embedded by the source; repeaters check their own position
        const SOURCE_ROUTED = 0x01;
        /// Repeater list is walked from the end
        const DIRECTION = 0x02;
        /// Receivers purge their explore queue
        const STOP = 0x04;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploreHeader {
    pub version: u8,
    pub command: ExploreCommand,
    pub options: ExploreOptions,
    pub random_interval: u8,
    pub ttl: u8,
    pub repeaters: Vec<NodeId>,
}

impl ExploreHeader {
    /// A fresh search originated by this node
    pub fn new_search(ttl: u8, random_interval: u8) -> Self {
        ExploreHeader {
            version: EXPLORE_VERSION,
            command: ExploreCommand::Normal,
            options: ExploreOptions::empty(),
            random_interval,
            ttl: ttl & 0x0F,
            repeaters: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        EXPLORE_HEADER_LEN + self.repeaters.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.repeaters.len() > MAX_REPEATERS {
            return Err(ProtocolError::TooManyRepeaters(self.repeaters.len()));
        }
        if self.ttl > 0x0F {
            return Err(ProtocolError::InvalidExploreHeader(format!(
                "ttl {} does not fit in 4 bits",
                self.ttl
            )));
        }
        buf.push((self.version & EXPLORE_VERSION_MASK) | (self.command as u8 & EXPLORE_COMMAND_MASK));
        buf.push(self.options.bits());
        buf.push(self.random_interval);
        buf.push((self.ttl << 4) | self.repeaters.len() as u8);
        for repeater in &self.repeaters {
            buf.push(repeater.classic_byte()?);
        }
        Ok(())
    }

    /// Decode from the start of `bytes`, returning the header and bytes consumed
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < EXPLORE_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: EXPLORE_HEADER_LEN,
                have: bytes.len(),
            });
        }
        let version = bytes[0] & EXPLORE_VERSION_MASK;
        let command = ExploreCommand::from_u8(bytes[0] & EXPLORE_COMMAND_MASK)?;
        let options = ExploreOptions::from_bits_truncate(bytes[1]);
        let random_interval = bytes[2];
        let ttl = (bytes[3] & EXPLORE_TTL_MASK) >> 4;
        let count = (bytes[3] & EXPLORE_COUNT_MASK) as usize;
        if count > MAX_REPEATERS {
            return Err(ProtocolError::TooManyRepeaters(count));
        }
        let needed = EXPLORE_HEADER_LEN + count;
        if bytes.len() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                have: bytes.len(),
            });
        }
        let repeaters = bytes[EXPLORE_HEADER_LEN..needed]
            .iter()
            .map(|b| NodeId::try_from(*b))
            .collect::<Result<Vec<_>>>()?;

        Ok((
            ExploreHeader {
                version,
                command,
                options,
                random_interval,
                ttl,
                repeaters,
            },
            needed,
        ))
    }

    /// Whether another repeater may append itself and forward the frame
    pub fn can_repeat(&self) -> bool {
        self.ttl > 0 && self.repeaters.len() < MAX_REPEATERS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u16) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_explore_wire_layout() {
        let header = ExploreHeader {
            version: EXPLORE_VERSION,
            command: ExploreCommand::SearchResult,
            options: ExploreOptions::DIRECTION,
            random_interval: 250,
            ttl: 3,
            repeaters: vec![node(7), node(9)],
        };
        let mut buf = Vec::new();
        header.encode_into(&mut buf).unwrap();
        assert_eq!(buf, vec![0x22, 0x02, 250, 0x32, 7, 9]);

        let (decoded, used) = ExploreHeader::decode(&buf).unwrap();
        assert_eq!(used, 6);
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_explore_rejects_bad_count() {
        // count nibble claims five repeaters
        let buf = [0x20, 0x00, 250, 0x45, 1, 2, 3, 4, 5];
        assert_eq!(
            ExploreHeader::decode(&buf),
            Err(ProtocolError::TooManyRepeaters(5))
        );

        let truncated = [0x20, 0x00, 250, 0x42, 1];
        assert!(matches!(
            ExploreHeader::decode(&truncated),
            Err(ProtocolError::Truncated { needed: 6, have: 5 })
        ));
    }

    #[test]
    fn test_can_repeat() {
        let mut header = ExploreHeader::new_search(1, EXPLORE_RANDOM_INTERVAL_DEFAULT);
        assert!(header.can_repeat());
        header.ttl = 0;
        assert!(!header.can_repeat());
        header.ttl = 2;
        header.repeaters = vec![node(1), node(2), node(3), node(4)];
        assert!(!header.can_repeat());
    }
}
