//! Fixed-size bit set over classic node ids

use serde::{Deserialize, Serialize};
use std::fmt;
use zwave_protocol::types::MAX_CLASSIC_NODE_ID;
use zwave_protocol::NodeId;

use crate::error::{Result, RoutingError};

/// Bytes needed to hold one bit per classic node id
pub const NODE_MASK_LEN: usize = 29;

/// Bit vector over node ids 1..=232, bit `n - 1` for node `n`
///
/// Iteration is always in ascending node id order, which the route search
/// relies on for deterministic tie-breaking.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeMask {
    bits: [u8; NODE_MASK_LEN],
}

impl NodeMask {
    pub fn new() -> Self {
        NodeMask::default()
    }

    /// Build a mask from a list of nodes, rejecting long-range ids
    pub fn from_nodes<I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut mask = NodeMask::new();
        for node in nodes {
            mask.set(node)?;
        }
        Ok(mask)
    }

    fn position(node: NodeId) -> Result<(usize, u8)> {
        if node.is_long_range() {
            return Err(RoutingError::InvalidNode(node.as_u16()));
        }
        let index = node.mask_index();
        Ok((index / 8, 1 << (index % 8)))
    }

    pub fn set(&mut self, node: NodeId) -> Result<()> {
        let (byte, bit) = Self::position(node)?;
        self.bits[byte] |= bit;
        Ok(())
    }

    pub fn clear(&mut self, node: NodeId) -> Result<()> {
        let (byte, bit) = Self::position(node)?;
        self.bits[byte] &= !bit;
        Ok(())
    }

    /// Long-range ids are never members
    pub fn contains(&self, node: NodeId) -> bool {
        match Self::position(node) {
            Ok((byte, bit)) => self.bits[byte] & bit != 0,
            Err(_) => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..=MAX_CLASSIC_NODE_ID).filter_map(move |id| {
            let index = (id - 1) as usize;
            if self.bits[index / 8] & (1 << (index % 8)) != 0 {
                NodeId::new(id).ok()
            } else {
                None
            }
        })
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn union(&self, other: &NodeMask) -> NodeMask {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        out
    }

    pub fn intersection(&self, other: &NodeMask) -> NodeMask {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a &= *b;
        }
        out
    }

    /// Members of `self` not in `other`
    pub fn difference(&self, other: &NodeMask) -> NodeMask {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a &= !*b;
        }
        out
    }

    pub fn as_bytes(&self) -> &[u8; NODE_MASK_LEN] {
        &self.bits
    }

    /// Inverse of [`NodeMask::as_bytes`]; short input leaves the upper ids clear
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > NODE_MASK_LEN {
            return Err(RoutingError::MaskTooLong(bytes.len()));
        }
        let mut mask = NodeMask::new();
        mask.bits[..bytes.len()].copy_from_slice(bytes);
        Ok(mask)
    }
}

impl fmt::Debug for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.iter().map(|n| n.as_u16()))
            .finish()
    }
}
