//! Node adjacency store
//!
//! Holds the routing table (one neighbour row per classic node) together with
//! the per-node capabilities needed to decide whether a node may repeat and at
//! which speeds it can be reached.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use zwave_protocol::{ListeningMode, NodeId, Speed};

use crate::error::{Result, RoutingError};
use crate::node_mask::NodeMask;

bitflags! {
    /// Data rates a node can receive
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SpeedSupport: u8 {
        const KBPS_9_6 = 0x01;
        const KBPS_40 = 0x02;
        const KBPS_100 = 0x04;
        const KBPS_100_LR = 0x08;
    }
}

impl SpeedSupport {
    /// Every classic speed up to and including `max`
    pub fn up_to(max: Speed) -> Self {
        match max {
            Speed::Kbps9_6 => SpeedSupport::KBPS_9_6,
            Speed::Kbps40 => SpeedSupport::KBPS_9_6 | SpeedSupport::KBPS_40,
            Speed::Kbps100 => {
                SpeedSupport::KBPS_9_6 | SpeedSupport::KBPS_40 | SpeedSupport::KBPS_100
            }
            Speed::Kbps100Lr => SpeedSupport::KBPS_100_LR,
        }
    }

    pub fn supports(&self, speed: Speed) -> bool {
        let flag = match speed {
            Speed::Kbps9_6 => SpeedSupport::KBPS_9_6,
            Speed::Kbps40 => SpeedSupport::KBPS_40,
            Speed::Kbps100 => SpeedSupport::KBPS_100,
            Speed::Kbps100Lr => SpeedSupport::KBPS_100_LR,
        };
        self.contains(flag)
    }

    /// Node can only be reached at 9.6k
    pub fn is_9600_only(&self) -> bool {
        !self.intersects(SpeedSupport::KBPS_40 | SpeedSupport::KBPS_100)
    }
}

/// Capabilities of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node implements the routing (repeater) function
    pub routing: bool,
    pub listening: ListeningMode,
    pub speeds: SpeedSupport,
}

impl NodeInfo {
    /// Always-listening routing node supporting every classic speed
    pub fn repeater() -> Self {
        NodeInfo {
            routing: true,
            listening: ListeningMode::AlwaysListening,
            speeds: SpeedSupport::up_to(Speed::Kbps100),
        }
    }

    /// End device that never repeats
    pub fn end_device(listening: ListeningMode, max_speed: Speed) -> Self {
        NodeInfo {
            routing: false,
            listening,
            speeds: SpeedSupport::up_to(max_speed),
        }
    }
}

/// Routing table and node capabilities
#[derive(Debug, Clone, Default)]
pub struct AdjacencyStore {
    rows: BTreeMap<NodeId, NodeMask>,
    info: BTreeMap<NodeId, NodeInfo>,
    non_repeaters: NodeMask,
}

impl AdjacencyStore {
    pub fn new() -> Self {
        AdjacencyStore::default()
    }

    /// Register or update a node
    pub fn add_node(&mut self, node: NodeId, info: NodeInfo) -> Result<()> {
        if node.is_long_range() && info.routing {
            return Err(RoutingError::InvalidNode(node.as_u16()));
        }
        self.info.insert(node, info);
        Ok(())
    }

    /// Forget a node and remove it from every other node's row
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        self.info.remove(&node);
        if node.is_long_range() {
            return Ok(());
        }
        self.rows.remove(&node);
        for row in self.rows.values_mut() {
            row.clear(node)?;
        }
        self.non_repeaters.clear(node)?;
        debug!("Removed node {} from adjacency store", node);
        Ok(())
    }

    pub fn is_known(&self, node: NodeId) -> bool {
        self.info.contains_key(&node)
    }

    pub fn info(&self, node: NodeId) -> Option<&NodeInfo> {
        self.info.get(&node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.info.keys().copied()
    }

    /// Neighbour row of `node`; unknown classic nodes have an empty row
    pub fn get_neighbors(&self, node: NodeId) -> Result<NodeMask> {
        if node.is_long_range() {
            return Err(RoutingError::InvalidNode(node.as_u16()));
        }
        Ok(self.rows.get(&node).copied().unwrap_or_default())
    }

    pub fn set_neighbors(&mut self, node: NodeId, mask: NodeMask) -> Result<()> {
        if node.is_long_range() {
            return Err(RoutingError::InvalidNode(node.as_u16()));
        }
        let mut mask = mask;
        // A node is never its own neighbour
        mask.clear(node)?;
        self.rows.insert(node, mask);
        Ok(())
    }

    /// Known, routing capable and always listening
    pub fn is_repeater(&self, node: NodeId) -> bool {
        self.info.get(&node).map_or(false, |info| {
            info.routing && info.listening == ListeningMode::AlwaysListening
        })
    }

    pub fn supports_speed(&self, node: NodeId, speed: Speed) -> bool {
        self.info
            .get(&node)
            .map_or(false, |info| info.speeds.supports(speed))
    }

    pub fn is_9600_only(&self, node: NodeId) -> bool {
        self.info
            .get(&node)
            .map_or(false, |info| info.speeds.is_9600_only())
    }

    pub fn listening_mode(&self, node: NodeId) -> Option<ListeningMode> {
        self.info.get(&node).map(|info| info.listening)
    }

    /// Repeaters among the known classic nodes
    pub fn repeaters(&self) -> NodeMask {
        let mut mask = NodeMask::new();
        for node in self.info.keys().filter(|n| self.is_repeater(**n)) {
            // is_repeater only holds for classic nodes
            let _ = mask.set(*node);
        }
        mask
    }

    /// Last non-repeater list produced by routing-table analysis
    pub fn non_repeaters(&self) -> NodeMask {
        self.non_repeaters
    }

    pub fn set_non_repeaters(&mut self, mask: NodeMask) {
        self.non_repeaters = mask;
    }
}
