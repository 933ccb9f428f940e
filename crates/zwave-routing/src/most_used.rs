//! Most-used entry point table
//!
//! Tracks which first-hop repeaters have recently carried traffic so the
//! route search tries them before anything else. Slots 0..5 are reserved for
//! entry points that support 40k or better; 9.6k-only nodes may only use
//! slots 5..10.

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use zwave_protocol::{NodeId, Speed};

use crate::adjacency::{AdjacencyStore, SpeedSupport};
use crate::node_mask::NodeMask;
use crate::persistence::{NvmKey, NvmStore};

/// Number of entries in the table
pub const MOST_USED_SIZE: usize = 10;

/// Slots reserved for entry points supporting 40k or better
pub const MOST_USED_HIGH_SPEED_SLOTS: usize = 5;

/// Saturation value of the usage counter
pub const MOST_USED_COUNTER_MAX: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MostUsedEntry {
    pub node: NodeId,
    /// Usage counter, 0..=0x1F
    pub counter: u8,
    /// Already returned (or updated) during the current route search
    pub used: bool,
    pub speeds: SpeedSupport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MostUsedTable {
    slots: [Option<MostUsedEntry>; MOST_USED_SIZE],
}

impl MostUsedTable {
    pub fn new() -> Self {
        MostUsedTable::default()
    }

    /// Record the outcome of a transmission through `entry_point`
    ///
    /// Returns false when the node is not a repeater and the table is unchanged.
    pub fn update(&mut self, success: bool, entry_point: NodeId, adj: &AdjacencyStore) -> bool {
        if entry_point.is_long_range() || !adj.is_repeater(entry_point) {
            return false;
        }

        if let Some(entry) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.node == entry_point)
        {
            entry.counter = if success {
                (entry.counter + 1).min(MOST_USED_COUNTER_MAX)
            } else {
                entry.counter.saturating_sub(1)
            };
            entry.used = true;
            trace!("Most-used {} counter now {}", entry_point, entry.counter);
            return true;
        }

        let speeds = adj
            .info(entry_point)
            .map(|info| info.speeds)
            .unwrap_or(SpeedSupport::KBPS_9_6);
        let start = if speeds.is_9600_only() {
            MOST_USED_HIGH_SPEED_SLOTS
        } else {
            0
        };

        let slot = match (start..MOST_USED_SIZE).find(|i| self.slots[*i].is_none()) {
            Some(free) => free,
            // Full: replace the least used entry in the permitted range
            None => match (start..MOST_USED_SIZE)
                .min_by_key(|i| self.slots[*i].map_or(0, |e| e.counter))
            {
                Some(victim) => victim,
                None => return false,
            },
        };

        self.slots[slot] = Some(MostUsedEntry {
            node: entry_point,
            counter: u8::from(success),
            used: true,
            speeds,
        });
        trace!("Most-used {} placed in slot {}", entry_point, slot);
        true
    }

    /// Highest-counter entry not yet returned in this search
    ///
    /// Skips nodes in `exclude` and nodes that cannot be reached at `speed`.
    /// The returned entry is marked used.
    pub fn next_entry_point(&mut self, exclude: &NodeMask, speed: Speed) -> Option<NodeId> {
        let mut best: Option<&mut MostUsedEntry> = None;
        for entry in self.slots.iter_mut().flatten() {
            if entry.used || exclude.contains(entry.node) || !entry.speeds.supports(speed) {
                continue;
            }
            if best.as_ref().map_or(true, |b| entry.counter > b.counter) {
                best = Some(entry);
            }
        }
        best.map(|entry| {
            entry.used = true;
            entry.node
        })
    }

    /// Start of a new route search: every entry may be returned again
    pub fn reset_used(&mut self) {
        for entry in self.slots.iter_mut().flatten() {
            entry.used = false;
        }
    }

    pub fn delete(&mut self, node: NodeId) {
        for slot in self.slots.iter_mut() {
            if slot.map_or(false, |e| e.node == node) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None; MOST_USED_SIZE];
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.entries().any(|e| e.node == node)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MostUsedEntry> {
        self.slots.iter().flatten()
    }

    /// Entry at a physical slot, for inspection
    pub fn slot(&self, index: usize) -> Option<&MostUsedEntry> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Drop entries that are no longer neighbouring repeaters of this node
    pub fn prune(&mut self, own_neighbors: &NodeMask, adj: &AdjacencyStore) {
        for slot in self.slots.iter_mut() {
            let stale = slot.map_or(false, |e| {
                !own_neighbors.contains(e.node) || !adj.is_repeater(e.node)
            });
            if stale {
                *slot = None;
            }
        }
    }

    /// Fill free slots with `candidates` not already present (counter 0)
    pub fn seed(&mut self, candidates: &NodeMask, adj: &AdjacencyStore) {
        for node in candidates.iter() {
            if self.contains(node) || !adj.is_repeater(node) {
                continue;
            }
            let speeds = adj
                .info(node)
                .map(|info| info.speeds)
                .unwrap_or(SpeedSupport::KBPS_9_6);
            let start = if speeds.is_9600_only() {
                MOST_USED_HIGH_SPEED_SLOTS
            } else {
                0
            };
            if let Some(free) = (start..MOST_USED_SIZE).find(|i| self.slots[*i].is_none()) {
                self.slots[free] = Some(MostUsedEntry {
                    node,
                    counter: 0,
                    used: false,
                    speeds,
                });
            }
        }
    }

    pub fn persist(&self, nvm: &mut dyn NvmStore) {
        let outcome = bincode::serialize(self)
            .map_err(Into::into)
            .and_then(|bytes| nvm.write(NvmKey::MostUsed, &bytes));
        if let Err(e) = outcome {
            warn!("Failed to persist most-used table: {}", e);
        }
    }

    /// Load the table from `nvm`; an unreadable record leaves an empty table
    pub fn restore(nvm: &dyn NvmStore) -> Self {
        match nvm.read(NvmKey::MostUsed) {
            Ok(Some(bytes)) => bincode::deserialize(&bytes).unwrap_or_else(|e| {
                warn!("Failed to decode most-used table: {}", e);
                MostUsedTable::new()
            }),
            Ok(None) => MostUsedTable::new(),
            Err(e) => {
                warn!("Failed to read most-used table: {}", e);
                MostUsedTable::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjacency::NodeInfo;
    use crate::persistence::MemoryNvm;
    use zwave_protocol::ListeningMode;

    fn node(id: u16) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn network() -> AdjacencyStore {
        let mut adj = AdjacencyStore::new();
        for id in 2..=20 {
            adj.add_node(node(id), NodeInfo::repeater()).unwrap();
        }
        for id in 30..=40 {
            adj.add_node(
                node(id),
                NodeInfo {
                    routing: true,
                    listening: ListeningMode::AlwaysListening,
                    speeds: SpeedSupport::up_to(Speed::Kbps9_6),
                },
            )
            .unwrap();
        }
        adj.add_node(
            node(50),
            NodeInfo::end_device(ListeningMode::Sleeping, Speed::Kbps100),
        )
        .unwrap();
        adj
    }

    #[test]
    fn test_update_counts_and_saturates() {
        let adj = network();
        let mut table = MostUsedTable::new();
        assert!(table.update(true, node(2), &adj));
        assert_eq!(table.slot(0).unwrap().counter, 1);

        for _ in 0..40 {
            table.update(true, node(2), &adj);
        }
        assert_eq!(table.slot(0).unwrap().counter, MOST_USED_COUNTER_MAX);

        table.update(false, node(2), &adj);
        assert_eq!(table.slot(0).unwrap().counter, MOST_USED_COUNTER_MAX - 1);
        assert!(table.slot(0).unwrap().used);
    }

    #[test]
    fn test_non_repeaters_ignored() {
        let adj = network();
        let mut table = MostUsedTable::new();
        assert!(!table.update(true, node(50), &adj));
        assert!(!table.update(true, node(99), &adj));
        assert_eq!(table.entries().count(), 0);
    }

    #[test]
    fn test_9600_only_nodes_use_upper_slots() {
        let adj = network();
        let mut table = MostUsedTable::new();
        table.update(true, node(30), &adj);
        assert!(table.slot(0).is_none());
        assert_eq!(table.slot(MOST_USED_HIGH_SPEED_SLOTS).unwrap().node, node(30));
    }

    #[test]
    fn test_full_table_evicts_lowest_counter() {
        let adj = network();
        let mut table = MostUsedTable::new();
        for id in 2..=11 {
            table.update(true, node(id), &adj);
            table.update(true, node(id), &adj);
        }
        // node 6 drops to the lowest count
        table.update(false, node(6), &adj);
        table.update(false, node(6), &adj);

        table.update(true, node(12), &adj);
        assert!(!table.contains(node(6)));
        assert!(table.contains(node(12)));

        // a 9.6k node may only evict from the upper half
        table.update(true, node(30), &adj);
        let slot = (0..MOST_USED_SIZE)
            .find(|i| table.slot(*i).map(|e| e.node) == Some(node(30)))
            .unwrap();
        assert!(slot >= MOST_USED_HIGH_SPEED_SLOTS);
    }

    #[test]
    fn test_next_entry_point_order() {
        let adj = network();
        let mut table = MostUsedTable::new();
        table.update(true, node(2), &adj);
        for _ in 0..3 {
            table.update(true, node(3), &adj);
        }
        table.update(true, node(30), &adj);
        table.update(true, node(30), &adj);
        table.reset_used();

        let none = NodeMask::new();
        assert_eq!(table.next_entry_point(&none, Speed::Kbps40), Some(node(3)));
        assert_eq!(table.next_entry_point(&none, Speed::Kbps40), Some(node(2)));
        // node 30 cannot carry 40k
        assert_eq!(table.next_entry_point(&none, Speed::Kbps40), None);

        table.reset_used();
        let exclude = NodeMask::from_nodes([node(3)]).unwrap();
        assert_eq!(table.next_entry_point(&exclude, Speed::Kbps9_6), Some(node(30)));
    }

    #[test]
    fn test_delete_and_clear() {
        let adj = network();
        let mut table = MostUsedTable::new();
        table.update(true, node(2), &adj);
        table.update(true, node(3), &adj);
        table.delete(node(2));
        assert!(!table.contains(node(2)));
        assert!(table.contains(node(3)));
        table.clear();
        assert_eq!(table.entries().count(), 0);
    }

    #[test]
    fn test_prune_and_seed() {
        let adj = network();
        let mut table = MostUsedTable::new();
        table.update(true, node(2), &adj);
        table.update(true, node(3), &adj);

        let own = NodeMask::from_nodes([node(3), node(4), node(50)]).unwrap();
        table.prune(&own, &adj);
        assert!(!table.contains(node(2)));

        table.seed(&own, &adj);
        assert!(table.contains(node(4)));
        assert!(!table.contains(node(50)));
        assert_eq!(table.entries().count(), 2);
    }

    #[test]
    fn test_persist_restore() {
        let adj = network();
        let mut nvm = MemoryNvm::new();
        let mut table = MostUsedTable::new();
        table.update(true, node(7), &adj);
        table.persist(&mut nvm);

        let restored = MostUsedTable::restore(&nvm);
        assert_eq!(restored, table);
        assert_eq!(MostUsedTable::restore(&MemoryNvm::new()), MostUsedTable::new());
    }
}
