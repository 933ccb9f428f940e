//! Routing-table analysis
//!
//! Selects a set of preferred repeaters that together reach the whole network.
//! The work is split into small steps so the protocol task can interleave it
//! with radio traffic; each call to [`RoutingAnalysis::step`] processes at most
//! one routing-table row.
//!
//! Heuristic: for every row, choose the neighbour that can see the most nodes
//! not reached yet. After the first repeater is chosen, a candidate must also
//! see at least one already reached node, so the preferred set stays connected.
//! Rows that already contain a preferred repeater are skipped.

use tracing::{debug, info, warn};
use zwave_protocol::NodeId;

use crate::adjacency::AdjacencyStore;
use crate::most_used::MostUsedTable;
use crate::node_mask::NodeMask;
use crate::persistence::{NvmKey, NvmStore};
use crate::route_cache::RouteCache;

/// Step of the analysis state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Idle,
    Start,
    /// Looking for the next non-empty row
    TableRead,
    /// Choosing a repeater for the current row
    RepeaterRead,
    Save,
}

/// Coarse routing-information status reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingInfoState {
    Idle,
    Analysing,
    Saving,
    Deleting,
}

#[derive(Debug, Clone)]
pub struct RoutingAnalysis {
    own_id: NodeId,
    state: AnalysisState,
    info_state: RoutingInfoState,
    /// Nodes whose rows are still to be read, highest first so `pop` is ascending
    pending: Vec<NodeId>,
    current: Option<NodeId>,
    reached: NodeMask,
    candidates: NodeMask,
    preferred: NodeMask,
}

impl RoutingAnalysis {
    pub fn new(own_id: NodeId) -> Self {
        RoutingAnalysis {
            own_id,
            state: AnalysisState::Idle,
            info_state: RoutingInfoState::Idle,
            pending: Vec::new(),
            current: None,
            reached: NodeMask::new(),
            candidates: NodeMask::new(),
            preferred: NodeMask::new(),
        }
    }

    pub fn state(&self) -> AnalysisState {
        self.state
    }

    pub fn info_state(&self) -> RoutingInfoState {
        self.info_state
    }

    /// Preferred repeaters from the last completed analysis
    pub fn preferred(&self) -> NodeMask {
        self.preferred
    }

    pub fn is_running(&self) -> bool {
        self.state != AnalysisState::Idle
    }

    /// Begin (or restart) an analysis, discarding partial results
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("Restarting routing analysis from {:?}", self.state);
        }
        self.state = AnalysisState::Start;
        if self.info_state != RoutingInfoState::Deleting {
            self.info_state = RoutingInfoState::Analysing;
        }
        self.current = None;
        self.pending.clear();
    }

    /// Abort without touching the saved result
    pub fn stop(&mut self) {
        self.state = AnalysisState::Idle;
        self.info_state = RoutingInfoState::Idle;
        self.current = None;
        self.pending.clear();
    }

    /// Remove a node from the network and schedule a fresh analysis
    pub fn delete_node(
        &mut self,
        node: NodeId,
        adj: &mut AdjacencyStore,
        cache: &mut RouteCache,
        most_used: &mut MostUsedTable,
    ) {
        self.info_state = RoutingInfoState::Deleting;
        if let Err(e) = adj.remove_node(node) {
            warn!("Failed to remove node {} from routing table: {}", node, e);
        }
        cache.remove_destination(node);
        if let Err(e) = cache.purge_as_repeater(node) {
            warn!("Routes through {} kept: {}", node, e);
        }
        most_used.delete(node);
        let _ = self.preferred.clear(node);
        self.start();
    }

    /// Run one unit of work and return the new state
    pub fn step(
        &mut self,
        adj: &mut AdjacencyStore,
        most_used: &mut MostUsedTable,
    ) -> AnalysisState {
        match self.state {
            AnalysisState::Idle => {}
            AnalysisState::Start => {
                self.info_state = RoutingInfoState::Analysing;
                self.reached = NodeMask::new();
                self.candidates = NodeMask::new();
                let mut nodes: Vec<NodeId> =
                    adj.nodes().filter(|n| !n.is_long_range()).collect();
                nodes.reverse();
                self.pending = nodes;
                self.state = AnalysisState::TableRead;
            }
            AnalysisState::TableRead => match self.pending.pop() {
                Some(node) => {
                    let row = self.repeater_row(adj, node);
                    if node != self.own_id && !row.is_empty() {
                        self.current = Some(node);
                        self.state = AnalysisState::RepeaterRead;
                    }
                }
                None => self.state = AnalysisState::Save,
            },
            AnalysisState::RepeaterRead => {
                if let Some(node) = self.current.take() {
                    self.choose_repeater(adj, node);
                }
                self.state = if self.pending.is_empty() {
                    AnalysisState::Save
                } else {
                    AnalysisState::TableRead
                };
            }
            AnalysisState::Save => {
                self.info_state = RoutingInfoState::Saving;
                self.save(adj, most_used);
                self.state = AnalysisState::Idle;
                self.info_state = RoutingInfoState::Idle;
            }
        }
        self.state
    }

    /// Run to completion
    pub fn run(&mut self, adj: &mut AdjacencyStore, most_used: &mut MostUsedTable) {
        if !self.is_running() {
            self.start();
        }
        while self.step(adj, most_used) != AnalysisState::Idle {}
    }

    fn repeater_row(&self, adj: &AdjacencyStore, node: NodeId) -> NodeMask {
        let row = adj.get_neighbors(node).unwrap_or_default();
        let mut filtered = row.intersection(&adj.repeaters());
        let _ = filtered.clear(self.own_id);
        filtered
    }

    fn choose_repeater(&mut self, adj: &AdjacencyStore, node: NodeId) {
        let row = self.repeater_row(adj, node);
        if !row.intersection(&self.candidates).is_empty() {
            return;
        }

        let first = self.candidates.is_empty();
        let mut best: Option<(NodeId, usize)> = None;
        for candidate in row.iter() {
            let sees = adj.get_neighbors(candidate).unwrap_or_default();
            let new_count = sees.difference(&self.reached).count();
            let old_count = sees.intersection(&self.reached).count();
            if new_count > best.map_or(0, |(_, n)| n) && (first || old_count > 0) {
                best = Some((candidate, new_count));
            }
        }

        if let Some((repeater, _)) = best {
            let sees = adj.get_neighbors(repeater).unwrap_or_default();
            self.reached = self.reached.union(&sees);
            let _ = self.reached.set(repeater);
            let _ = self.candidates.set(repeater);
            debug!("Preferred repeater {} selected for row {}", repeater, node);
        }
    }

    fn save(&mut self, adj: &mut AdjacencyStore, most_used: &mut MostUsedTable) {
        let mut non_repeaters = NodeMask::new();
        for node in adj.nodes().filter(|n| !n.is_long_range()) {
            if !adj.is_repeater(node) {
                let _ = non_repeaters.set(node);
            }
        }
        adj.set_non_repeaters(non_repeaters);

        let own_neighbors = adj.get_neighbors(self.own_id).unwrap_or_default();
        self.preferred = self.candidates.intersection(&own_neighbors);

        most_used.prune(&own_neighbors, adj);
        most_used.seed(&self.preferred, adj);

        info!(
            "Routing analysis complete: {} preferred repeaters, {} non-repeaters",
            self.preferred.count(),
            non_repeaters.count()
        );
    }

    pub fn persist(&self, nvm: &mut dyn NvmStore) {
        if let Err(e) = nvm.write(NvmKey::PreferredRepeaters, self.preferred.as_bytes()) {
            warn!("Failed to persist preferred repeaters: {}", e);
        }
    }

    pub fn restore(&mut self, nvm: &dyn NvmStore) {
        match nvm.read(NvmKey::PreferredRepeaters) {
            Ok(Some(bytes)) => match NodeMask::from_bytes(&bytes) {
                Ok(mask) => self.preferred = mask,
                Err(e) => warn!("Discarding preferred repeaters record: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to read preferred repeaters: {}", e),
        }
    }
}
