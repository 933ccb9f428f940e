//! Route resolution
//!
//! Breadth-first search over the routing table plus the next-route iterator
//! that feeds alternative routes to the transmission queue.

use std::collections::VecDeque;
use tracing::{debug, trace};
use zwave_protocol::types::MAX_CLASSIC_NODE_ID;
use zwave_protocol::{NodeId, Speed, MAX_REPEATERS};

use crate::adjacency::AdjacencyStore;
use crate::most_used::MostUsedTable;
use crate::node_mask::NodeMask;

/// Maximum alternative routes yielded by one [`RouteSearch`]
pub const MAX_ROUTING_ATTEMPTS: usize = 5;

/// Shortest repeater chain from `via` to `destination`
///
/// The chain excludes both endpoints; `Some(vec![])` means `destination` is a
/// direct neighbour of `via`. See [`find_route_bounded`].
pub fn find_best_route(
    adj: &AdjacencyStore,
    via: NodeId,
    destination: NodeId,
) -> Option<Vec<NodeId>> {
    find_route_bounded(adj, via, destination, &NodeMask::new(), MAX_REPEATERS)
}

/// Breadth-first search bounded to `max_repeaters` intermediate repeaters
///
/// Neighbours are expanded in ascending node id order, so among equally short
/// chains the one with the lowest ids at the earliest hops wins. Only
/// repeaters are used as intermediates and nodes in `avoid` are never used.
pub fn find_route_bounded(
    adj: &AdjacencyStore,
    via: NodeId,
    destination: NodeId,
    avoid: &NodeMask,
    max_repeaters: usize,
) -> Option<Vec<NodeId>> {
    if via.is_long_range() || destination.is_long_range() || via == destination {
        return None;
    }
    let start = adj.get_neighbors(via).ok()?;
    if start.contains(destination) {
        return Some(Vec::new());
    }
    if max_repeaters == 0 {
        return None;
    }

    // parent[n - 1] is the node that first reached n
    let mut parent: Vec<Option<NodeId>> = vec![None; MAX_CLASSIC_NODE_ID as usize];
    let mut visited = *avoid;
    // Marking a classic id cannot fail
    let _ = visited.set(via);
    let _ = visited.set(destination);

    let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
    for next in start.iter() {
        if !visited.contains(next) && adj.is_repeater(next) {
            let _ = visited.set(next);
            queue.push_back((next, 1));
        }
    }

    while let Some((node, depth)) = queue.pop_front() {
        let row = adj.get_neighbors(node).ok()?;
        if row.contains(destination) {
            let mut chain = vec![node];
            let mut cursor = node;
            while let Some(prev) = parent[cursor.mask_index()] {
                chain.push(prev);
                cursor = prev;
            }
            chain.reverse();
            trace!("Route {} -> {} via {:?}", via, destination, chain);
            return Some(chain);
        }
        if depth >= max_repeaters {
            continue;
        }
        for next in row.iter() {
            if !visited.contains(next) && adj.is_repeater(next) {
                let _ = visited.set(next);
                parent[next.mask_index()] = Some(node);
                queue.push_back((next, depth + 1));
            }
        }
    }
    None
}

/// Next classic speed below `current` supported by both endpoints
pub fn next_lower_speed(
    adj: &AdjacencyStore,
    src: NodeId,
    dest: NodeId,
    current: Speed,
) -> Option<Speed> {
    let mut candidate = current.lower();
    while let Some(speed) = candidate {
        if adj.supports_speed(src, speed) && adj.supports_speed(dest, speed) {
            return Some(speed);
        }
        candidate = speed.lower();
    }
    None
}

/// Iterator over alternative routes for one transmission
///
/// Entry points are taken from the most-used table first (highest counter,
/// each once), then from the source's remaining neighbour repeaters in
/// ascending order. Each entry point is completed with a bounded search to
/// the destination.
#[derive(Debug, Clone)]
pub struct RouteSearch {
    speed: Speed,
    started: bool,
    most_used_done: bool,
    tried: NodeMask,
    yielded: Vec<Vec<NodeId>>,
}

impl RouteSearch {
    pub fn new(speed: Speed) -> Self {
        RouteSearch {
            speed,
            started: false,
            most_used_done: false,
            tried: NodeMask::new(),
            yielded: Vec::new(),
        }
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Routes yielded so far
    pub fn attempts(&self) -> usize {
        self.yielded.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.yielded.len() >= MAX_ROUTING_ATTEMPTS
    }

    pub fn next_route(
        &mut self,
        adj: &AdjacencyStore,
        most_used: &mut MostUsedTable,
        src: NodeId,
        dest: NodeId,
    ) -> Option<Vec<NodeId>> {
        if src.is_long_range() || dest.is_long_range() {
            return None;
        }
        if !self.started {
            most_used.reset_used();
            self.started = true;
        }
        let own_neighbors = adj.get_neighbors(src).ok()?;
        let mut avoid = NodeMask::new();
        let _ = avoid.set(src);

        while !self.is_exhausted() {
            let entry = match self.next_entry_point(adj, most_used, &own_neighbors, src, dest) {
                Some(entry) => entry,
                None => {
                    debug!("Route search to {} exhausted after {} routes", dest, self.attempts());
                    return None;
                }
            };
            let _ = self.tried.set(entry);

            let Some(rest) =
                find_route_bounded(adj, entry, dest, &avoid, MAX_REPEATERS - 1)
            else {
                continue;
            };
            let mut chain = Vec::with_capacity(rest.len() + 1);
            chain.push(entry);
            chain.extend(rest);

            if self.yielded.contains(&chain) {
                continue;
            }
            self.yielded.push(chain.clone());
            trace!("Route search attempt {} to {}: {:?}", self.attempts(), dest, chain);
            return Some(chain);
        }
        None
    }

    fn next_entry_point(
        &mut self,
        adj: &AdjacencyStore,
        most_used: &mut MostUsedTable,
        own_neighbors: &NodeMask,
        src: NodeId,
        dest: NodeId,
    ) -> Option<NodeId> {
        let mut exclude = self.tried;
        let _ = exclude.set(src);
        let _ = exclude.set(dest);

        while !self.most_used_done {
            match most_used.next_entry_point(&exclude, self.speed) {
                Some(node) if own_neighbors.contains(node) && adj.is_repeater(node) => {
                    return Some(node)
                }
                Some(node) => {
                    let _ = exclude.set(node);
                }
                None => self.most_used_done = true,
            }
        }

        own_neighbors
            .iter()
            .find(|n| !exclude.contains(*n) && adj.is_repeater(*n))
    }
}
