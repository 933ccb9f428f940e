//! Route cache
//!
//! Every destination owns two physical slots and a one-bit marker naming the
//! slot that holds the Last Working Route (LWR); the other slot holds the
//! Next-to-Last Working Route (NLWR). Promoting a route is a marker toggle, so
//! the previous LWR becomes NLWR without copying.
//!
//! When the application installs a static route it occupies slot B, the
//! protocol LWR lives in slot A and reads ignore the marker until the static
//! route is cleared.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};
use zwave_protocol::types::MAX_CLASSIC_NODE_ID;
use zwave_protocol::{NodeId, Speed, MAX_REPEATERS};

use crate::error::{Result, RoutingError};
use crate::persistence::{NvmKey, NvmStore};

const SLOT_A: usize = 0;
const SLOT_B: usize = 1;

/// Where a cached route was learned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteSource {
    /// Acknowledged routed (or direct) frame
    RoutedFrame,
    /// Result of an explore search
    Explore,
    /// Installed by the application
    Application,
}

/// A cached route: up to four repeaters and the speed it worked at
///
/// An empty repeater list is a direct route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteCacheLine {
    repeaters: Vec<NodeId>,
    speed: Speed,
    source: RouteSource,
}

impl RouteCacheLine {
    pub fn new(repeaters: Vec<NodeId>, speed: Speed, source: RouteSource) -> Result<Self> {
        if repeaters.len() > MAX_REPEATERS {
            return Err(RoutingError::RouteTooLong(repeaters.len()));
        }
        if let Some(lr) = repeaters.iter().find(|n| n.is_long_range()) {
            return Err(RoutingError::InvalidNode(lr.as_u16()));
        }
        Ok(RouteCacheLine {
            repeaters,
            speed,
            source,
        })
    }

    pub fn direct(speed: Speed, source: RouteSource) -> Self {
        RouteCacheLine {
            repeaters: Vec::new(),
            speed,
            source,
        }
    }

    pub fn repeaters(&self) -> &[NodeId] {
        &self.repeaters
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn source(&self) -> RouteSource {
        self.source
    }

    pub fn is_direct(&self) -> bool {
        self.repeaters.is_empty()
    }

    pub fn first_hop(&self) -> Option<NodeId> {
        self.repeaters.first().copied()
    }

    pub fn uses_repeater(&self, node: NodeId) -> bool {
        self.repeaters.contains(&node)
    }

    /// Same chain and speed, regardless of where it was learned
    pub fn same_route(&self, other: &RouteCacheLine) -> bool {
        self.repeaters == other.repeaters && self.speed == other.speed
    }
}

/// Which cached route a lookup or exile addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSelector {
    /// Static route, then LWR, then NLWR
    Any,
    /// LWR, then NLWR
    AnyProtocol,
    /// Any application-owned route
    AnyApplication,
    Lwr,
    Nlwr,
    AppStatic,
}

bitflags! {
    /// Outcome flags of a store operation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StoreFlags: u8 {
        const APP_STATIC_EXISTS = 0x01;
        const TOGGLED = 0x02;
        const LWR_EQUAL = 0x04;
        const NLWR_EQUAL = 0x08;
        const LWR_EMPTY = 0x10;
        const NLWR_EMPTY = 0x20;
        const STORED = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreResult {
    pub flags: StoreFlags,
    /// Marker value after the store
    pub marker: u8,
}

/// Kind of route returned by [`RouteCache::priority_route`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityRouteKind {
    ApplicationStatic,
    LastWorking,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheEntry {
    slots: [Option<RouteCacheLine>; 2],
    marker: u8,
    app_static: bool,
}

impl CacheEntry {
    fn lwr_slot(&self) -> usize {
        if self.app_static {
            SLOT_A
        } else {
            self.marker as usize
        }
    }

    fn nlwr_slot(&self) -> Option<usize> {
        if self.app_static {
            None
        } else {
            Some(1 - self.marker as usize)
        }
    }

    fn lwr(&self) -> Option<&RouteCacheLine> {
        self.slots[self.lwr_slot()].as_ref()
    }

    fn nlwr(&self) -> Option<&RouteCacheLine> {
        self.nlwr_slot().and_then(|slot| self.slots[slot].as_ref())
    }

    fn app_static(&self) -> Option<&RouteCacheLine> {
        if self.app_static {
            self.slots[SLOT_B].as_ref()
        } else {
            None
        }
    }

    fn toggle(&mut self) {
        self.marker ^= 1;
    }

    fn exile_lwr(&mut self) {
        if !self.app_static {
            let slot = self.lwr_slot();
            self.slots[slot] = None;
        }
    }

    fn exile_nlwr(&mut self) {
        // Under a static route the protocol route sits in slot A
        let slot = self.nlwr_slot().unwrap_or(SLOT_A);
        self.slots[slot] = None;
        self.toggle();
    }

    fn is_vacant(&self) -> bool {
        !self.app_static && self.slots.iter().all(Option::is_none) && self.marker == 0
    }
}

/// Per-destination LWR / NLWR / static route storage
#[derive(Debug, Default)]
pub struct RouteCache {
    entries: BTreeMap<NodeId, CacheEntry>,
    dirty: BTreeSet<NodeId>,
    locked: bool,
}

impl RouteCache {
    pub fn new() -> Self {
        RouteCache::default()
    }

    fn check_dest(dest: NodeId) -> Result<()> {
        if dest.is_long_range() {
            return Err(RoutingError::InvalidNode(dest.as_u16()));
        }
        Ok(())
    }

    pub fn get(&self, dest: NodeId, selector: RouteSelector) -> Option<RouteCacheLine> {
        let entry = self.entries.get(&dest)?;
        let line = match selector {
            RouteSelector::Any => entry
                .app_static()
                .or_else(|| entry.lwr())
                .or_else(|| entry.nlwr()),
            RouteSelector::AnyProtocol => entry.lwr().or_else(|| entry.nlwr()),
            RouteSelector::AnyApplication | RouteSelector::AppStatic => entry.app_static(),
            RouteSelector::Lwr => entry.lwr(),
            RouteSelector::Nlwr => entry.nlwr(),
        };
        line.cloned()
    }

    pub fn has_app_static(&self, dest: NodeId) -> bool {
        self.entries.get(&dest).map_or(false, |e| e.app_static)
    }

    /// Current LWR marker of `dest` (0 when nothing is cached)
    pub fn marker(&self, dest: NodeId) -> u8 {
        self.entries.get(&dest).map_or(0, |e| e.marker)
    }

    /// Record a working route
    pub fn store(&mut self, dest: NodeId, line: RouteCacheLine) -> Result<StoreResult> {
        Self::check_dest(dest)?;
        let entry = self.entries.entry(dest).or_default();
        let mut flags = StoreFlags::empty();

        if entry.app_static {
            flags |= StoreFlags::APP_STATIC_EXISTS;
            let lwr = entry.slots[SLOT_A].as_ref();
            if lwr.is_none() {
                flags |= StoreFlags::LWR_EMPTY;
            }
            if lwr.map_or(false, |l| l.same_route(&line)) {
                flags |= StoreFlags::LWR_EQUAL;
            } else if !entry.slots[SLOT_B]
                .as_ref()
                .map_or(false, |s| s.same_route(&line))
            {
                entry.slots[SLOT_A] = Some(line);
                flags |= StoreFlags::STORED;
            }
        } else {
            let lwr_slot = entry.lwr_slot();
            let nlwr_slot = 1 - lwr_slot;
            let lwr = entry.slots[lwr_slot].as_ref();
            let nlwr = entry.slots[nlwr_slot].as_ref();
            if lwr.is_none() {
                flags |= StoreFlags::LWR_EMPTY;
            }
            if nlwr.is_none() {
                flags |= StoreFlags::NLWR_EMPTY;
            }

            if lwr.map_or(false, |l| l.same_route(&line)) {
                flags |= StoreFlags::LWR_EQUAL;
            } else if nlwr.map_or(false, |n| n.same_route(&line)) {
                flags |= StoreFlags::NLWR_EQUAL | StoreFlags::TOGGLED;
                entry.toggle();
            } else if lwr.is_none() {
                entry.slots[lwr_slot] = Some(line);
                flags |= StoreFlags::STORED;
            } else {
                entry.slots[nlwr_slot] = Some(line);
                entry.toggle();
                flags |= StoreFlags::STORED | StoreFlags::TOGGLED;
            }
        }

        let marker = entry.marker;
        if flags.intersects(StoreFlags::STORED | StoreFlags::TOGGLED) {
            self.dirty.insert(dest);
        }
        trace!("Route cache store for {}: {:?}, marker {}", dest, flags, marker);
        Ok(StoreResult { flags, marker })
    }

    /// Drop a failing protocol route
    ///
    /// Returns whether an application static route exists for `dest`.
    /// Exiling the NLWR always flips the marker, so the surviving route
    /// becomes the one tried first.
    pub fn exile(&mut self, dest: NodeId, selector: RouteSelector) -> Result<bool> {
        if self.locked {
            return Err(RoutingError::CacheLocked);
        }
        let entry = match selector {
            RouteSelector::Nlwr | RouteSelector::Any | RouteSelector::AnyProtocol => {
                Self::check_dest(dest)?;
                self.entries.entry(dest).or_default()
            }
            _ => match self.entries.get_mut(&dest) {
                Some(entry) => entry,
                None => return Ok(false),
            },
        };
        let app_static = entry.app_static;

        match selector {
            RouteSelector::Lwr => entry.exile_lwr(),
            RouteSelector::Nlwr => entry.exile_nlwr(),
            RouteSelector::Any | RouteSelector::AnyProtocol => {
                entry.exile_lwr();
                entry.exile_nlwr();
            }
            RouteSelector::AnyApplication | RouteSelector::AppStatic => return Ok(app_static),
        }

        debug!("Exiled {:?} route to {}", selector, dest);
        self.dirty.insert(dest);
        Ok(app_static)
    }

    /// Drop every protocol route that passes through `node`
    pub fn purge_as_repeater(&mut self, node: NodeId) -> Result<usize> {
        if self.locked {
            return Err(RoutingError::CacheLocked);
        }
        let mut purged = 0;
        for (dest, entry) in self.entries.iter_mut() {
            let static_slot = if entry.app_static { Some(SLOT_B) } else { None };
            for (index, slot) in entry.slots.iter_mut().enumerate() {
                if Some(index) == static_slot {
                    continue;
                }
                if slot.as_ref().map_or(false, |l| l.uses_repeater(node)) {
                    *slot = None;
                    purged += 1;
                    self.dirty.insert(*dest);
                }
            }
        }
        if purged > 0 {
            debug!("Purged {} cached routes through repeater {}", purged, node);
        }
        Ok(purged)
    }

    /// Forget everything cached for `dest`
    pub fn remove_destination(&mut self, dest: NodeId) {
        if self.entries.remove(&dest).is_some() {
            self.dirty.insert(dest);
        }
    }

    /// Install (`Some`) or clear (`None`) the application static route
    pub fn set_static_route(&mut self, dest: NodeId, line: Option<RouteCacheLine>) -> Result<()> {
        Self::check_dest(dest)?;
        let entry = self.entries.entry(dest).or_default();
        match line {
            Some(line) => {
                let lwr = if entry.app_static {
                    entry.slots[SLOT_A].take()
                } else {
                    entry.lwr().cloned()
                };
                let line = RouteCacheLine {
                    source: RouteSource::Application,
                    ..line
                };
                entry.slots = [lwr, Some(line)];
                entry.app_static = true;
                entry.marker = 0;
            }
            None => {
                if entry.app_static {
                    entry.slots[SLOT_B] = None;
                }
                entry.app_static = false;
                entry.marker = 0;
            }
        }
        if entry.is_vacant() {
            self.entries.remove(&dest);
        }
        self.dirty.insert(dest);
        Ok(())
    }

    /// Route a frame should try first: the static route, else the LWR
    pub fn priority_route(&self, dest: NodeId) -> Option<(PriorityRouteKind, RouteCacheLine)> {
        let entry = self.entries.get(&dest)?;
        if let Some(line) = entry.app_static() {
            return Some((PriorityRouteKind::ApplicationStatic, line.clone()));
        }
        entry
            .lwr()
            .map(|line| (PriorityRouteKind::LastWorking, line.clone()))
    }

    /// While locked, exile and purge are denied
    pub fn lock(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn destinations(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Write changed destinations to `nvm`
    ///
    /// Failures are logged and the destination stays dirty for the next pass.
    pub fn persist(&mut self, nvm: &mut dyn NvmStore) -> usize {
        let mut written = 0;
        let dirty: Vec<NodeId> = self.dirty.iter().copied().collect();
        for dest in dirty {
            let key = NvmKey::RouteCache { dest };
            let outcome = match self.entries.get(&dest) {
                Some(entry) => bincode::serialize(entry)
                    .map_err(RoutingError::from)
                    .and_then(|bytes| nvm.write(key, &bytes)),
                None => nvm.remove(key),
            };
            match outcome {
                Ok(()) => {
                    self.dirty.remove(&dest);
                    written += 1;
                }
                Err(e) => warn!("Failed to persist route cache for {}: {}", dest, e),
            }
        }
        written
    }

    /// Load every destination found in `nvm`, replacing in-memory state
    pub fn restore(&mut self, nvm: &dyn NvmStore) -> usize {
        self.entries.clear();
        self.dirty.clear();
        for id in 1..=MAX_CLASSIC_NODE_ID {
            let Ok(dest) = NodeId::new(id) else {
                continue;
            };
            match nvm.read(NvmKey::RouteCache { dest }) {
                Ok(Some(bytes)) => match bincode::deserialize::<CacheEntry>(&bytes) {
                    Ok(entry) if Self::entry_is_valid(&entry) => {
                        self.entries.insert(dest, entry);
                    }
                    Ok(_) => warn!("Discarding malformed route cache record for {}", dest),
                    Err(e) => warn!("Failed to decode route cache for {}: {}", dest, e),
                },
                Ok(None) => {}
                Err(e) => warn!("Failed to read route cache for {}: {}", dest, e),
            }
        }
        debug!("Restored {} route cache entries", self.entries.len());
        self.entries.len()
    }

    fn entry_is_valid(entry: &CacheEntry) -> bool {
        entry.marker <= 1
            && entry
                .slots
                .iter()
                .flatten()
                .all(|line| line.repeaters.len() <= MAX_REPEATERS)
    }
}
