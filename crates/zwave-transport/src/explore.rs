//! Explore frame fallback
//!
//! When no ACKed route exists the engine floods an explore frame. The
//! [`ExploreQueue`] tracks searches this node originated; the
//! [`ExploreRelay`] decides what to do with explore frames heard from others.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use zwave_protocol::{
    Addressing, ExploreCommand, ExploreHeader, ExploreOptions, Frame, FrameHeader, NodeId,
};

use crate::error::{Result, TxError};
use crate::tx_queue::TxHandle;

/// Concurrent searches this node may originate
pub const EXPLORE_QUEUE_SIZE: usize = 2;

/// Remembered (source, session) pairs for duplicate suppression
pub const EXPLORE_IGNORE_QUEUE_SIZE: usize = 2;

pub const EXPLORE_IGNORE_TIMEOUT: Duration = Duration::from_millis(3600);

/// One unit of the random interval
const INTERVAL_TICK_MS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploreSession {
    pub handle: TxHandle,
    pub destination: NodeId,
    /// Sequence number of the explore frame; `None` until sent
    pub session: Option<u8>,
    pub deadline: Option<Instant>,
}

/// Searches originated by this node
#[derive(Debug)]
pub struct ExploreQueue {
    sessions: Vec<ExploreSession>,
    capacity: usize,
}

impl Default for ExploreQueue {
    fn default() -> Self {
        ExploreQueue::new(EXPLORE_QUEUE_SIZE)
    }
}

impl ExploreQueue {
    pub fn new(capacity: usize) -> Self {
        ExploreQueue {
            sessions: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn queue_is_full(&self) -> bool {
        self.sessions.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Reserve a search slot for the element behind `handle`
    pub fn enqueue(&mut self, handle: TxHandle, destination: NodeId) -> Result<()> {
        if self.queue_is_full() {
            return Err(TxError::NoExploreSlot);
        }
        self.sessions.push(ExploreSession {
            handle,
            destination,
            session: None,
            deadline: None,
        });
        debug!("Explore search to {} queued", destination);
        Ok(())
    }

    /// The explore frame left the radio; start waiting for the result
    pub fn mark_sent(&mut self, handle: TxHandle, session: u8, deadline: Instant) {
        if let Some(s) = self.sessions.iter_mut().find(|s| s.handle == handle) {
            s.session = Some(session);
            s.deadline = Some(deadline);
        }
    }

    /// Search matching a result frame
    pub fn take_result(&mut self, session: u8) -> Option<ExploreSession> {
        let index = self
            .sessions
            .iter()
            .position(|s| s.session == Some(session))?;
        Some(self.sessions.remove(index))
    }

    pub fn remove(&mut self, handle: TxHandle) -> Option<ExploreSession> {
        let index = self.sessions.iter().position(|s| s.handle == handle)?;
        Some(self.sessions.remove(index))
    }

    pub fn contains(&self, handle: TxHandle) -> bool {
        self.sessions.iter().any(|s| s.handle == handle)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions.iter().filter_map(|s| s.deadline).min()
    }

    /// Drop searches whose result timeout passed, returning their elements
    pub fn expire(&mut self, now: Instant) -> Vec<TxHandle> {
        let mut expired = Vec::new();
        self.sessions.retain(|s| {
            if s.deadline.map_or(false, |d| d <= now) {
                expired.push(s.handle);
                false
            } else {
                true
            }
        });
        expired
    }
}

/// What to do with an explore frame heard on the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    /// Not an explore frame
    Ignored,
    /// Same search seen recently, or one we take part in already
    Duplicate,
    /// TTL used up or repeater list full
    Exhausted,
    /// Addressed to this node; the chain is the route the frame travelled
    Reached { source: NodeId, repeaters: Vec<NodeId> },
    /// Answer to a search this node originated
    SearchResult { session: u8, repeaters: Vec<NodeId> },
    /// Forward `frame` after `delay`
    Rebroadcast { frame: Frame, delay: Duration },
}

#[derive(Debug, Clone, Copy)]
struct IgnoreEntry {
    source: NodeId,
    session: u8,
    expires: Instant,
}

/// Duplicate suppression and forwarding of explore frames
#[derive(Debug)]
pub struct ExploreRelay {
    own_id: NodeId,
    ignore: VecDeque<IgnoreEntry>,
    rng: StdRng,
}

impl ExploreRelay {
    pub fn new(own_id: NodeId) -> Self {
        ExploreRelay {
            own_id,
            ignore: VecDeque::with_capacity(EXPLORE_IGNORE_QUEUE_SIZE),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic back-off, for tests and simulations
    pub fn with_seed(own_id: NodeId, seed: u64) -> Self {
        ExploreRelay {
            own_id,
            ignore: VecDeque::with_capacity(EXPLORE_IGNORE_QUEUE_SIZE),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn handle(&mut self, frame: &Frame, now: Instant) -> RelayDecision {
        let Some((sequence, destination, explore)) = explore_parts(&frame.header) else {
            return RelayDecision::Ignored;
        };
        let source = frame.header.source();

        self.ignore.retain(|e| e.expires > now);
        if explore.command == ExploreCommand::SearchResult {
            return self.handle_result(frame, sequence, destination, explore, now);
        }
        if source == self.own_id
            || explore.repeaters.contains(&self.own_id)
            || self
                .ignore
                .iter()
                .any(|e| e.source == source && e.session == sequence)
        {
            trace!("Explore {}#{} ignored as duplicate", source, sequence);
            return RelayDecision::Duplicate;
        }
        self.remember(source, sequence, now);

        if destination == self.own_id {
            return RelayDecision::Reached {
                source,
                repeaters: explore.repeaters.clone(),
            };
        }
        if !explore.can_repeat() {
            return RelayDecision::Exhausted;
        }

        let mut forwarded = explore.clone();
        forwarded.repeaters.push(self.own_id);
        forwarded.ttl -= 1;
        let mut relayed = frame.clone();
        set_explore(&mut relayed.header, forwarded);

        let window = u64::from(explore.random_interval) * INTERVAL_TICK_MS;
        let delay = if window == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.gen_range(0..window))
        };
        debug!(
            "Relaying explore {}#{} to {} after {:?}",
            source, sequence, destination, delay
        );
        RelayDecision::Rebroadcast {
            frame: relayed,
            delay,
        }
    }
}

impl ExploreRelay {
    fn remember(&mut self, source: NodeId, session: u8, now: Instant) {
        if self.ignore.len() >= EXPLORE_IGNORE_QUEUE_SIZE {
            self.ignore.pop_front();
        }
        self.ignore.push_back(IgnoreEntry {
            source,
            session,
            expires: now + EXPLORE_IGNORE_TIMEOUT,
        });
    }

    /// Results travel back along the recorded chain; only its members forward them
    fn handle_result(
        &mut self,
        frame: &Frame,
        session: u8,
        destination: NodeId,
        explore: &ExploreHeader,
        now: Instant,
    ) -> RelayDecision {
        if destination == self.own_id {
            return RelayDecision::SearchResult {
                session,
                repeaters: explore.repeaters.clone(),
            };
        }
        let source = frame.header.source();
        if !explore.options.contains(ExploreOptions::SOURCE_ROUTED)
            || !explore.repeaters.contains(&self.own_id)
        {
            return RelayDecision::Ignored;
        }
        if self
            .ignore
            .iter()
            .any(|e| e.source == source && e.session == session)
        {
            return RelayDecision::Duplicate;
        }
        self.remember(source, session, now);
        trace!("Forwarding explore result {}#{} to {}", source, session, destination);
        RelayDecision::Rebroadcast {
            frame: frame.clone(),
            delay: Duration::ZERO,
        }
    }
}

/// Result frame answering the search `request`, sent back by its destination
///
/// The traversed chain is kept in forward order so the originator can use it
/// as is. Returns `None` for anything but a classic explore search.
pub fn search_result(request: &Frame, own_id: NodeId) -> Option<Frame> {
    let (_, _, explore) = explore_parts(&request.header)?;
    let answer = ExploreHeader {
        command: ExploreCommand::SearchResult,
        options: ExploreOptions::SOURCE_ROUTED | ExploreOptions::DIRECTION,
        ttl: 0,
        ..explore.clone()
    };
    let originator = request.header.source();
    let mut frame = Frame::new(request.header.clone(), Vec::new());
    let addressing = Addressing::Explore {
        destination: originator,
        explore: answer,
    };
    match &mut frame.header {
        FrameHeader::TwoChannel(h) => {
            h.source = own_id;
            h.ack = false;
            h.addressing = addressing;
        }
        FrameHeader::ThreeChannel(h) => {
            h.source = own_id;
            h.ack = false;
            h.addressing = addressing;
        }
        FrameHeader::LongRange(_) => return None,
    }
    Some(frame)
}

fn explore_parts(header: &FrameHeader) -> Option<(u8, NodeId, &ExploreHeader)> {
    let (sequence, addressing) = match header {
        FrameHeader::TwoChannel(h) => (h.sequence, &h.addressing),
        FrameHeader::ThreeChannel(h) => (h.sequence, &h.addressing),
        FrameHeader::LongRange(_) => return None,
    };
    match addressing {
        Addressing::Explore {
            destination,
            explore,
        } => Some((sequence, *destination, explore)),
        _ => None,
    }
}

fn set_explore(header: &mut FrameHeader, updated: ExploreHeader) {
    let addressing = match header {
        FrameHeader::TwoChannel(h) => &mut h.addressing,
        FrameHeader::ThreeChannel(h) => &mut h.addressing,
        FrameHeader::LongRange(_) => return,
    };
    if let Addressing::Explore { explore, .. } = addressing {
        *explore = updated;
    }
}
