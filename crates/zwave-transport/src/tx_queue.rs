//! Transmit queue
//!
//! A fixed pool of elements addressed by generation-checked handles. One
//! element is on the air at a time; HIGH priority elements always go before
//! LOW ones and elements of the same priority leave in allocation order.
//!
//! Allocation rules:
//! - LOW priority needs at least two free elements, one is kept for HIGH,
//!   unless a HIGH element is already queued
//! - at most `capacity - 2` elements may wait on a delay at once

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use zwave_protocol::{NodeId, Speed};
use zwave_routing::RouteSearch;

use crate::error::{Result, TxError, TxStatus};
use crate::slab::{Handle, Slab};

pub type TxHandle = Handle;

/// Completion callback, invoked exactly once per accepted frame
pub type TxCallback = Box<dyn FnOnce(TxReport) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Free,
    Allocated,
    /// Delay not yet armed
    DelayedTx,
    /// Delay timer running
    DelayedTxWait,
    ReadyToSend,
    Transmitting,
    /// Sent, waiting for an ACK or explore result
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxPriority {
    High,
    Low,
}

/// Where the route of the current attempt came from, in the order tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RouteScheme {
    CachedStatic,
    CachedLwr,
    CachedNlwr,
    Direct,
    Resolved,
    ResortDirect,
    ResortExplore,
}

impl fmt::Display for RouteScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteScheme::CachedStatic => "static",
            RouteScheme::CachedLwr => "LWR",
            RouteScheme::CachedNlwr => "NLWR",
            RouteScheme::Direct => "direct",
            RouteScheme::Resolved => "resolved",
            RouteScheme::ResortDirect => "resort direct",
            RouteScheme::ResortExplore => "explore",
        };
        write!(f, "{}", name)
    }
}

/// A frame submitted for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub destination: NodeId,
    pub payload: Vec<u8>,
    pub priority: TxPriority,
    pub ack: bool,
    /// Overrides the configured default speed
    pub speed: Option<Speed>,
    pub delay: Option<Duration>,
    /// Allow the explore fallback once every other route failed
    pub explore: bool,
}

impl TxRequest {
    pub fn new(destination: NodeId, payload: Vec<u8>) -> Self {
        TxRequest {
            destination,
            payload,
            priority: TxPriority::High,
            ack: true,
            speed: None,
            delay: None,
            explore: true,
        }
    }

    pub fn with_priority(mut self, priority: TxPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn without_ack(mut self) -> Self {
        self.ack = false;
        self
    }

    pub fn without_explore(mut self) -> Self {
        self.explore = false;
        self
    }
}

/// Final outcome handed to the completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReport {
    pub status: TxStatus,
    pub scheme: RouteScheme,
    /// Repeaters of the last route used; empty for direct
    pub route: Vec<NodeId>,
    pub speed: Speed,
    /// Frames keyed onto the air, retries included
    pub transmit_count: u32,
}

/// Wake-up beam progress of the current attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BeamProgress {
    NotNeeded,
    Pending,
    Continuous,
    Fragments { sent: u32, total: u32 },
    Done,
}

pub struct TxElement {
    pub(crate) sequence: u64,
    pub(crate) state: TxState,
    pub(crate) request: TxRequest,
    pub(crate) due: Option<Instant>,
    pub(crate) scheme: RouteScheme,
    pub(crate) route: Vec<NodeId>,
    pub(crate) speed: Speed,
    /// Speed the current route started at
    pub(crate) route_speed: Speed,
    /// Transmissions of the current route at the current speed
    pub(crate) route_transmissions: u8,
    /// Chains already tried, so the ladder never repeats one
    pub(crate) tried: Vec<Vec<NodeId>>,
    /// Next rung of the route ladder to try
    pub(crate) ladder_pos: usize,
    pub(crate) search: Option<RouteSearch>,
    pub(crate) transmit_count: u32,
    pub(crate) lbt_since: Option<Instant>,
    pub(crate) beam: BeamProgress,
    pub(crate) ack_deadline: Option<Instant>,
    pub(crate) explore_session: Option<u8>,
    pub(crate) cancel_requested: bool,
    pub(crate) callback: Option<TxCallback>,
}

impl TxElement {
    fn new(sequence: u64, request: TxRequest, callback: Option<TxCallback>) -> Self {
        let speed = request.speed.unwrap_or(Speed::Kbps9_6);
        TxElement {
            sequence,
            state: TxState::Allocated,
            request,
            due: None,
            scheme: RouteScheme::Direct,
            route: Vec::new(),
            speed,
            route_speed: speed,
            route_transmissions: 0,
            tried: Vec::new(),
            ladder_pos: 0,
            search: None,
            transmit_count: 0,
            lbt_since: None,
            beam: BeamProgress::NotNeeded,
            ack_deadline: None,
            explore_session: None,
            cancel_requested: false,
            callback,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn priority(&self) -> TxPriority {
        self.request.priority
    }

    pub fn destination(&self) -> NodeId {
        self.request.destination
    }

    pub fn request(&self) -> &TxRequest {
        &self.request
    }

    pub fn scheme(&self) -> RouteScheme {
        self.scheme
    }

    pub fn route(&self) -> &[NodeId] {
        &self.route
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn transmit_count(&self) -> u32 {
        self.transmit_count
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    fn is_delayed(&self) -> bool {
        self.request.delay.is_some()
            && matches!(
                self.state,
                TxState::Allocated | TxState::DelayedTx | TxState::DelayedTxWait
            )
    }

    pub(crate) fn report(&self, status: TxStatus) -> TxReport {
        TxReport {
            status,
            scheme: self.scheme,
            route: self.route.clone(),
            speed: self.speed,
            transmit_count: self.transmit_count,
        }
    }
}

impl fmt::Debug for TxElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxElement")
            .field("sequence", &self.sequence)
            .field("state", &self.state)
            .field("priority", &self.request.priority)
            .field("destination", &self.request.destination)
            .field("scheme", &self.scheme)
            .field("route", &self.route)
            .field("speed", &self.speed)
            .field("transmit_count", &self.transmit_count)
            .finish()
    }
}

/// Result of cancelling a queued element
#[derive(Debug)]
pub enum CancelOutcome {
    /// Removed at once; the caller owns the element and its callback
    Removed(TxElement),
    /// On the air; cancelled when the current attempt completes
    Deferred,
}

#[derive(Debug)]
pub struct TxQueue {
    slab: Slab<TxElement>,
    next_sequence: u64,
    delayed_max: usize,
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        TxQueue {
            slab: Slab::with_capacity(capacity),
            next_sequence: 0,
            delayed_max: capacity.saturating_sub(2),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    pub fn free_slots(&self) -> usize {
        self.slab.vacant()
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    fn high_queued(&self) -> bool {
        self.slab
            .iter()
            .any(|(_, e)| e.request.priority == TxPriority::High)
    }

    fn delayed_count(&self) -> usize {
        self.slab.iter().filter(|(_, e)| e.is_delayed()).count()
    }

    /// Reserve an element for `request`; it stays `Allocated` until enqueued
    pub fn allocate(
        &mut self,
        request: TxRequest,
        callback: Option<TxCallback>,
    ) -> Result<TxHandle> {
        let free = self.free_slots();
        let needed = match request.priority {
            TxPriority::High => 1,
            TxPriority::Low if self.high_queued() => 1,
            TxPriority::Low => 2,
        };
        if free < needed {
            debug!(
                "No {:?} slot for {}: {} free",
                request.priority, request.destination, free
            );
            return Err(TxError::QueueFull);
        }
        if request.delay.is_some() && self.delayed_count() >= self.delayed_max {
            return Err(TxError::DelayedBudgetExhausted);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let element = TxElement::new(sequence, request, callback);
        self.slab.insert(element).map_err(|_| TxError::QueueFull)
    }

    /// Hand an allocated element to the scheduler
    pub fn enqueue(&mut self, handle: TxHandle, now: Instant) -> Result<()> {
        let element = self.get_mut(handle)?;
        debug_assert_eq!(element.state, TxState::Allocated, "Enqueue of a queued element");
        match element.request.delay {
            Some(delay) => {
                element.due = Some(now + delay);
                element.state = TxState::DelayedTx;
                self.arm_delayed();
            }
            None => element.state = TxState::ReadyToSend,
        }
        trace!("Enqueued {:?}", handle);
        Ok(())
    }

    pub fn get(&self, handle: TxHandle) -> Result<&TxElement> {
        self.slab.get(handle).ok_or(TxError::StaleHandle)
    }

    pub fn get_mut(&mut self, handle: TxHandle) -> Result<&mut TxElement> {
        self.slab.get_mut(handle).ok_or(TxError::StaleHandle)
    }

    /// State of `handle`; freed or stale handles report `Free`
    pub fn state(&self, handle: TxHandle) -> TxState {
        self.slab.get(handle).map_or(TxState::Free, |e| e.state)
    }

    /// State of the physical element at `index`
    pub fn slot_state(&self, index: usize) -> TxState {
        if !self.slab.is_occupied(index) {
            return TxState::Free;
        }
        self.slab
            .iter()
            .find(|(h, _)| h.index() == index)
            .map_or(TxState::Free, |(_, e)| e.state)
    }

    pub(crate) fn set_state(&mut self, handle: TxHandle, state: TxState) -> Result<()> {
        self.get_mut(handle)?.state = state;
        Ok(())
    }

    /// Free an element, returning it with its callback
    pub fn release(&mut self, handle: TxHandle) -> Result<TxElement> {
        let element = self.slab.remove(handle).ok_or(TxError::StaleHandle)?;
        if element.request.delay.is_some() {
            self.arm_delayed();
        }
        Ok(element)
    }

    /// Element to put on the air next, if the radio may be used
    pub fn next_ready(&self) -> Option<TxHandle> {
        let mut waiting = false;
        let mut high: Option<(u64, TxHandle)> = None;
        let mut low: Option<(u64, TxHandle)> = None;
        for (handle, element) in self.slab.iter() {
            match element.state {
                TxState::Transmitting => return None,
                TxState::Waiting => waiting = true,
                TxState::ReadyToSend => {
                    let best = match element.request.priority {
                        TxPriority::High => &mut high,
                        TxPriority::Low => &mut low,
                    };
                    if best.map_or(true, |(seq, _)| element.sequence < seq) {
                        *best = Some((element.sequence, handle));
                    }
                }
                _ => {}
            }
        }
        if let Some((_, handle)) = high {
            return Some(handle);
        }
        if waiting {
            return None;
        }
        low.map(|(_, handle)| handle)
    }

    /// Element currently on the air
    pub fn transmitting(&self) -> Option<TxHandle> {
        self.slab
            .iter()
            .find(|(_, e)| e.state == TxState::Transmitting)
            .map(|(h, _)| h)
    }

    /// Oldest element waiting for an ACK from `from`
    pub fn waiting_for(&self, from: NodeId) -> Option<TxHandle> {
        self.slab
            .iter()
            .filter(|(_, e)| e.state == TxState::Waiting && e.request.destination == from)
            .min_by_key(|(_, e)| e.sequence)
            .map(|(h, _)| h)
    }

    /// Waiting elements whose ACK deadline has passed
    pub fn ack_expired(&self, now: Instant) -> Vec<TxHandle> {
        self.slab
            .iter()
            .filter(|(_, e)| {
                e.state == TxState::Waiting && e.ack_deadline.map_or(false, |d| d <= now)
            })
            .map(|(h, _)| h)
            .collect()
    }

    /// Earliest ACK deadline among waiting elements
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.slab
            .iter()
            .filter(|(_, e)| e.state == TxState::Waiting)
            .filter_map(|(_, e)| e.ack_deadline)
            .min()
    }

    /// Move the delayed element with the shortest remaining delay onto the timer
    fn arm_delayed(&mut self) {
        let armed = self
            .slab
            .iter()
            .find(|(_, e)| e.state == TxState::DelayedTxWait)
            .map(|(h, e)| (h, e.due));
        let earliest = self
            .slab
            .iter()
            .filter(|(_, e)| e.state == TxState::DelayedTx)
            .min_by_key(|(_, e)| (e.due, e.sequence))
            .map(|(h, e)| (h, e.due));

        let Some((next, next_due)) = earliest else {
            return;
        };
        match armed {
            None => {}
            Some((current, current_due)) if next_due < current_due => {
                if let Some(e) = self.slab.get_mut(current) {
                    e.state = TxState::DelayedTx;
                }
            }
            Some(_) => return,
        }
        if let Some(e) = self.slab.get_mut(next) {
            e.state = TxState::DelayedTxWait;
            trace!("Delay timer armed for {:?}", next);
        }
    }

    /// Release delayed elements whose timer elapsed; returns how many
    pub fn expire_delayed(&mut self, now: Instant) -> usize {
        let mut released = 0;
        loop {
            let due = self
                .slab
                .iter_mut()
                .find(|(_, e)| e.state == TxState::DelayedTxWait && e.due.map_or(true, |d| d <= now));
            match due {
                Some((handle, element)) => {
                    element.state = TxState::ReadyToSend;
                    element.due = None;
                    released += 1;
                    trace!("Delay elapsed for {:?}", handle);
                    self.arm_delayed();
                }
                None => return released,
            }
        }
    }

    /// When the armed delay timer fires
    pub fn delayed_deadline(&self) -> Option<Instant> {
        self.slab
            .iter()
            .find(|(_, e)| e.state == TxState::DelayedTxWait)
            .and_then(|(_, e)| e.due)
    }

    /// Cancel `handle`; elements on the air are cancelled once the attempt ends
    pub fn cancel(&mut self, handle: TxHandle) -> Result<CancelOutcome> {
        let element = self.get_mut(handle)?;
        match element.state {
            TxState::Transmitting | TxState::Waiting => {
                element.cancel_requested = true;
                debug!("Cancel of {:?} deferred until the attempt completes", handle);
                Ok(CancelOutcome::Deferred)
            }
            _ => self.release(handle).map(CancelOutcome::Removed),
        }
    }

    pub fn handles(&self) -> Vec<TxHandle> {
        self.slab.iter().map(|(h, _)| h).collect()
    }
}
