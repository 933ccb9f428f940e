//! Transmission engine
//!
//! [`Engine`] is the single context owned by the protocol task. It holds the
//! transmit queue, the routing state and the radio, and moves each queued
//! frame through the route ladder until it is acknowledged or every route
//! has failed:
//!
//! static route, LWR, NLWR, direct, resolved routes, last-resort direct,
//! explore frame.
//!
//! Every route is retried at its speed, then at lower speeds both ends
//! support, before the ladder moves on. The engine never blocks; the caller
//! feeds it radio events and clock ticks.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use zwave_protocol::{
    Addressing, ChannelProfile, ExploreHeader, Frame, FrameHeader, Header2ch, Header3ch, HeaderLr,
    LrFrameKind, ListeningMode, NodeId, RoutedHeader, Speed, WakeupBeam, MAX_REPEATERS,
};
use zwave_routing::{
    next_lower_speed, AdjacencyStore, MostUsedTable, NodeInfo, NvmStore, RouteCache,
    RouteCacheLine, RouteSearch, RouteSelector, RouteSource, RoutingAnalysis,
};

use crate::config::EngineConfig;
use crate::critical::{CriticalSection, IrqControl, NoopIrq};
use crate::error::{Result, TxError, TxStatus};
use crate::explore::{search_result, ExploreQueue, ExploreRelay, RelayDecision};
use crate::listeners::{ListenerId, Listeners, QueueEmptyListener};
use crate::radio::{
    BeamFragment, BeamKind, PhyStatus, RadioEvent, RadioEventReceiver, RadioPal, TxFrame,
};
use crate::tx_queue::{
    BeamProgress, CancelOutcome, RouteScheme, TxCallback, TxElement, TxHandle, TxQueue,
    TxRequest, TxState,
};

/// Route schemes in the order they are tried
const LADDER: [RouteScheme; 7] = [
    RouteScheme::CachedStatic,
    RouteScheme::CachedLwr,
    RouteScheme::CachedNlwr,
    RouteScheme::Direct,
    RouteScheme::Resolved,
    RouteScheme::ResortDirect,
    RouteScheme::ResortExplore,
];

/// Noise floor value meaning "not measured" in long-range headers
const NOISE_FLOOR_UNKNOWN: i8 = 127;

/// What the radio is busy with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnAir {
    Beam(TxHandle),
    /// Silence between two fragments of a beam train
    BeamGap(TxHandle),
    Data(TxHandle),
    Relay,
}

pub struct Engine {
    config: EngineConfig,
    own_id: NodeId,
    queue: TxQueue,
    adjacency: AdjacencyStore,
    route_cache: RouteCache,
    most_used: MostUsedTable,
    analysis: RoutingAnalysis,
    nvm: Box<dyn NvmStore>,
    radio: Box<dyn RadioPal>,
    irq: Arc<dyn IrqControl>,
    listeners: Listeners,
    explore: ExploreQueue,
    relay: ExploreRelay,
    relay_pending: Vec<(Instant, Frame)>,
    on_air: Option<OnAir>,
    pause_until: Option<Instant>,
    sequence: u8,
    last_persist: Option<Instant>,
}

impl Engine {
    /// Build an engine, restoring routing state from `nvm`
    pub fn new(
        config: EngineConfig,
        radio: Box<dyn RadioPal>,
        nvm: Box<dyn NvmStore>,
    ) -> Result<Self> {
        config.validate()?;
        let own_id = config.node_id()?;

        let mut adjacency = AdjacencyStore::new();
        if !own_id.is_long_range() {
            adjacency.add_node(own_id, NodeInfo::repeater())?;
        }

        let mut route_cache = RouteCache::new();
        let restored = route_cache.restore(nvm.as_ref());
        let most_used = MostUsedTable::restore(nvm.as_ref());
        let mut analysis = RoutingAnalysis::new(own_id);
        analysis.restore(nvm.as_ref());

        info!(
            "Engine for node {} on {} ({:?}), {} cached destinations restored",
            own_id, config.home_id, config.profile, restored
        );

        Ok(Engine {
            queue: TxQueue::new(config.queue_capacity),
            relay: ExploreRelay::new(own_id),
            config,
            own_id,
            adjacency,
            route_cache,
            most_used,
            analysis,
            nvm,
            radio,
            irq: Arc::new(NoopIrq),
            listeners: Listeners::new(),
            explore: ExploreQueue::default(),
            relay_pending: Vec::new(),
            on_air: None,
            pause_until: None,
            sequence: 0,
            last_persist: None,
        })
    }

    /// Use a platform interrupt mask for critical sections
    pub fn with_irq(mut self, irq: Arc<dyn IrqControl>) -> Self {
        self.irq = irq;
        self
    }

    /// Replace the explore back-off generator (tests and simulations)
    pub fn with_explore_seed(mut self, seed: u64) -> Self {
        self.relay = ExploreRelay::with_seed(self.own_id, seed);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn adjacency(&self) -> &AdjacencyStore {
        &self.adjacency
    }

    pub fn adjacency_mut(&mut self) -> &mut AdjacencyStore {
        &mut self.adjacency
    }

    pub fn route_cache(&self) -> &RouteCache {
        &self.route_cache
    }

    pub fn route_cache_mut(&mut self) -> &mut RouteCache {
        &mut self.route_cache
    }

    pub fn most_used(&self) -> &MostUsedTable {
        &self.most_used
    }

    pub fn analysis(&self) -> &RoutingAnalysis {
        &self.analysis
    }

    pub fn queue(&self) -> &TxQueue {
        &self.queue
    }

    /// State of a submitted frame; `Free` once it completed
    pub fn state(&self, handle: TxHandle) -> TxState {
        self.queue.state(handle)
    }

    /// Nothing queued, on the air or waiting to be relayed
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.on_air.is_none() && self.relay_pending.is_empty()
    }

    pub fn register_queue_empty_listener(&mut self, listener: QueueEmptyListener) -> ListenerId {
        self.listeners.register(listener)
    }

    pub fn unregister_queue_empty_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Start (or restart) routing-table analysis; it advances one step per tick
    pub fn start_analysis(&mut self) {
        self.analysis.start();
    }

    /// Remove `node` from the routing state and schedule a new analysis
    pub fn delete_node(&mut self, node: NodeId) {
        self.analysis.delete_node(
            node,
            &mut self.adjacency,
            &mut self.route_cache,
            &mut self.most_used,
        );
    }

    /// Queue a frame
    ///
    /// Frames rejected here never invoke `callback`. Accepted frames invoke
    /// it exactly once with their final outcome.
    pub fn submit(
        &mut self,
        request: TxRequest,
        callback: Option<TxCallback>,
        now: Instant,
    ) -> Result<TxHandle> {
        self.check_destination(request.destination)?;
        let irq = Arc::clone(&self.irq);
        let _cs = CriticalSection::enter(irq.as_ref());

        let handle = self.queue.allocate(request, callback)?;
        if let Err(e) = self.prepare(handle) {
            let _ = self.queue.release(handle);
            self.explore.remove(handle);
            return Err(e);
        }
        self.queue.enqueue(handle, now)?;
        self.service(now);
        Ok(handle)
    }

    /// Cancel a frame; frames on the air are cancelled when the attempt ends
    pub fn cancel(&mut self, handle: TxHandle) -> Result<()> {
        let irq = Arc::clone(&self.irq);
        let _cs = CriticalSection::enter(irq.as_ref());

        if let CancelOutcome::Removed(element) = self.queue.cancel(handle)? {
            self.explore.remove(handle);
            debug!("Transmission to {} cancelled", element.destination());
            self.complete(element, TxStatus::Cancelled);
        }
        Ok(())
    }

    /// Drain every pending radio event
    pub fn pump_events(&mut self, events: &mut RadioEventReceiver, now: Instant) -> usize {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_event(event, now);
            handled += 1;
        }
        handled
    }

    pub fn handle_event(&mut self, event: RadioEvent, now: Instant) {
        let irq = Arc::clone(&self.irq);
        let _cs = CriticalSection::enter(irq.as_ref());

        trace!("Radio event {:?}", event);
        match event {
            RadioEvent::TxComplete { status } => self.on_tx_complete(status, now),
            RadioEvent::BeamComplete => self.on_beam_complete(now),
            RadioEvent::BeamAck { source } => self.on_beam_ack(source, now),
            RadioEvent::AckReceived { from, routed } => {
                match self.queue.waiting_for(from) {
                    Some(handle) => self.on_success(handle, routed, now),
                    None => trace!("ACK from {} matches no waiting frame", from),
                }
            }
            RadioEvent::RoutedError { reporter } => self.on_routed_error(reporter, now),
            RadioEvent::ExploreResult { session, repeaters } => {
                self.on_explore_result(session, repeaters, now)
            }
            RadioEvent::ExploreReceived { frame } => {
                self.relay_explore(&frame, now);
            }
        }
        self.service(now);
    }

    /// Feed an explore frame heard on the air to the relay
    pub fn on_explore_frame(&mut self, frame: &Frame, now: Instant) -> RelayDecision {
        let irq = Arc::clone(&self.irq);
        let _cs = CriticalSection::enter(irq.as_ref());
        let decision = self.relay_explore(frame, now);
        self.service(now);
        decision
    }

    /// Advance timers, run one analysis step and start the next transmission
    pub fn tick(&mut self, now: Instant) {
        {
            let irq = Arc::clone(&self.irq);
            let _cs = CriticalSection::enter(irq.as_ref());

            self.queue.expire_delayed(now);
            for handle in self.queue.ack_expired(now) {
                debug!("ACK timeout for {:?}", handle);
                self.on_attempt_failed(handle, now);
            }
            for handle in self.explore.expire(now) {
                debug!("Explore result timeout for {:?}", handle);
                self.on_attempt_failed(handle, now);
            }
            self.service(now);
        }

        if self.analysis.is_running() {
            self.analysis.step(&mut self.adjacency, &mut self.most_used);
        }
        self.persist_if_due(now);
    }

    /// Earliest instant at which [`Engine::tick`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.pause_until,
            self.queue.ack_deadline(),
            self.queue.delayed_deadline(),
            self.explore.next_deadline(),
            self.relay_pending.iter().map(|(due, _)| *due).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Write routing state to storage; returns route cache records written
    pub fn persist(&mut self) -> usize {
        let written = self.route_cache.persist(self.nvm.as_mut());
        self.most_used.persist(self.nvm.as_mut());
        self.analysis.persist(self.nvm.as_mut());
        written
    }

    fn persist_if_due(&mut self, now: Instant) {
        if !self.route_cache.has_unsaved_changes() {
            return;
        }
        let interval = std::time::Duration::from_millis(self.config.persist_interval_ms);
        if self
            .last_persist
            .map_or(true, |last| now.duration_since(last) >= interval)
        {
            let written = self.persist();
            trace!("Persisted {} route cache records", written);
            self.last_persist = Some(now);
        }
    }

    fn check_destination(&self, dest: NodeId) -> Result<()> {
        if dest == self.own_id {
            return Err(TxError::InvalidDestination(format!(
                "{} is this node",
                dest
            )));
        }
        let lr_profile = self.config.profile == ChannelProfile::LongRange;
        if dest.is_long_range() != lr_profile {
            return Err(TxError::InvalidDestination(format!(
                "{} cannot be reached on the {:?} profile",
                dest, self.config.profile
            )));
        }
        Ok(())
    }

    /// Choose the first route and check the frame fits behind every header
    /// the ladder may still use
    fn prepare(&mut self, handle: TxHandle) -> Result<()> {
        if !self.select_next_route(handle)? {
            let dest = self.queue.get(handle)?.destination();
            return Err(TxError::InvalidDestination(format!("no route to {}", dest)));
        }
        let element = self.queue.get(handle)?;
        let mut max = self
            .frame_for(element, &element.route, 0)
            .header
            .max_payload(element.speed)?;
        if !element.destination().is_long_range() && element.scheme != RouteScheme::ResortExplore
        {
            let longest = vec![self.own_id; MAX_REPEATERS];
            let routed = self
                .frame_for(element, &longest, 0)
                .header
                .max_payload(self.start_speed(element))?;
            max = max.min(routed);
        }
        let size = element.request.payload.len();
        if size > max {
            return Err(TxError::FrameTooLarge { size, max });
        }
        Ok(())
    }

    fn start_speed(&self, element: &TxElement) -> Speed {
        if self.config.profile == ChannelProfile::LongRange {
            return Speed::Kbps100Lr;
        }
        element
            .request
            .speed
            .filter(|s| *s != Speed::Kbps100Lr)
            .unwrap_or(self.config.default_speed)
    }

    /// Highest speed not above `start` that every known node on the path supports
    fn common_speed(&self, route: &[NodeId], dest: NodeId, start: Speed) -> Speed {
        if dest.is_long_range() {
            return Speed::Kbps100Lr;
        }
        let mut speed = start;
        loop {
            let supported = std::iter::once(self.own_id)
                .chain(route.iter().copied())
                .chain(std::iter::once(dest))
                .all(|n| !self.adjacency.is_known(n) || self.adjacency.supports_speed(n, speed));
            match speed.lower() {
                Some(lower) if !supported => speed = lower,
                _ => return speed,
            }
        }
    }

    fn fits(&self, element: &TxElement, speed: Speed) -> bool {
        self.build_frame(element, 0)
            .header
            .max_payload(speed)
            .map_or(false, |max| element.request.payload.len() <= max)
    }

    fn beam_for(&self, dest: NodeId, route: &[NodeId]) -> BeamProgress {
        let needs_beam = self
            .adjacency
            .listening_mode(dest)
            .map_or(false, |mode| mode.needs_beam());
        if route.is_empty() && needs_beam {
            BeamProgress::Pending
        } else {
            BeamProgress::NotNeeded
        }
    }

    /// Move `handle` to the next untried route; false when the ladder is exhausted
    fn select_next_route(&mut self, handle: TxHandle) -> Result<bool> {
        loop {
            let (position, dest) = {
                let element = self.queue.get(handle)?;
                (element.ladder_pos, element.destination())
            };
            let Some(&scheme) = LADDER.get(position) else {
                return Ok(false);
            };
            if scheme != RouteScheme::Resolved {
                self.queue.get_mut(handle)?.ladder_pos += 1;
            }

            if scheme == RouteScheme::ResortExplore {
                if self.use_explore(handle)? {
                    return Ok(true);
                }
                continue;
            }

            let Some((route, cached_speed)) = self.route_candidate(handle, scheme, dest)? else {
                if scheme == RouteScheme::Resolved {
                    self.queue.get_mut(handle)?.ladder_pos += 1;
                }
                continue;
            };
            if self.queue.get(handle)?.tried.contains(&route) {
                trace!("{} route {:?} to {} already tried", scheme, route, dest);
                continue;
            }

            let start = {
                let element = self.queue.get(handle)?;
                let start = self.start_speed(element);
                cached_speed.map_or(start, |s| s.min(start))
            };
            let speed = self.common_speed(&route, dest, start);
            let beam = self.beam_for(dest, &route);

            let element = self.queue.get_mut(handle)?;
            element.scheme = scheme;
            element.route = route.clone();
            element.tried.push(route);
            element.speed = speed;
            element.route_speed = speed;
            element.route_transmissions = 0;
            element.lbt_since = None;
            element.beam = beam;
            let element = self.queue.get(handle)?;
            if !self.fits(element, speed) {
                debug!(
                    "Frame to {} does not fit behind {} route {:?}",
                    dest, scheme, element.route
                );
                continue;
            }
            let element = self.queue.get_mut(handle)?;
            debug!(
                "Trying {} route {:?} to {} at {}",
                scheme, element.route, dest, speed
            );
            return Ok(true);
        }
    }

    fn route_candidate(
        &mut self,
        handle: TxHandle,
        scheme: RouteScheme,
        dest: NodeId,
    ) -> Result<Option<(Vec<NodeId>, Option<Speed>)>> {
        if dest.is_long_range() {
            return Ok((scheme == RouteScheme::Direct).then(|| (Vec::new(), None)));
        }
        let cached = |selector| {
            self.route_cache
                .get(dest, selector)
                .map(|line| (line.repeaters().to_vec(), Some(line.speed())))
        };
        let candidate = match scheme {
            RouteScheme::CachedStatic => cached(RouteSelector::AppStatic),
            RouteScheme::CachedLwr => cached(RouteSelector::Lwr),
            RouteScheme::CachedNlwr => cached(RouteSelector::Nlwr),
            RouteScheme::Direct => self
                .adjacency
                .get_neighbors(self.own_id)?
                .contains(dest)
                .then(|| (Vec::new(), None)),
            RouteScheme::Resolved => {
                let element = self.queue.get_mut(handle)?;
                let speed = element.speed;
                let mut search = element
                    .search
                    .take()
                    .unwrap_or_else(|| RouteSearch::new(speed));
                let next = search.next_route(&self.adjacency, &mut self.most_used, self.own_id, dest);
                self.queue.get_mut(handle)?.search = Some(search);
                next.map(|chain| (chain, None))
            }
            RouteScheme::ResortDirect => Some((Vec::new(), None)),
            RouteScheme::ResortExplore => None,
        };
        Ok(candidate)
    }

    /// Switch `handle` to an explore frame if allowed and a search slot is free
    fn use_explore(&mut self, handle: TxHandle) -> Result<bool> {
        let speed = self.config.explore.speed;
        let (dest, allowed) = {
            let element = self.queue.get(handle)?;
            let allowed = self.config.explore.enabled
                && element.request.explore
                && !element.destination().is_long_range();
            (element.destination(), allowed)
        };
        if !allowed {
            return Ok(false);
        }

        let previous = std::mem::replace(
            &mut self.queue.get_mut(handle)?.scheme,
            RouteScheme::ResortExplore,
        );
        if !self.fits(self.queue.get(handle)?, speed) {
            debug!("Frame to {} too large for an explore frame", dest);
            self.queue.get_mut(handle)?.scheme = previous;
            return Ok(false);
        }
        if let Err(e) = self.explore.enqueue(handle, dest) {
            debug!("Explore to {} not possible: {}", dest, e);
            self.queue.get_mut(handle)?.scheme = previous;
            return Ok(false);
        }

        let element = self.queue.get_mut(handle)?;
        element.route = Vec::new();
        element.speed = speed;
        element.route_speed = speed;
        element.route_transmissions = 0;
        element.lbt_since = None;
        element.beam = BeamProgress::NotNeeded;
        debug!("Falling back to explore search for {}", dest);
        Ok(true)
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        match self.config.profile {
            ChannelProfile::LongRange => self.sequence,
            _ => self.sequence & 0x0F,
        }
    }

    fn wakeup_for(&self, dest: NodeId) -> WakeupBeam {
        match self.adjacency.listening_mode(dest) {
            Some(ListeningMode::Frequent250ms) => WakeupBeam::Beam250ms,
            Some(ListeningMode::Frequent1000ms) => WakeupBeam::Beam1000ms,
            _ => WakeupBeam::None,
        }
    }

    fn build_frame(&self, element: &TxElement, sequence: u8) -> Frame {
        self.frame_for(element, &element.route, sequence)
    }

    /// Frame for `element` as it would look behind `route`
    fn frame_for(&self, element: &TxElement, route: &[NodeId], sequence: u8) -> Frame {
        let dest = element.destination();
        let explore = element.scheme == RouteScheme::ResortExplore;
        let ack = element.request.ack && !explore;

        let addressing = if explore {
            Addressing::Explore {
                destination: dest,
                explore: ExploreHeader::new_search(
                    self.config.explore.ttl,
                    self.config.explore.random_interval,
                ),
            }
        } else if route.is_empty() {
            Addressing::Singlecast { destination: dest }
        } else {
            let mut routed = RoutedHeader::outbound(dest, route.to_vec());
            if self.config.profile == ChannelProfile::ThreeChannel {
                routed.dest_wakeup = self.wakeup_for(dest);
            }
            Addressing::Routed(routed)
        };

        let header = match self.config.profile {
            ChannelProfile::TwoChannel => FrameHeader::TwoChannel(Header2ch {
                home_id: self.config.home_id,
                source: self.own_id,
                ack,
                low_power: false,
                speed_modified: element.speed != element.route_speed,
                multicast_followup: false,
                source_wakeup: WakeupBeam::None,
                sequence,
                addressing,
            }),
            ChannelProfile::ThreeChannel => FrameHeader::ThreeChannel(Header3ch {
                home_id: self.config.home_id,
                source: self.own_id,
                ack,
                low_power: false,
                multicast_followup: false,
                source_wakeup: WakeupBeam::None,
                sequence,
                extension: None,
                addressing,
            }),
            ChannelProfile::LongRange => FrameHeader::LongRange(HeaderLr {
                home_id: self.config.home_id,
                source: self.own_id,
                destination: dest,
                ack,
                kind: LrFrameKind::Singlecast,
                sequence,
                noise_floor: NOISE_FLOOR_UNKNOWN,
                tx_power: self.config.lr_tx_power_dbm,
                extension: None,
            }),
        };
        Frame::new(header, element.request.payload.clone())
    }

    /// Put the next frame, beam or relay on the air if the radio is free
    fn service(&mut self, now: Instant) {
        if self.pause_until.map_or(false, |until| now < until) {
            return;
        }
        self.pause_until = None;

        match self.on_air {
            Some(OnAir::BeamGap(handle)) => {
                self.on_air = None;
                self.send_beam(handle, now);
                return;
            }
            Some(_) => return,
            None => {}
        }
        if self.send_due_relay(now) {
            return;
        }
        if let Some(handle) = self.queue.next_ready() {
            if let Ok(element) = self.queue.get_mut(handle) {
                element.state = TxState::Transmitting;
            }
            self.send_beam(handle, now);
        }
    }

    /// Send the next beam (fragment), or the data frame once beaming is done
    fn send_beam(&mut self, handle: TxHandle, now: Instant) {
        let profile = self.config.profile;
        let fragments = self.config.beam_fragments();
        let Ok(element) = self.queue.get(handle) else {
            return;
        };
        if element.cancel_requested {
            self.finish(handle, TxStatus::Cancelled);
            return;
        }
        let dest = element.destination();
        let duration_ms = self
            .adjacency
            .listening_mode(dest)
            .and_then(|mode| mode.beam_ms())
            .map_or(1000, u64::from);

        let (progress, kind) = match (element.beam, profile) {
            (BeamProgress::Pending | BeamProgress::Continuous, ChannelProfile::TwoChannel) => (
                BeamProgress::Continuous,
                BeamKind::Continuous { duration_ms },
            ),
            (BeamProgress::Pending, _) if fragments > 0 => (
                BeamProgress::Fragments {
                    sent: 0,
                    total: fragments,
                },
                BeamKind::Fragment {
                    index: 0,
                    total: fragments,
                },
            ),
            (BeamProgress::Fragments { sent, total }, _) => (
                element.beam,
                BeamKind::Fragment { index: sent, total },
            ),
            _ => {
                self.send_data(handle, now);
                return;
            }
        };

        if let Ok(element) = self.queue.get_mut(handle) {
            element.beam = progress;
        }
        let beam = BeamFragment {
            handle,
            destination: dest,
            profile,
            kind,
        };
        match self.radio.transmit_beam(&beam) {
            Ok(()) => {
                trace!("Beam {:?} to {}", kind, dest);
                self.on_air = Some(OnAir::Beam(handle));
            }
            Err(e) => {
                warn!("Radio refused beam to {}: {}", dest, e);
                self.on_attempt_failed(handle, now);
            }
        }
    }

    fn send_data(&mut self, handle: TxHandle, now: Instant) {
        let sequence = self.next_sequence();
        let Ok(element) = self.queue.get(handle) else {
            return;
        };
        let frame = self.build_frame(element, sequence);
        let speed = element.speed;
        let dest = element.destination();
        let bytes = match frame.encode(speed) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Frame to {} cannot be encoded at {}: {}", dest, speed, e);
                self.finish(handle, TxStatus::FrameTooLarge);
                return;
            }
        };
        let tx = TxFrame {
            handle: Some(handle),
            destination: Some(dest),
            profile: self.config.profile,
            speed,
            ack_requested: frame.header.ack_requested(),
            bytes,
        };
        let explore = element.scheme == RouteScheme::ResortExplore;

        match self.radio.transmit(&tx) {
            Ok(()) => {
                trace!("Frame #{} to {} at {} ({} bytes)", sequence, dest, speed, tx.bytes.len());
                if let Ok(element) = self.queue.get_mut(handle) {
                    element.explore_session = explore.then_some(sequence);
                }
                self.on_air = Some(OnAir::Data(handle));
            }
            Err(e) => {
                warn!("Radio refused frame to {}: {}", dest, e);
                self.on_attempt_failed(handle, now);
            }
        }
    }

    fn send_due_relay(&mut self, now: Instant) -> bool {
        let Some(index) = self.relay_pending.iter().position(|(due, _)| *due <= now) else {
            return false;
        };
        let (_, frame) = self.relay_pending.remove(index);
        let speed = self.config.explore.speed;
        let bytes = match frame.encode(speed) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Explore relay dropped: {}", e);
                return false;
            }
        };
        let tx = TxFrame {
            handle: None,
            destination: frame.header.destination(),
            profile: self.config.profile,
            speed,
            ack_requested: false,
            bytes,
        };
        match self.radio.transmit(&tx) {
            Ok(()) => {
                self.on_air = Some(OnAir::Relay);
                true
            }
            Err(e) => {
                warn!("Radio refused explore relay: {}", e);
                false
            }
        }
    }

    fn relay_explore(&mut self, frame: &Frame, now: Instant) -> RelayDecision {
        let decision = self.relay.handle(frame, now);
        match &decision {
            RelayDecision::Rebroadcast { frame, delay } => {
                if self.adjacency.is_repeater(self.own_id) {
                    self.relay_pending.push((now + *delay, frame.clone()));
                } else {
                    trace!("Not a repeater, explore frame not relayed");
                }
            }
            RelayDecision::Reached { source, repeaters } => {
                self.answer_explore(frame, *source, repeaters, now)
            }
            RelayDecision::SearchResult { session, repeaters } => {
                self.on_explore_result(*session, repeaters.clone(), now)
            }
            _ => {}
        }
        decision
    }

    /// A search reached us: learn the way back and tell the originator
    fn answer_explore(
        &mut self,
        request: &Frame,
        source: NodeId,
        repeaters: &[NodeId],
        now: Instant,
    ) {
        let back: Vec<NodeId> = repeaters.iter().rev().copied().collect();
        let stored = RouteCacheLine::new(back, self.config.explore.speed, RouteSource::Explore)
            .and_then(|line| self.route_cache.store(source, line));
        match stored {
            Ok(result) => debug!("Explore route to {} cached: {:?}", source, result.flags),
            Err(e) => warn!("Explore route to {} not cached: {}", source, e),
        }

        match search_result(request, self.own_id) {
            Some(result) => self.relay_pending.push((now, result)),
            None => trace!("No search result for explore from {}", source),
        }
    }

    fn on_tx_complete(&mut self, status: PhyStatus, now: Instant) {
        match self.on_air {
            Some(OnAir::Relay) => {
                self.on_air = None;
                trace!("Explore relay sent: {:?}", status);
            }
            Some(OnAir::Data(handle)) => {
                self.on_air = None;
                self.on_data_sent(handle, status, now);
            }
            // Beams end with BeamComplete; only a busy channel is reported here
            Some(OnAir::Beam(handle)) if status != PhyStatus::Ok => {
                self.on_air = None;
                match status {
                    PhyStatus::LbtFailure => self.on_lbt_failure(handle, now),
                    _ => self.on_attempt_failed(handle, now),
                }
            }
            other => trace!("TX complete ({:?}) while {:?}", status, other),
        }
    }

    fn on_data_sent(&mut self, handle: TxHandle, status: PhyStatus, now: Instant) {
        let explore_timeout =
            std::time::Duration::from_millis(self.config.explore.result_timeout_ms);
        let Ok(element) = self.queue.get_mut(handle) else {
            return;
        };
        if matches!(status, PhyStatus::Ok | PhyStatus::Failed) {
            element.transmit_count += 1;
        }

        match status {
            PhyStatus::Ok => {
                element.lbt_since = None;
                if element.scheme == RouteScheme::ResortExplore {
                    element.state = TxState::Waiting;
                    let session = element.explore_session.unwrap_or_default();
                    self.explore.mark_sent(handle, session, now + explore_timeout);
                } else if element.request.ack {
                    element.state = TxState::Waiting;
                    element.ack_deadline = Some(now + self.config.ack_timeout(element.route.len()));
                } else {
                    self.on_success(handle, false, now);
                }
            }
            PhyStatus::LbtFailure => self.on_lbt_failure(handle, now),
            PhyStatus::TooLarge => {
                warn!("Radio rejected frame to {} as too large", element.destination());
                self.finish(handle, TxStatus::FrameTooLarge);
            }
            PhyStatus::Failed => self.on_attempt_failed(handle, now),
        }
    }

    /// Busy channel: retransmit unchanged while inside the LBT window
    fn on_lbt_failure(&mut self, handle: TxHandle, now: Instant) {
        let window = std::time::Duration::from_millis(self.config.timing.lbt_window_ms);
        let Ok(element) = self.queue.get_mut(handle) else {
            return;
        };
        let since = *element.lbt_since.get_or_insert(now);
        if now.duration_since(since) < window && !element.cancel_requested {
            trace!("LBT failure towards {}, retransmitting", element.destination());
            element.state = TxState::ReadyToSend;
            return;
        }
        debug!("Channel busy for {:?}, giving up attempt", now.duration_since(since));
        element.lbt_since = None;
        self.on_attempt_failed(handle, now);
    }

    /// One physical attempt failed: retry, downgrade speed or move to the next route
    fn on_attempt_failed(&mut self, handle: TxHandle, now: Instant) {
        let retries = self.config.retries_per_route;
        let Ok(element) = self.queue.get_mut(handle) else {
            return;
        };
        element.ack_deadline = None;
        if element.cancel_requested {
            self.finish(handle, TxStatus::Cancelled);
            return;
        }
        if element.scheme == RouteScheme::ResortExplore {
            self.explore.remove(handle);
            self.on_route_failed(handle, now);
            return;
        }

        element.route_transmissions += 1;
        if element.beam != BeamProgress::NotNeeded {
            element.beam = BeamProgress::Pending;
        }
        if element.route_transmissions <= retries {
            element.state = TxState::ReadyToSend;
            debug!(
                "Retransmission {} of {} route to {}",
                element.route_transmissions,
                element.scheme,
                element.destination()
            );
            return;
        }

        if let Some(lower) = self.lower_speed(handle) {
            if let Ok(element) = self.queue.get_mut(handle) {
                debug!("Retrying route to {} at {}", element.destination(), lower);
                element.speed = lower;
                element.route_transmissions = 0;
                element.state = TxState::ReadyToSend;
            }
            return;
        }
        self.on_route_failed(handle, now);
    }

    /// Next lower speed the whole route supports and the frame fits at
    fn lower_speed(&self, handle: TxHandle) -> Option<Speed> {
        let element = self.queue.get(handle).ok()?;
        let dest = element.destination();
        let mut candidate = next_lower_speed(&self.adjacency, self.own_id, dest, element.speed);
        while let Some(speed) = candidate {
            let route_ok = element
                .route
                .iter()
                .all(|n| self.adjacency.supports_speed(*n, speed));
            if route_ok && self.fits(element, speed) {
                return Some(speed);
            }
            candidate = next_lower_speed(&self.adjacency, self.own_id, dest, speed);
        }
        None
    }

    fn on_routed_error(&mut self, reporter: NodeId, now: Instant) {
        let failed = self.queue.handles().into_iter().find(|h| {
            self.queue.get(*h).map_or(false, |e| {
                e.state == TxState::Waiting && e.route.contains(&reporter)
            })
        });
        let Some(handle) = failed else {
            trace!("Routed error from {} matches no waiting frame", reporter);
            return;
        };
        let cancelled = match self.queue.get_mut(handle) {
            Ok(element) => {
                element.ack_deadline = None;
                element.cancel_requested
            }
            Err(_) => return,
        };
        debug!("Repeater {} reported a broken route", reporter);
        if cancelled {
            self.finish(handle, TxStatus::Cancelled);
        } else {
            self.on_route_failed(handle, now);
        }
    }

    /// Every retry of the current route failed
    fn on_route_failed(&mut self, handle: TxHandle, _now: Instant) {
        let Ok(element) = self.queue.get(handle) else {
            return;
        };
        let dest = element.destination();
        let scheme = element.scheme;
        let entry_point = element.route.first().copied().unwrap_or(dest);

        if scheme != RouteScheme::ResortExplore {
            self.most_used.update(false, entry_point, &self.adjacency);
        }
        if matches!(scheme, RouteScheme::CachedLwr | RouteScheme::CachedNlwr) {
            let selector = if scheme == RouteScheme::CachedLwr
                && self.route_cache.get(dest, RouteSelector::Nlwr).is_some()
            {
                RouteSelector::Lwr
            } else {
                RouteSelector::Nlwr
            };
            if let Err(e) = self.route_cache.exile(dest, selector) {
                debug!("Failed route to {} kept: {}", dest, e);
            }
        }

        match self.select_next_route(handle) {
            Ok(true) => {
                if let Ok(element) = self.queue.get_mut(handle) {
                    element.state = TxState::ReadyToSend;
                }
            }
            Ok(false) | Err(_) => {
                let status = if scheme == RouteScheme::ResortExplore {
                    TxStatus::NoRoute
                } else {
                    TxStatus::NoAck
                };
                warn!("All routes to {} exhausted", dest);
                self.finish(handle, status);
            }
        }
    }

    fn on_success(&mut self, handle: TxHandle, routed_ack: bool, now: Instant) {
        let Ok(element) = self.queue.get(handle) else {
            return;
        };
        let dest = element.destination();
        let scheme = element.scheme;
        let speed = element.speed;
        let route = element.route.clone();

        self.most_used
            .update(true, route.first().copied().unwrap_or(dest), &self.adjacency);

        if !dest.is_long_range() && scheme != RouteScheme::CachedStatic {
            let source = if scheme == RouteScheme::ResortExplore {
                RouteSource::Explore
            } else {
                RouteSource::RoutedFrame
            };
            let stored = RouteCacheLine::new(route, speed, source)
                .and_then(|line| self.route_cache.store(dest, line));
            match stored {
                Ok(result) => trace!("Route to {} cached: {:?}", dest, result.flags),
                Err(e) => warn!("Working route to {} not cached: {}", dest, e),
            }
        }
        if routed_ack {
            self.pause_until = Some(now + self.config.routed_ack_pause(speed));
        }
        self.finish(handle, TxStatus::Ok);
    }

    fn on_beam_complete(&mut self, now: Instant) {
        let Some(OnAir::Beam(handle)) = self.on_air else {
            trace!("Beam complete while {:?}", self.on_air);
            return;
        };
        self.on_air = None;
        let gap = self.config.beam_gap();
        let Ok(element) = self.queue.get_mut(handle) else {
            return;
        };
        if element.cancel_requested {
            self.finish(handle, TxStatus::Cancelled);
            return;
        }
        match element.beam {
            BeamProgress::Fragments { sent, total } if sent + 1 < total => {
                element.beam = BeamProgress::Fragments {
                    sent: sent + 1,
                    total,
                };
                self.on_air = Some(OnAir::BeamGap(handle));
                self.pause_until = Some(now + gap);
            }
            _ => {
                element.beam = BeamProgress::Done;
                self.send_data(handle, now);
            }
        }
    }

    /// The FLiRS destination woke up: stop beaming and send the data frame
    fn on_beam_ack(&mut self, source: NodeId, now: Instant) {
        let handle = match self.on_air {
            Some(OnAir::Beam(handle)) | Some(OnAir::BeamGap(handle)) => handle,
            _ => return,
        };
        let Ok(element) = self.queue.get_mut(handle) else {
            return;
        };
        if element.destination() != source {
            return;
        }
        debug!("Beam ACK from {}, ending train", source);
        element.beam = BeamProgress::Done;
        self.on_air = None;
        self.pause_until = None;
        self.send_data(handle, now);
    }

    fn on_explore_result(&mut self, session: u8, repeaters: Vec<NodeId>, now: Instant) {
        let Some(search) = self.explore.take_result(session) else {
            trace!("Explore result {} matches no search", session);
            return;
        };
        let Ok(element) = self.queue.get_mut(search.handle) else {
            return;
        };
        debug!("Explore found {:?} to {}", repeaters, search.destination);
        element.route = repeaters;
        self.on_success(search.handle, false, now);
    }

    fn finish(&mut self, handle: TxHandle, status: TxStatus) {
        let Ok(element) = self.queue.release(handle) else {
            return;
        };
        self.explore.remove(handle);
        if let Some(OnAir::Beam(h) | OnAir::BeamGap(h) | OnAir::Data(h)) = self.on_air {
            if h == handle {
                self.on_air = None;
                self.pause_until = None;
            }
        }
        self.complete(element, status);
    }

    fn complete(&mut self, mut element: TxElement, status: TxStatus) {
        let report = element.report(status);
        if status.is_ok() {
            debug!(
                "Frame to {} delivered via {} route {:?} after {} transmissions",
                element.destination(),
                report.scheme,
                report.route,
                report.transmit_count
            );
        } else {
            info!(
                "Frame to {} failed: {} after {} transmissions",
                element.destination(),
                status,
                report.transmit_count
            );
        }
        if let Some(callback) = element.callback.take() {
            callback(report);
        }
        if self.queue.is_empty() {
            self.listeners.notify();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("own_id", &self.own_id)
            .field("profile", &self.config.profile)
            .field("queue", &self.queue)
            .field("on_air", &self.on_air)
            .field("pause_until", &self.pause_until)
            .finish()
    }
}
