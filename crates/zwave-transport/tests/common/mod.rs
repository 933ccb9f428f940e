#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use zwave_protocol::{
    Addressing, ChannelProfile, Frame, FrameHeader, ListeningMode, NodeId, Speed,
};
use zwave_routing::{MemoryNvm, NodeInfo};
use zwave_transport::{
    BeamFragment, Engine, EngineConfig, IrqControl, PhyStatus, RadioEvent, RadioPal, TxFrame, TxHandle,
    TxReport, TxRequest,
};

#[derive(Debug, Clone)]
pub enum Sent {
    Frame(TxFrame),
    Beam(BeamFragment),
}

/// Radio that records everything it is asked to send
#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    log: Arc<Mutex<Vec<Sent>>>,
}

impl MockRadio {
    pub fn sent(&self) -> Vec<Sent> {
        self.log.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<TxFrame> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Frame(f) => Some(f),
                Sent::Beam(_) => None,
            })
            .collect()
    }

    pub fn beams(&self) -> Vec<BeamFragment> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Beam(b) => Some(b),
                Sent::Frame(_) => None,
            })
            .collect()
    }
}

impl RadioPal for MockRadio {
    fn transmit(&mut self, frame: &TxFrame) -> zwave_transport::Result<()> {
        self.log.lock().unwrap().push(Sent::Frame(frame.clone()));
        Ok(())
    }

    fn transmit_beam(&mut self, beam: &BeamFragment) -> zwave_transport::Result<()> {
        self.log.lock().unwrap().push(Sent::Beam(beam.clone()));
        Ok(())
    }
}

pub fn node(id: u16) -> NodeId {
    NodeId::new(id).unwrap()
}

pub fn config(profile: ChannelProfile) -> EngineConfig {
    EngineConfig {
        profile,
        node_id: if profile == ChannelProfile::LongRange { 256 } else { 1 },
        ..EngineConfig::default()
    }
}

/// Decoded header of a frame handed to the radio
pub fn header(frame: &TxFrame) -> FrameHeader {
    Frame::decode(frame.profile, &frame.bytes, frame.speed)
        .unwrap()
        .header
}

fn addressing(header: &FrameHeader) -> Option<&Addressing> {
    match header {
        FrameHeader::TwoChannel(h) => Some(&h.addressing),
        FrameHeader::ThreeChannel(h) => Some(&h.addressing),
        FrameHeader::LongRange(_) => None,
    }
}

/// Repeaters of a routed frame; empty for direct frames
pub fn repeaters(frame: &TxFrame) -> Vec<NodeId> {
    header(frame)
        .routed()
        .map(|r| r.repeaters.clone())
        .unwrap_or_default()
}

/// Sequence number of an explore frame, which doubles as its session id
pub fn explore_session(frame: &TxFrame) -> Option<u8> {
    let header = header(frame);
    match addressing(&header) {
        Some(Addressing::Explore { .. }) => Some(match &header {
            FrameHeader::TwoChannel(h) => h.sequence,
            FrameHeader::ThreeChannel(h) => h.sequence,
            FrameHeader::LongRange(h) => h.sequence,
        }),
        _ => None,
    }
}

pub type ReportSlot = Arc<Mutex<Vec<TxReport>>>;

/// Engine plus a manual clock
pub struct Harness {
    pub engine: Engine,
    pub radio: MockRadio,
    pub now: Instant,
    seen: usize,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let radio = MockRadio::default();
        let engine = Engine::new(config, Box::new(radio.clone()), Box::new(MemoryNvm::new()))
            .unwrap()
            .with_explore_seed(7);
        Harness {
            engine,
            radio,
            now: Instant::now(),
            seen: 0,
        }
    }

    pub fn with_irq(self, irq: Arc<dyn IrqControl>) -> Self {
        Harness {
            engine: self.engine.with_irq(irq),
            ..self
        }
    }

    pub fn classic() -> Self {
        Self::new(config(ChannelProfile::TwoChannel))
    }

    pub fn add_repeater(&mut self, id: u16) {
        self.engine
            .adjacency_mut()
            .add_node(node(id), NodeInfo::repeater())
            .unwrap();
    }

    pub fn add_end_device(&mut self, id: u16, listening: ListeningMode) {
        self.engine
            .adjacency_mut()
            .add_node(node(id), NodeInfo::end_device(listening, Speed::Kbps100))
            .unwrap();
    }

    pub fn link(&mut self, a: u16, b: u16) {
        let adj = self.engine.adjacency_mut();
        for (x, y) in [(a, b), (b, a)] {
            let mut row = adj.get_neighbors(node(x)).unwrap();
            row.set(node(y)).unwrap();
            adj.set_neighbors(node(x), row).unwrap();
        }
    }

    pub fn submit(&mut self, request: TxRequest) -> (TxHandle, ReportSlot) {
        let reports: ReportSlot = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&reports);
        let handle = self
            .engine
            .submit(
                request,
                Some(Box::new(move |r| slot.lock().unwrap().push(r))),
                self.now,
            )
            .unwrap();
        (handle, reports)
    }

    /// Oldest radio request not yet looked at
    pub fn next_sent(&mut self) -> Option<Sent> {
        let sent = self.radio.sent();
        let next = sent.get(self.seen).cloned();
        if next.is_some() {
            self.seen += 1;
        }
        next
    }

    pub fn event(&mut self, event: RadioEvent) {
        self.engine.handle_event(event, self.now);
    }

    pub fn complete(&mut self, status: PhyStatus) {
        self.event(RadioEvent::TxComplete { status });
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.engine.tick(self.now);
    }

    /// Jump to the engine's next deadline; false when nothing is pending
    pub fn advance_to_deadline(&mut self) -> bool {
        match self.engine.next_deadline() {
            Some(deadline) => {
                if deadline > self.now {
                    self.now = deadline;
                }
                self.engine.tick(self.now);
                true
            }
            None => false,
        }
    }

    /// Complete every beam and frame until the engine goes quiet
    ///
    /// `respond` is asked after each frame leaves the radio and may answer
    /// with an ACK or any other event.
    pub fn run<F>(&mut self, mut respond: F)
    where
        F: FnMut(&TxFrame) -> Option<RadioEvent>,
    {
        for _ in 0..10_000 {
            match self.next_sent() {
                Some(Sent::Frame(frame)) => {
                    self.complete(PhyStatus::Ok);
                    if let Some(event) = respond(&frame) {
                        self.event(event);
                    }
                }
                Some(Sent::Beam(_)) => self.event(RadioEvent::BeamComplete),
                None => {
                    if !self.advance_to_deadline() {
                        return;
                    }
                }
            }
        }
        panic!("engine did not go quiet");
    }
}

/// Responder acknowledging every frame from its destination
pub fn ack_all(frame: &TxFrame) -> Option<RadioEvent> {
    frame.destination.map(|from| RadioEvent::AckReceived {
        from,
        routed: !repeaters(frame).is_empty(),
    })
}

pub fn no_ack(_: &TxFrame) -> Option<RadioEvent> {
    None
}
