//! Radio platform abstraction
//!
//! The engine hands fully encoded frames and beam requests to a [`RadioPal`].
//! Completions come back asynchronously: the PAL (or its interrupt handler)
//! posts [`RadioEvent`]s on a channel that the protocol task drains.

use tokio::sync::mpsc;
use tracing::trace;
use zwave_protocol::{ChannelProfile, Frame, NodeId, Speed};

use crate::error::Result;
use crate::slab::Handle;

/// Encoded frame ready for the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    /// Queue element the frame belongs to; `None` for explore relays
    pub handle: Option<Handle>,
    pub destination: Option<NodeId>,
    pub profile: ChannelProfile,
    pub speed: Speed,
    pub ack_requested: bool,
    /// Header and payload; the PHY appends checksum or CRC
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeamKind {
    /// 2-channel beam held for the whole duration
    Continuous { duration_ms: u64 },
    /// One fragment of a 3-channel or long-range train
    Fragment { index: u32, total: u32 },
}

/// Wake-up beam request for a FLiRS destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeamFragment {
    pub handle: Handle,
    pub destination: NodeId,
    pub profile: ChannelProfile,
    pub kind: BeamKind,
}

/// PHY outcome of one transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyStatus {
    Ok,
    /// Channel busy, nothing was sent
    LbtFailure,
    /// Frame exceeds what the PHY can send
    TooLarge,
    Failed,
}

/// Messages from the radio interrupt path to the protocol task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// The frame handed to [`RadioPal::transmit`] left the radio
    TxComplete { status: PhyStatus },
    /// The beam (or beam fragment) handed to [`RadioPal::transmit_beam`] ended
    BeamComplete,
    /// A FLiRS node answered a beam fragment
    BeamAck { source: NodeId },
    /// Transfer ACK or routed ACK from the destination
    AckReceived { from: NodeId, routed: bool },
    /// A repeater reported that the next hop did not answer
    RoutedError { reporter: NodeId },
    /// Search result for an explore frame we originated
    ExploreResult { session: u8, repeaters: Vec<NodeId> },
    /// Explore frame heard from another node
    ExploreReceived { frame: Frame },
}

/// Radio driver consumed by the engine
pub trait RadioPal: Send {
    /// Start sending `frame`; completion arrives as [`RadioEvent::TxComplete`]
    fn transmit(&mut self, frame: &TxFrame) -> Result<()>;

    /// Start a beam; completion arrives as [`RadioEvent::BeamComplete`]
    fn transmit_beam(&mut self, beam: &BeamFragment) -> Result<()>;
}

pub type RadioEventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// Cloneable sending side handed to the radio driver
#[derive(Debug, Clone)]
pub struct RadioEventSender {
    tx: mpsc::UnboundedSender<RadioEvent>,
}

impl RadioEventSender {
    /// Post an event; safe to call from any thread
    ///
    /// Returns false once the protocol task has gone away.
    pub fn send(&self, event: RadioEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                trace!("Radio event dropped, task gone: {:?}", e.0);
                false
            }
        }
    }
}

pub fn event_channel() -> (RadioEventSender, RadioEventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RadioEventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (tx, mut rx) = event_channel();
        let isr = tx.clone();
        assert!(isr.send(RadioEvent::BeamComplete));
        assert!(tx.send(RadioEvent::TxComplete {
            status: PhyStatus::Ok
        }));

        assert_eq!(rx.try_recv().unwrap(), RadioEvent::BeamComplete);
        assert_eq!(
            rx.try_recv().unwrap(),
            RadioEvent::TxComplete {
                status: PhyStatus::Ok
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = event_channel();
        drop(rx);
        assert!(!tx.send(RadioEvent::BeamComplete));
    }
}
