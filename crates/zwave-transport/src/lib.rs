//! Z-Wave Transport Module
//!
//! The transmit side of the protocol: a bounded, prioritised queue of
//! outgoing frames and the engine that walks each of them through route
//! selection, wake-up beams, retries and the explore fallback.
//!
//! The radio is reached through [`RadioPal`]; its completions come back as
//! [`RadioEvent`] messages which the owner of the [`Engine`] feeds in.

pub mod config;
pub mod critical;
pub mod engine;
pub mod error;
pub mod explore;
pub mod listeners;
pub mod radio;
pub mod slab;
pub mod tx_queue;

pub use config::{BeamConfig, EngineConfig, ExploreConfig, TimingConfig};
pub use critical::{CountingIrq, CriticalSection, IrqControl, NoopIrq};
pub use engine::Engine;
pub use error::{Result, TxError, TxStatus};
pub use explore::{search_result, ExploreQueue, ExploreRelay, RelayDecision};
pub use listeners::{ListenerId, QueueEmptyListener};
pub use radio::{
    event_channel, BeamFragment, BeamKind, PhyStatus, RadioEvent, RadioEventReceiver,
    RadioEventSender, RadioPal, TxFrame,
};
pub use slab::Handle;
pub use tx_queue::{
    RouteScheme, TxCallback, TxHandle, TxPriority, TxReport, TxRequest, TxState,
};
