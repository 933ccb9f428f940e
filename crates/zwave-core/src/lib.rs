//! Z-Wave Mesh Core Library
//!
//! Ties the protocol crates together for embedding in a host:
//! - Protocol (node ids, speeds, frame header codecs)
//! - Routing (adjacency, route cache, route search, persistence)
//! - Transport (transmit queue and transmission engine)
//!
//! plus the ambient pieces a host needs to run them: configuration loading,
//! tracing setup and the async task that drives the engine.

pub mod config;
pub mod logging;
pub mod task;

pub use zwave_protocol as protocol;
pub use zwave_routing as routing;
pub use zwave_transport as transport;

pub use config::{load_config, LoggingConfig, NodeConfig};
pub use logging::init_tracing;
pub use task::{ProtocolHandle, ProtocolTask, DEFAULT_TICK};

pub use protocol::ProtocolError;
pub use routing::RoutingError;
pub use transport::{Engine, TxError};
