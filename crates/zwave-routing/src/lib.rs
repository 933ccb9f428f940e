//! Z-Wave Route Resolution
//!
//! This module decides which path a frame takes through the mesh:
//! - Node adjacency store (routing table and node capabilities)
//! - Route cache with LWR / NLWR slots and application static routes
//! - Breadth-first route search and the next-route iterator
//! - Most-used entry point bookkeeping
//! - Incremental routing-table analysis (preferred repeaters)
//! - Non-volatile storage boundary

pub mod adjacency;
pub mod analysis;
pub mod error;
pub mod most_used;
pub mod node_mask;
pub mod persistence;
pub mod resolver;
pub mod route_cache;

pub use adjacency::{AdjacencyStore, NodeInfo, SpeedSupport};
pub use analysis::{AnalysisState, RoutingAnalysis, RoutingInfoState};
pub use error::{Result, RoutingError};
pub use most_used::{MostUsedEntry, MostUsedTable};
pub use node_mask::NodeMask;
pub use persistence::{FileNvm, MemoryNvm, NvmKey, NvmStore};
pub use resolver::{
    find_best_route, find_route_bounded, next_lower_speed, RouteSearch, MAX_ROUTING_ATTEMPTS,
};
pub use route_cache::{
    PriorityRouteKind, RouteCache, RouteCacheLine, RouteSelector, RouteSource, StoreFlags,
    StoreResult,
};
