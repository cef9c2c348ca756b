//! Distributed route propagation
//!
//! - `propagate`: tracer merging, loop suppression and delta propagation
//! - `collision`: contested gnodes and the reconciliation rule

pub mod collision;
pub mod propagate;

pub use collision::{yields, ContestInfo, Contests, ReconcileOutcome};
pub use propagate::{EngineOutput, LevelState, OutboundTracer, RouteChange, RoutingEngine};
