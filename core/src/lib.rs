// gnodemesh core: hierarchical mesh routing
//
// Nodes organise themselves into nested groups ("gnodes") and exchange
// route deltas with their direct neighbours only. Each node keeps routes to
// the gnodes of every level, never to every node of the network.

pub mod address;
pub mod config;
pub mod engine;
pub mod error;
pub mod neighbour;
pub mod node;
pub mod protocol;
pub mod route;
pub mod runtime;
pub mod sim;

pub use address::{AddressMap, Nip, SlotChange};
pub use config::{ConfigError, MetricWeights, RoutingConfig};
pub use engine::{ContestInfo, ReconcileOutcome, RouteChange, RoutingEngine};
pub use error::{MeshError, Result};
pub use neighbour::{NeighbourEvent, NeighbourState, NeighbourTable};
pub use node::{Device, Node, NodeOutput, Outbound};
pub use protocol::{decode_frame, encode_frame, TracerMessage, WireMessage};
pub use route::{Metric, Rem, Route, RouteTable};
pub use sim::{SimNetwork, Topology};

/// Fresh random network id for a node that starts a new fragment
pub fn random_netid() -> u64 {
    rand::random()
}
