//! Swarm — destination nodes and fragment distribution

pub mod distributor;
pub mod node;

pub use distributor::{
    placement, ChecksumFailure, DistributionRecord, SessionMap, SwarmDistributor,
};
pub use node::{FragmentAck, LoopbackNode, NodeEndpoint, Swarm};
