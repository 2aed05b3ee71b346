//! StateMesh — secure distributed state transfer
//!
//! Packages opaque state blobs, fragments them, and distributes the
//! fragments across a swarm of nodes over authenticated channels, with
//! replication, integrity verification, durable persistence, and
//! merge/translate transformations over persisted states.

pub mod channel;
pub mod config;
pub mod error;
pub mod persist;
pub mod state;
pub mod swarm;
pub mod transfer;
pub mod transform;

pub use channel::SecureChannel;
pub use config::CoreConfig;
pub use error::MeshError;
pub use persist::PersistenceManager;
pub use state::{Fragment, State, StateEncoder};
pub use swarm::{DistributionRecord, Swarm, SwarmDistributor};
pub use transfer::{TransferProtocol, TransferResult};
pub use transform::{ConflictStrategy, TransformationEngine};
