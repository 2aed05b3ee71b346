//! Core configuration surface
//!
//! One flat struct covering the tunables of the pipeline: fragment sizing,
//! replication, timeouts, concurrency, and the default merge strategy.

use serde::{Deserialize, Serialize};

use crate::transform::ConflictStrategy;

/// Configuration for the transfer/distribution/persistence pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Bytes per fragment (MTU-friendly default)
    pub fragment_size: usize,
    /// Minimum number of distinct nodes holding each fragment
    pub replication_factor: usize,
    /// Deadline for a node to answer a handshake
    pub handshake_timeout_ms: u64,
    /// Deadline for a node to acknowledge a fragment
    pub ack_timeout_ms: u64,
    /// Cap on in-flight node operations; effective bound is
    /// min(node_count, max_concurrent_node_ops)
    pub max_concurrent_node_ops: usize,
    /// Session lifetime before signing is refused
    pub session_ttl_secs: u64,
    /// Default strategy for merge conflict resolution
    pub conflict_strategy: ConflictStrategy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            fragment_size: 64 * 1024,
            replication_factor: 2,
            handshake_timeout_ms: 5_000,
            ack_timeout_ms: 3_000,
            max_concurrent_node_ops: 8,
            session_ttl_secs: 300,
            conflict_strategy: ConflictStrategy::Consensus,
        }
    }
}

impl CoreConfig {
    /// Effective concurrency bound for a swarm of the given size
    pub fn concurrency_for(&self, node_count: usize) -> usize {
        node_count.min(self.max_concurrent_node_ops).max(1)
    }
}
