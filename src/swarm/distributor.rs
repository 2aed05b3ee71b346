//! SwarmDistributor — fragment placement, fan-out, and integrity aggregation
//!
//! Placement is round-robin with wraparound: fragment `i` goes to nodes
//! `[(i + k) mod node_count : k in 0..replication_factor)`. Deterministic
//! given fragment count, node count, and replication factor, so
//! distributions are reproducible.
//!
//! Failure policy: an unacknowledged send is retried once against the same
//! node, then re-routed to the next ring node not already holding that
//! fragment. A checksum mismatch reported by a node is never retried; it
//! surfaces for caller decision.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::channel::{SecureChannel, SecureSession};
use crate::config::CoreConfig;
use crate::error::MeshError;
use crate::state::Fragment;
use crate::swarm::node::{NodeEndpoint, Swarm};

/// Sessions keyed by node, each exclusively owned by one in-flight transfer
pub type SessionMap = HashMap<String, Arc<tokio::sync::Mutex<SecureSession>>>;

/// A node-reported checksum that disagreed with the fragment's own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumFailure {
    pub node_id: String,
    pub index: usize,
    pub reported: String,
    pub expected: String,
}

/// Result of fanning a state's fragments across a swarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub distribution_id: String,
    pub state_id: String,
    pub total_fragments: usize,
    pub replication_factor: usize,
    /// Final fragment holdings: node -> fragment indices with clean acks
    pub assignments: BTreeMap<String, BTreeSet<usize>>,
    /// Node-reported acknowledgement checksums: node -> index -> hash
    pub ack_hashes: BTreeMap<String, BTreeMap<usize, String>>,
    /// Aggregate over the expected per-placement checksums, sorted order
    pub integrity_hash: String,
    /// Fragment indices for which the replication invariant could not be met
    pub degraded: Vec<usize>,
    /// Placements where a node acknowledged with a mismatched checksum
    pub checksum_failures: Vec<ChecksumFailure>,
    pub created_at: DateTime<Utc>,
}

impl DistributionRecord {
    /// Whether the replication invariant failed for any fragment
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Distribution {} | state {} | {} fragments x{} | {} nodes | degraded={} | checksum failures={}",
            &self.distribution_id[..8],
            &self.state_id[..8.min(self.state_id.len())],
            self.total_fragments,
            self.replication_factor,
            self.assignments.len(),
            self.degraded.len(),
            self.checksum_failures.len(),
        )
    }
}

/// Aggregate hash over per-node acknowledgement hashes in (node, index) order
fn aggregate_hash(hashes: &BTreeMap<String, BTreeMap<usize, String>>) -> String {
    let mut h = Sha256::new();
    for (node_id, by_index) in hashes {
        for (index, hash) in by_index {
            h.update(node_id.as_bytes());
            h.update(index.to_le_bytes());
            h.update(hash.as_bytes());
        }
    }
    h.update(b"statemesh-distribution-v1");
    hex::encode(h.finalize())
}

/// Ring placement: fragment index -> distinct node positions
pub fn placement(
    total_fragments: usize,
    node_count: usize,
    replication_factor: usize,
) -> Vec<Vec<usize>> {
    (0..total_fragments)
        .map(|i| {
            let mut nodes: Vec<usize> = Vec::new();
            for k in 0..replication_factor {
                let pos = (i + k) % node_count.max(1);
                if !nodes.contains(&pos) {
                    nodes.push(pos);
                }
            }
            nodes
        })
        .collect()
}

enum SendOutcome {
    /// Clean ack whose checksum matched the fragment's
    Acked(String),
    /// Node acknowledged but reported a different checksum
    ChecksumMismatch(String),
    /// Timeout, transport error, or node-side rejection
    Failed,
}

/// Fragment placement and integrity aggregation across a swarm
pub struct SwarmDistributor {
    config: CoreConfig,
}

impl SwarmDistributor {
    pub fn new(config: CoreConfig) -> Self {
        Self { config }
    }

    /// Fan fragments out across the swarm under the replication policy.
    ///
    /// Sends to different nodes proceed concurrently, bounded by
    /// `min(node_count, max_concurrent_node_ops)`; sends to the same node
    /// are sequential so its session sequence stays ordered.
    pub async fn distribute(
        &self,
        channel: &SecureChannel,
        fragments: &[Fragment],
        swarm: &Swarm,
        sessions: &SessionMap,
        replication_factor: usize,
    ) -> Result<DistributionRecord, MeshError> {
        let node_ids = swarm.node_ids();
        if node_ids.is_empty() {
            return Err(MeshError::NoEligibleNode(0));
        }
        let plan = placement(fragments.len(), node_ids.len(), replication_factor);

        // Group planned sends by node so each session is used sequentially.
        let mut per_node: HashMap<usize, Vec<usize>> = HashMap::new();
        for (frag_idx, nodes) in plan.iter().enumerate() {
            for &node_pos in nodes {
                per_node.entry(node_pos).or_default().push(frag_idx);
            }
        }

        info!(
            "Distributing {} fragments across {} nodes (rf={})",
            fragments.len(),
            node_ids.len(),
            replication_factor
        );

        // Holdings and ack hashes accumulated over both passes.
        let mut holders: Vec<BTreeSet<String>> = vec![BTreeSet::new(); fragments.len()];
        let mut ack_hashes: BTreeMap<String, BTreeMap<usize, String>> = BTreeMap::new();
        let mut expected_hashes: BTreeMap<String, BTreeMap<usize, String>> = BTreeMap::new();
        let mut checksum_failures: Vec<ChecksumFailure> = Vec::new();
        let mut failed_placements: Vec<(usize, usize)> = Vec::new(); // (fragment, node_pos)

        let concurrency = self.config.concurrency_for(node_ids.len());
        let node_jobs: Vec<(usize, Vec<usize>)> = per_node.into_iter().collect();

        let results: Vec<(usize, Vec<(usize, SendOutcome)>)> = stream::iter(node_jobs)
            .map(|(node_pos, frag_indices)| {
                let node_id = node_ids[node_pos].clone();
                let session = sessions.get(&node_id).cloned();
                let endpoint = swarm.endpoint(&node_id).cloned();
                async move {
                    let mut outcomes = Vec::with_capacity(frag_indices.len());
                    let (Some(session), Some(endpoint)) = (session, endpoint) else {
                        // No session (handshake failed earlier): everything
                        // assigned here must be re-routed.
                        for idx in frag_indices {
                            outcomes.push((idx, SendOutcome::Failed));
                        }
                        return (node_pos, outcomes);
                    };
                    for idx in frag_indices {
                        let outcome = self
                            .send_with_retry(channel, &endpoint, &session, &fragments[idx])
                            .await;
                        outcomes.push((idx, outcome));
                    }
                    (node_pos, outcomes)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (node_pos, outcomes) in results {
            let node_id = &node_ids[node_pos];
            for (idx, outcome) in outcomes {
                self.record_outcome(
                    node_id,
                    idx,
                    &fragments[idx],
                    outcome,
                    &mut holders,
                    &mut ack_hashes,
                    &mut expected_hashes,
                    &mut checksum_failures,
                );
                if !holders[idx].contains(node_id)
                    && !checksum_failures
                        .iter()
                        .any(|f| f.node_id == *node_id && f.index == idx)
                {
                    failed_placements.push((idx, node_pos));
                }
            }
        }

        // Re-route pass: walk the ring from the failed position, skipping
        // nodes that already hold the fragment.
        for (idx, failed_pos) in failed_placements {
            let mut rerouted = false;
            for step in 1..node_ids.len() {
                let candidate_pos = (failed_pos + step) % node_ids.len();
                let candidate_id = &node_ids[candidate_pos];
                if holders[idx].contains(candidate_id) {
                    continue;
                }
                let (Some(session), Some(endpoint)) =
                    (sessions.get(candidate_id), swarm.endpoint(candidate_id))
                else {
                    continue;
                };
                let outcome = self
                    .send_with_retry(channel, endpoint, session, &fragments[idx])
                    .await;
                let acked = matches!(outcome, SendOutcome::Acked(_));
                self.record_outcome(
                    candidate_id,
                    idx,
                    &fragments[idx],
                    outcome,
                    &mut holders,
                    &mut ack_hashes,
                    &mut expected_hashes,
                    &mut checksum_failures,
                );
                if acked {
                    info!(
                        "Re-routed fragment {} to node {} after failure at position {}",
                        idx, candidate_id, failed_pos
                    );
                    rerouted = true;
                    break;
                }
            }
            if !rerouted {
                warn!("No eligible node accepted re-routed fragment {}", idx);
            }
        }

        // The invariant is the requested factor itself: a swarm smaller than
        // rf can never satisfy it and every fragment is reported degraded.
        let degraded: Vec<usize> = holders
            .iter()
            .enumerate()
            .filter(|(_, h)| h.len() < replication_factor)
            .map(|(idx, _)| idx)
            .collect();
        if !degraded.is_empty() {
            warn!("Distribution degraded for fragments {:?}", degraded);
        }

        let mut assignments: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for (idx, nodes) in holders.iter().enumerate() {
            for node_id in nodes {
                assignments.entry(node_id.clone()).or_default().insert(idx);
            }
        }

        let record = DistributionRecord {
            distribution_id: uuid::Uuid::new_v4().to_string(),
            state_id: fragments
                .first()
                .map(|f| f.state_id.clone())
                .unwrap_or_default(),
            total_fragments: fragments.len(),
            replication_factor,
            assignments,
            ack_hashes,
            integrity_hash: aggregate_hash(&expected_hashes),
            degraded,
            checksum_failures,
            created_at: Utc::now(),
        };
        info!("{}", record.summary());
        Ok(record)
    }

    /// Recompute the aggregate hash from the node-reported acknowledgement
    /// hashes and compare against the recorded value
    pub fn verify_distribution_integrity(&self, record: &DistributionRecord) -> bool {
        aggregate_hash(&record.ack_hashes) == record.integrity_hash
    }

    async fn send_with_retry(
        &self,
        channel: &SecureChannel,
        endpoint: &Arc<dyn NodeEndpoint>,
        session: &Arc<tokio::sync::Mutex<SecureSession>>,
        fragment: &Fragment,
    ) -> SendOutcome {
        for attempt in 0..2 {
            match self.send_once(channel, endpoint, session, fragment).await {
                Ok(Some(ack_checksum)) => {
                    if ack_checksum == fragment.checksum {
                        return SendOutcome::Acked(ack_checksum);
                    }
                    // Never retried silently: systematic corruption must
                    // surface to the caller.
                    return SendOutcome::ChecksumMismatch(ack_checksum);
                }
                Ok(None) | Err(_) => {
                    if attempt == 0 {
                        warn!(
                            "Fragment {} send to node {} failed, retrying once",
                            fragment.index,
                            endpoint.node_id()
                        );
                    }
                }
            }
        }
        SendOutcome::Failed
    }

    /// One signed send; `Ok(None)` means the node rejected the message
    async fn send_once(
        &self,
        channel: &SecureChannel,
        endpoint: &Arc<dyn NodeEndpoint>,
        session: &Arc<tokio::sync::Mutex<SecureSession>>,
        fragment: &Fragment,
    ) -> Result<Option<String>, MeshError> {
        let (signature, sequence) = {
            let mut session = session.lock().await;
            channel.sign_payload(&mut session, &fragment.data)?
        };
        let Ok(ack) = tokio::time::timeout(
            Duration::from_millis(self.config.ack_timeout_ms),
            endpoint.store_fragment(fragment, &signature, sequence),
        )
        .await
        else {
            // Ack timeout; the caller retries and then re-routes.
            return Ok(None);
        };
        let ack = ack?;
        if !ack.accepted {
            return Ok(None);
        }
        // Acks must authenticate: the node signs over (checksum, sequence)
        // and the session watermark rejects replays.
        let verified = {
            let mut session = session.lock().await;
            channel.verify_signature(
                &mut session,
                ack.recomputed_checksum.as_bytes(),
                &ack.signature,
                ack.sequence,
            )
        };
        if !verified {
            warn!(
                "Unauthenticated ack from node {} for fragment {}",
                ack.node_id, fragment.index
            );
            return Ok(None);
        }
        Ok(Some(ack.recomputed_checksum))
    }

    #[allow(clippy::too_many_arguments)]
    fn record_outcome(
        &self,
        node_id: &str,
        idx: usize,
        fragment: &Fragment,
        outcome: SendOutcome,
        holders: &mut [BTreeSet<String>],
        ack_hashes: &mut BTreeMap<String, BTreeMap<usize, String>>,
        expected_hashes: &mut BTreeMap<String, BTreeMap<usize, String>>,
        checksum_failures: &mut Vec<ChecksumFailure>,
    ) {
        match outcome {
            SendOutcome::Acked(hash) => {
                holders[idx].insert(node_id.to_string());
                ack_hashes
                    .entry(node_id.to_string())
                    .or_default()
                    .insert(idx, hash);
                expected_hashes
                    .entry(node_id.to_string())
                    .or_default()
                    .insert(idx, fragment.checksum.clone());
            }
            SendOutcome::ChecksumMismatch(hash) => {
                ack_hashes
                    .entry(node_id.to_string())
                    .or_default()
                    .insert(idx, hash.clone());
                expected_hashes
                    .entry(node_id.to_string())
                    .or_default()
                    .insert(idx, fragment.checksum.clone());
                checksum_failures.push(ChecksumFailure {
                    node_id: node_id.to_string(),
                    index: idx,
                    reported: hash,
                    expected: fragment.checksum.clone(),
                });
            }
            SendOutcome::Failed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{State, StateEncoder};
    use crate::swarm::node::LoopbackNode;

    fn fast_config() -> CoreConfig {
        CoreConfig {
            ack_timeout_ms: 50,
            ..CoreConfig::default()
        }
    }

    async fn establish_all(channel: &SecureChannel, swarm: &Swarm) -> SessionMap {
        let mut sessions = SessionMap::new();
        for endpoint in swarm.endpoints() {
            if let Ok(session) = channel.establish_secure_connection(endpoint.as_ref()).await {
                sessions.insert(
                    endpoint.node_id(),
                    Arc::new(tokio::sync::Mutex::new(session)),
                );
            }
        }
        sessions
    }

    fn make_swarm(n: usize) -> (Swarm, Vec<Arc<LoopbackNode>>) {
        let nodes: Vec<Arc<LoopbackNode>> = (0..n)
            .map(|i| Arc::new(LoopbackNode::new(format!("node-{}", i))))
            .collect();
        let endpoints: Vec<Arc<dyn NodeEndpoint>> = nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn NodeEndpoint>)
            .collect();
        (Swarm::new(endpoints), nodes)
    }

    #[test]
    fn test_placement_no_colocated_replicas() {
        let plan = placement(100, 5, 3);
        for nodes in &plan {
            assert_eq!(nodes.len(), 3);
            let distinct: BTreeSet<usize> = nodes.iter().copied().collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn test_placement_deterministic() {
        assert_eq!(placement(10, 4, 2), placement(10, 4, 2));
        assert_eq!(placement(3, 4, 2)[1], vec![1, 2]);
    }

    #[test]
    fn test_placement_rf_exceeds_nodes() {
        // Only distinct nodes are kept; distribute reports such fragments
        // as degraded.
        let plan = placement(4, 2, 3);
        for nodes in &plan {
            assert_eq!(nodes.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_distribute_replication_invariant() {
        let channel = SecureChannel::initialize(&fast_config()).unwrap();
        let (swarm, _nodes) = make_swarm(5);
        let sessions = establish_all(&channel, &swarm).await;

        let state = State::new(vec![42u8; 2000]);
        let fragments = StateEncoder::encode(&state, 100);
        assert_eq!(fragments.len(), 20);

        let distributor = SwarmDistributor::new(fast_config());
        let record = distributor
            .distribute(&channel, &fragments, &swarm, &sessions, 3)
            .await
            .unwrap();

        assert!(!record.is_degraded());
        // Every fragment held by exactly rf distinct nodes.
        let mut counts = vec![0usize; fragments.len()];
        for indices in record.assignments.values() {
            for &idx in indices {
                counts[idx] += 1;
            }
        }
        assert!(counts.iter().all(|&c| c == 3));
        assert!(distributor.verify_distribution_integrity(&record));
    }

    #[tokio::test]
    async fn test_distribute_reroutes_silent_node() {
        // 100 fragments, 5 nodes, rf=3, node 2 never acknowledges: its
        // placements must be re-routed and the record must not be degraded.
        let config = CoreConfig {
            ack_timeout_ms: 10,
            ..CoreConfig::default()
        };
        let channel = SecureChannel::initialize(&config).unwrap();
        let (swarm, nodes) = make_swarm(5);
        let sessions = establish_all(&channel, &swarm).await;
        nodes[2].set_silent(true);

        let state = State::new(vec![7u8; 1000]);
        let fragments = StateEncoder::encode(&state, 10);
        assert_eq!(fragments.len(), 100);

        let distributor = SwarmDistributor::new(config);
        let record = distributor
            .distribute(&channel, &fragments, &swarm, &sessions, 3)
            .await
            .unwrap();

        assert_eq!(record.degraded, Vec::<usize>::new());
        assert!(!record.assignments.contains_key("node-2"));
        let mut counts = vec![0usize; fragments.len()];
        for indices in record.assignments.values() {
            for &idx in indices {
                counts[idx] += 1;
            }
        }
        assert!(counts.iter().all(|&c| c == 3));
    }

    #[tokio::test]
    async fn test_rf_exceeding_swarm_marked_degraded() {
        // 2 healthy nodes cannot satisfy rf=3; every fragment is degraded
        // even though every available node holds a copy.
        let channel = SecureChannel::initialize(&fast_config()).unwrap();
        let (swarm, _nodes) = make_swarm(2);
        let sessions = establish_all(&channel, &swarm).await;

        let state = State::new(vec![6u8; 40]);
        let fragments = StateEncoder::encode(&state, 10);
        assert_eq!(fragments.len(), 4);

        let distributor = SwarmDistributor::new(fast_config());
        let record = distributor
            .distribute(&channel, &fragments, &swarm, &sessions, 3)
            .await
            .unwrap();

        assert_eq!(record.degraded, vec![0, 1, 2, 3]);
        let mut counts = vec![0usize; fragments.len()];
        for indices in record.assignments.values() {
            for &idx in indices {
                counts[idx] += 1;
            }
        }
        assert!(counts.iter().all(|&c| c == 2));
    }

    #[tokio::test]
    async fn test_distribute_empty_swarm_errors() {
        let channel = SecureChannel::initialize(&fast_config()).unwrap();
        let swarm = Swarm::new(Vec::new());
        let state = State::new(vec![1u8; 20]);
        let fragments = StateEncoder::encode(&state, 10);

        let distributor = SwarmDistributor::new(fast_config());
        let err = distributor
            .distribute(&channel, &fragments, &swarm, &SessionMap::new(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NoEligibleNode(_)));
    }

    #[tokio::test]
    async fn test_forged_acks_rerouted_away() {
        // Node 1 signs acks with a key the initiator never saw; its
        // placements are treated as failed and re-routed.
        let channel = SecureChannel::initialize(&fast_config()).unwrap();
        let (swarm, nodes) = make_swarm(4);
        let sessions = establish_all(&channel, &swarm).await;
        nodes[1].set_forge_ack_signatures(true);

        let state = State::new(vec![8u8; 400]);
        let fragments = StateEncoder::encode(&state, 50);

        let distributor = SwarmDistributor::new(fast_config());
        let record = distributor
            .distribute(&channel, &fragments, &swarm, &sessions, 2)
            .await
            .unwrap();

        assert!(!record.is_degraded());
        assert!(!record.assignments.contains_key("node-1"));
        assert!(distributor.verify_distribution_integrity(&record));
    }

    #[tokio::test]
    async fn test_degraded_when_ring_exhausted() {
        // 2 nodes, rf=2, one silent: the invariant cannot be met.
        let config = CoreConfig {
            ack_timeout_ms: 10,
            ..CoreConfig::default()
        };
        let channel = SecureChannel::initialize(&config).unwrap();
        let (swarm, nodes) = make_swarm(2);
        let sessions = establish_all(&channel, &swarm).await;
        nodes[1].set_silent(true);

        let state = State::new(vec![1u8; 40]);
        let fragments = StateEncoder::encode(&state, 10);

        let distributor = SwarmDistributor::new(config);
        let record = distributor
            .distribute(&channel, &fragments, &swarm, &sessions, 2)
            .await
            .unwrap();

        assert!(record.is_degraded());
        assert_eq!(record.degraded.len(), fragments.len());
    }

    #[tokio::test]
    async fn test_tampered_ack_fails_integrity() {
        let channel = SecureChannel::initialize(&fast_config()).unwrap();
        let (swarm, nodes) = make_swarm(3);
        let sessions = establish_all(&channel, &swarm).await;
        nodes[1].set_corrupt_acks(true);

        let state = State::new(vec![9u8; 300]);
        let fragments = StateEncoder::encode(&state, 100);

        let distributor = SwarmDistributor::new(fast_config());
        let record = distributor
            .distribute(&channel, &fragments, &swarm, &sessions, 2)
            .await
            .unwrap();

        assert!(!record.checksum_failures.is_empty());
        assert!(!distributor.verify_distribution_integrity(&record));
    }

    #[tokio::test]
    async fn test_record_serde_roundtrip() {
        let channel = SecureChannel::initialize(&fast_config()).unwrap();
        let (swarm, _nodes) = make_swarm(3);
        let sessions = establish_all(&channel, &swarm).await;
        let state = State::new(vec![3u8; 128]);
        let fragments = StateEncoder::encode(&state, 64);

        let distributor = SwarmDistributor::new(fast_config());
        let record = distributor
            .distribute(&channel, &fragments, &swarm, &sessions, 2)
            .await
            .unwrap();

        let json = serde_json::to_string(&record).unwrap();
        let back: DistributionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.integrity_hash, record.integrity_hash);
        assert!(distributor.verify_distribution_integrity(&back));
    }
}
