//! TransferProtocol — end-to-end orchestration of a state transfer
//!
//! Drives encode → channel establishment → distribution → verification and
//! hands the result to persistence. The protocol holds one process-lifetime
//! channel (the local keypair survives across transfers), but every
//! `transfer()` is otherwise independent: fresh sessions per call, and a
//! `Failed` outcome leaves no persisted side effects, so callers can retry
//! immediately.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::channel::SecureChannel;
use crate::config::CoreConfig;
use crate::error::MeshError;
use crate::persist::PersistenceManager;
use crate::state::{State, StateEncoder};
use crate::swarm::{DistributionRecord, SessionMap, Swarm, SwarmDistributor};

/// Phases of one transfer, strictly sequential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    Idle,
    Preparing,
    ChannelEstablishing,
    Distributing,
    Verifying,
    Completed,
    Failed,
}

/// Per-call overrides on top of the protocol's configuration
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub fragment_size: Option<usize>,
    pub replication_factor: Option<usize>,
    /// Skip the persistence hand-off even when a manager is attached
    pub skip_persistence: bool,
}

/// Result of a completed transfer
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub transfer_id: String,
    pub state_id: String,
    pub integrity_hash: String,
    pub record: DistributionRecord,
}

/// Caller-held handle that cancels an in-flight transfer
pub struct CancelToken {
    tx: watch::Sender<bool>,
}

/// Protocol-held side of a cancellation pair
#[derive(Clone)]
pub struct CancelWatch {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> (CancelToken, CancelWatch) {
        let (tx, rx) = watch::channel(false);
        (CancelToken { tx }, CancelWatch { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelWatch {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Token dropped without cancelling: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Orchestrates encode → channels → distribute → verify → persist
pub struct TransferProtocol {
    config: CoreConfig,
    /// Process-lifetime channel; the local keypair outlives any transfer
    channel: SecureChannel,
    persistence: Option<Arc<PersistenceManager>>,
}

impl TransferProtocol {
    pub fn new(config: CoreConfig) -> Result<Self, MeshError> {
        let channel = SecureChannel::initialize(&config)?;
        Ok(Self {
            config,
            channel,
            persistence: None,
        })
    }

    /// Attach a persistence manager invoked after successful distribution
    pub fn with_persistence(
        config: CoreConfig,
        persistence: Arc<PersistenceManager>,
    ) -> Result<Self, MeshError> {
        let channel = SecureChannel::initialize(&config)?;
        Ok(Self {
            config,
            channel,
            persistence: Some(persistence),
        })
    }

    /// The local verifying key nodes see on every handshake
    pub fn public_key(&self) -> ed25519_dalek::VerifyingKey {
        self.channel.public_key()
    }

    /// Run a full transfer to the destination swarm
    pub async fn transfer(
        &self,
        state: &State,
        swarm: &Swarm,
        options: &TransferOptions,
    ) -> Result<TransferResult, MeshError> {
        let (_token, watch) = CancelToken::new();
        self.transfer_with_cancel(state, swarm, options, watch).await
    }

    /// Run a transfer that the caller may cancel mid-flight.
    ///
    /// Cancellation closes any open sessions and never leaves a partially
    /// written persisted entry.
    pub async fn transfer_with_cancel(
        &self,
        state: &State,
        swarm: &Swarm,
        options: &TransferOptions,
        cancel: CancelWatch,
    ) -> Result<TransferResult, MeshError> {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let mut phase = TransferPhase::Idle;

        let outcome = self
            .run_phases(state, swarm, options, &cancel, &transfer_id, &mut phase)
            .await;

        match &outcome {
            Ok(_) => self.set_phase(&transfer_id, &mut phase, TransferPhase::Completed),
            Err(e) => {
                warn!("Transfer {} failed during {:?}: {}", transfer_id, phase, e);
                self.set_phase(&transfer_id, &mut phase, TransferPhase::Failed);
            }
        }
        outcome
    }

    async fn run_phases(
        &self,
        state: &State,
        swarm: &Swarm,
        options: &TransferOptions,
        cancel: &CancelWatch,
        transfer_id: &str,
        phase: &mut TransferPhase,
    ) -> Result<TransferResult, MeshError> {
        if swarm.is_empty() {
            return Err(MeshError::SessionNotEstablished(
                "destination swarm is empty".to_string(),
            ));
        }

        // Preparing: fragment the payload.
        self.set_phase(transfer_id, phase, TransferPhase::Preparing);
        if !state.verify_checksum() {
            return Err(MeshError::IntegrityViolation(state.state_id.clone()));
        }
        let fragment_size = options.fragment_size.unwrap_or(self.config.fragment_size);
        let fragments = StateEncoder::encode(state, fragment_size);
        self.check_cancel(cancel, None).await?;

        // ChannelEstablishing: one fresh session per destination node,
        // parallel under the concurrency bound. Sessions are never shared
        // across transfers, so a new handshake is performed per transfer.
        self.set_phase(transfer_id, phase, TransferPhase::ChannelEstablishing);
        let channel = &self.channel;
        let concurrency = self.config.concurrency_for(swarm.len());
        let session_results: Vec<_> = self
            .with_cancel(cancel, async {
                stream::iter(swarm.endpoints().iter().cloned())
                    .map(|endpoint| async move {
                        let node_id = endpoint.node_id();
                        let result = channel.establish_secure_connection(endpoint.as_ref()).await;
                        (node_id, result)
                    })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await
            })
            .await?;

        let mut sessions = SessionMap::new();
        let mut last_error = None;
        for (node_id, result) in session_results {
            match result {
                Ok(session) => {
                    sessions.insert(node_id, Arc::new(tokio::sync::Mutex::new(session)));
                }
                Err(e) => {
                    warn!("Channel to node {} failed: {}", node_id, e);
                    last_error = Some(e);
                }
            }
        }
        if sessions.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                MeshError::SessionNotEstablished("no destination reachable".to_string())
            }));
        }
        self.check_cancel(cancel, Some(&sessions)).await?;

        // Distributing: fan out under the replication policy.
        self.set_phase(transfer_id, phase, TransferPhase::Distributing);
        let replication_factor = options
            .replication_factor
            .unwrap_or(self.config.replication_factor);
        let distributor = SwarmDistributor::new(self.config.clone());
        let record = self
            .with_cancel(
                cancel,
                distributor.distribute(channel, &fragments, swarm, &sessions, replication_factor),
            )
            .await
            .and_then(|r| r);
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                close_sessions(&sessions).await;
                return Err(e);
            }
        };

        // Verifying: aggregate integrity must check out and no node may have
        // reported a divergent checksum.
        self.set_phase(transfer_id, phase, TransferPhase::Verifying);
        let verdict = distributor.verify_distribution_integrity(&record);
        close_sessions(&sessions).await;
        if !verdict {
            return Err(MeshError::IntegrityViolation(state.state_id.clone()));
        }
        if !record.checksum_failures.is_empty() {
            return Err(MeshError::FragmentChecksumMismatch(format!(
                "{} placements reported divergent checksums",
                record.checksum_failures.len()
            )));
        }

        // Durable hand-off. Runs only after a fully verified distribution,
        // so a failed transfer leaves nothing persisted.
        if !options.skip_persistence {
            if let Some(persistence) = &self.persistence {
                persistence.persist(state, Some(&record))?;
            }
        }

        info!(
            "Transfer {} completed: {}",
            transfer_id,
            record.summary()
        );
        Ok(TransferResult {
            transfer_id: transfer_id.to_string(),
            state_id: state.state_id.clone(),
            integrity_hash: record.integrity_hash.clone(),
            record,
        })
    }

    fn set_phase(&self, transfer_id: &str, phase: &mut TransferPhase, next: TransferPhase) {
        info!("Transfer {}: {:?} -> {:?}", &transfer_id[..8], phase, next);
        *phase = next;
    }

    async fn check_cancel(
        &self,
        cancel: &CancelWatch,
        sessions: Option<&SessionMap>,
    ) -> Result<(), MeshError> {
        if cancel.is_cancelled() {
            if let Some(sessions) = sessions {
                close_sessions(sessions).await;
            }
            return Err(MeshError::Cancelled);
        }
        Ok(())
    }

    /// Race a phase future against cancellation
    async fn with_cancel<T>(
        &self,
        cancel: &CancelWatch,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, MeshError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            value = fut => Ok(value),
        }
    }
}

/// Zero the key material of every open session
async fn close_sessions(sessions: &SessionMap) {
    for session in sessions.values() {
        session.lock().await.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::{LoopbackNode, NodeEndpoint};

    fn fast_config() -> CoreConfig {
        CoreConfig {
            fragment_size: 64,
            replication_factor: 2,
            ack_timeout_ms: 50,
            handshake_timeout_ms: 200,
            ..CoreConfig::default()
        }
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

    #[tokio::test]
    async fn test_end_to_end_transfer() {
        let (swarm, nodes) = make_swarm(4);
        let protocol = TransferProtocol::new(fast_config()).unwrap();
        let state = State::new(vec![11u8; 1000]);

        let result = protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .unwrap();

        assert_eq!(result.state_id, state.state_id);
        assert!(!result.record.is_degraded());
        // 1000 bytes at fragment_size 64 -> 16 fragments, rf 2 -> 32 copies.
        assert_eq!(result.record.total_fragments, 16);
        let held: usize = nodes.iter().map(|n| n.fragment_count()).sum();
        assert_eq!(held, 32);
    }

    #[tokio::test]
    async fn test_transfer_persists_on_success() {
        let (swarm, _nodes) = make_swarm(3);
        let persistence = Arc::new(PersistenceManager::in_memory(None));
        let protocol = TransferProtocol::with_persistence(fast_config(), persistence.clone()).unwrap();
        let state = State::new(vec![4u8; 500]);

        protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .unwrap();

        let loaded = persistence.load(&state.state_id, true).unwrap();
        assert_eq!(loaded.payload, state.payload);
        assert!(persistence.get_record(&state.state_id).is_some());
    }

    #[tokio::test]
    async fn test_failed_transfer_leaves_nothing_persisted() {
        let (swarm, nodes) = make_swarm(3);
        for node in &nodes {
            node.set_reject_handshakes(true);
        }
        let persistence = Arc::new(PersistenceManager::in_memory(None));
        let protocol = TransferProtocol::with_persistence(fast_config(), persistence.clone()).unwrap();
        let state = State::new(vec![4u8; 500]);

        let err = protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::HandshakeRejected { .. }));
        assert!(persistence.get_entry(&state.state_id).is_none());
    }

    #[tokio::test]
    async fn test_checksum_failure_fails_transfer() {
        let (swarm, nodes) = make_swarm(3);
        nodes[0].set_corrupt_acks(true);
        let persistence = Arc::new(PersistenceManager::in_memory(None));
        let protocol = TransferProtocol::with_persistence(fast_config(), persistence.clone()).unwrap();
        let state = State::new(vec![4u8; 200]);

        let err = protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::IntegrityViolation(_) | MeshError::FragmentChecksumMismatch(_)
        ));
        assert!(persistence.get_entry(&state.state_id).is_none());
    }

    #[tokio::test]
    async fn test_retry_after_failure_is_independent() {
        let (swarm, nodes) = make_swarm(3);
        for node in &nodes {
            node.set_reject_handshakes(true);
        }
        let protocol = TransferProtocol::new(fast_config()).unwrap();
        let state = State::new(vec![2u8; 300]);

        assert!(protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .is_err());

        // The protocol is stateless across calls: clearing the fault and
        // retrying the same state succeeds.
        for node in &nodes {
            node.set_reject_handshakes(false);
        }
        let result = protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .unwrap();
        assert!(!result.record.is_degraded());
    }

    #[tokio::test]
    async fn test_keypair_stable_across_transfers() {
        // One keypair for the protocol's lifetime: nodes see the same
        // initiator key on every handshake.
        let (swarm, nodes) = make_swarm(2);
        let protocol = TransferProtocol::new(fast_config()).unwrap();
        let state = State::new(vec![3u8; 200]);

        protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .unwrap();
        let first_seen = nodes[0].peer_public_key().unwrap();
        assert_eq!(first_seen, protocol.public_key().to_bytes());

        protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(nodes[0].peer_public_key().unwrap(), first_seen);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (swarm, _nodes) = make_swarm(2);
        let protocol = TransferProtocol::new(fast_config()).unwrap();
        let state = State::new(vec![2u8; 100]);

        let (token, watch) = CancelToken::new();
        token.cancel();
        let err = protocol
            .transfer_with_cancel(&state, &swarm, &TransferOptions::default(), watch)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_mid_distribution() {
        let config = CoreConfig {
            fragment_size: 16,
            ack_timeout_ms: 5_000,
            ..fast_config()
        };
        let (swarm, nodes) = make_swarm(2);
        nodes[0].set_silent(true);
        nodes[1].set_silent(true);
        let persistence = Arc::new(PersistenceManager::in_memory(None));
        let protocol = TransferProtocol::with_persistence(config, persistence.clone()).unwrap();
        let state = State::new(vec![1u8; 512]);

        let (token, watch) = CancelToken::new();
        let cancel_after = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = protocol
            .transfer_with_cancel(&state, &swarm, &TransferOptions::default(), watch)
            .await
            .unwrap_err();
        cancel_after.await.unwrap();
        assert!(matches!(err, MeshError::Cancelled));
        assert!(persistence.get_entry(&state.state_id).is_none());
    }

    #[tokio::test]
    async fn test_empty_swarm_rejected() {
        let swarm = Swarm::new(Vec::new());
        let protocol = TransferProtocol::new(fast_config()).unwrap();
        let state = State::new(vec![1u8; 10]);
        assert!(protocol
            .transfer(&state, &swarm, &TransferOptions::default())
            .await
            .is_err());
    }
}
