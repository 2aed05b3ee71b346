//! Swarm nodes — the destination endpoint contract and an in-process node
//!
//! A swarm is the set of nodes eligible to hold fragment replicas. Nodes are
//! external collaborators reached through the `NodeEndpoint` trait; the core
//! never holds direct object back-references between participants, only an
//! identifier-keyed lookup.
//!
//! `LoopbackNode` is an always-available in-process endpoint (the software
//! analogue of real remote workers) used by the CLI demo and tests. Its
//! fault toggles model unreachable and misbehaving nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::channel::{signed_message, HandshakePeer, HandshakeReply};
use crate::error::MeshError;
use crate::state::{checksum_bytes, Fragment};

/// Acknowledgement returned by a node after receiving a fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentAck {
    pub node_id: String,
    pub state_id: String,
    pub index: usize,
    /// The node's own recomputation over the received bytes
    pub recomputed_checksum: String,
    /// Node's send sequence for this ack, strictly increasing per session
    pub sequence: u64,
    /// Node signature over the checksum and sequence
    pub signature: Vec<u8>,
    /// False when the signature or sequence check failed node-side
    pub accepted: bool,
    pub reason: Option<String>,
}

/// The full endpoint contract a swarm node must satisfy
#[async_trait::async_trait]
pub trait NodeEndpoint: HandshakePeer {
    /// Accept a signed fragment and answer with a checksummed acknowledgement
    async fn store_fragment(
        &self,
        fragment: &Fragment,
        signature: &[u8],
        sequence: u64,
    ) -> Result<FragmentAck, MeshError>;
}

/// The set of destination nodes for one distribution, in ring order
#[derive(Clone)]
pub struct Swarm {
    pub swarm_id: String,
    endpoints: Vec<Arc<dyn NodeEndpoint>>,
}

impl Swarm {
    pub fn new(endpoints: Vec<Arc<dyn NodeEndpoint>>) -> Self {
        Self {
            swarm_id: uuid::Uuid::new_v4().to_string(),
            endpoints,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Node identifiers in ring order
    pub fn node_ids(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.node_id()).collect()
    }

    /// Endpoints in ring order
    pub fn endpoints(&self) -> &[Arc<dyn NodeEndpoint>] {
        &self.endpoints
    }

    /// Lookup by node identifier
    pub fn endpoint(&self, node_id: &str) -> Option<&Arc<dyn NodeEndpoint>> {
        self.endpoints.iter().find(|e| e.node_id() == node_id)
    }
}

struct LoopbackInner {
    /// Verifying key of the current handshake peer
    peer_public: Option<VerifyingKey>,
    /// Highest accepted sequence from the current peer
    last_sequence: u64,
    /// Last sequence this node issued on its own acks
    ack_sequence: u64,
    /// Received fragments keyed by (state_id, index)
    fragments: HashMap<(String, usize), Vec<u8>>,
}

/// In-process swarm node with fault-injection toggles
pub struct LoopbackNode {
    pub node_id: String,
    signing: SigningKey,
    inner: Mutex<LoopbackInner>,
    /// Never answer fragment sends (caller sees an ack timeout)
    silent: AtomicBool,
    /// Acknowledge with a wrong checksum
    corrupt_acks: AtomicBool,
    /// Sign acks with a key the initiator never saw
    forge_ack_signatures: AtomicBool,
    /// Refuse all handshakes
    reject_handshakes: AtomicBool,
}

impl LoopbackNode {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            signing: SigningKey::generate(&mut OsRng),
            inner: Mutex::new(LoopbackInner {
                peer_public: None,
                last_sequence: 0,
                ack_sequence: 0,
                fragments: HashMap::new(),
            }),
            silent: AtomicBool::new(false),
            corrupt_acks: AtomicBool::new(false),
            forge_ack_signatures: AtomicBool::new(false),
            reject_handshakes: AtomicBool::new(false),
        }
    }

    /// Stop answering fragment sends
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Answer fragment sends with a corrupted checksum
    pub fn set_corrupt_acks(&self, corrupt: bool) {
        self.corrupt_acks.store(corrupt, Ordering::SeqCst);
    }

    /// Sign acks with a throwaway key instead of the node key
    pub fn set_forge_ack_signatures(&self, forge: bool) {
        self.forge_ack_signatures.store(forge, Ordering::SeqCst);
    }

    /// Handshake peer's public key, as last recorded
    pub fn peer_public_key(&self) -> Option<[u8; 32]> {
        self.inner.lock().unwrap().peer_public.map(|k| k.to_bytes())
    }

    /// Refuse handshakes
    pub fn set_reject_handshakes(&self, reject: bool) {
        self.reject_handshakes.store(reject, Ordering::SeqCst);
    }

    /// Number of fragments currently held
    pub fn fragment_count(&self) -> usize {
        self.inner.lock().unwrap().fragments.len()
    }

    /// Bytes held for one fragment, if present
    pub fn fragment_data(&self, state_id: &str, index: usize) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .fragments
            .get(&(state_id.to_string(), index))
            .cloned()
    }
}

#[async_trait::async_trait]
impl HandshakePeer for LoopbackNode {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn handshake(&self, public_key: &[u8], nonce: &[u8]) -> Result<HandshakeReply, MeshError> {
        if self.reject_handshakes.load(Ordering::SeqCst) {
            return Ok(HandshakeReply {
                node_id: self.node_id.clone(),
                public_key: Vec::new(),
                accepted: false,
                reason: Some("node is not accepting connections".to_string()),
            });
        }

        let peer_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
            MeshError::HandshakeRejected {
                node: self.node_id.clone(),
                reason: "malformed initiator key".to_string(),
            }
        })?;
        let peer_public = VerifyingKey::from_bytes(&peer_bytes).map_err(|e| {
            MeshError::HandshakeRejected {
                node: self.node_id.clone(),
                reason: e.to_string(),
            }
        })?;

        // A fresh handshake resets the replay watermarks in both directions.
        let mut inner = self.inner.lock().unwrap();
        inner.peer_public = Some(peer_public);
        inner.last_sequence = 0;
        inner.ack_sequence = 0;

        // The derived key on the node side would use the same sorted-key
        // construction; the loopback node only needs the peer identity.
        let _ = nonce;

        Ok(HandshakeReply {
            node_id: self.node_id.clone(),
            public_key: self.signing.verifying_key().to_bytes().to_vec(),
            accepted: true,
            reason: None,
        })
    }
}

#[async_trait::async_trait]
impl NodeEndpoint for LoopbackNode {
    async fn store_fragment(
        &self,
        fragment: &Fragment,
        signature: &[u8],
        sequence: u64,
    ) -> Result<FragmentAck, MeshError> {
        if self.silent.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let mut inner = self.inner.lock().unwrap();

        let Some(peer_public) = inner.peer_public else {
            return Ok(self.nack(fragment, "no handshake"));
        };
        if sequence <= inner.last_sequence {
            return Ok(self.nack(fragment, "replayed or out-of-order sequence"));
        }
        let Ok(sig) = Signature::from_slice(signature) else {
            return Ok(self.nack(fragment, "malformed signature"));
        };
        if peer_public
            .verify(&signed_message(&fragment.data, sequence), &sig)
            .is_err()
        {
            return Ok(self.nack(fragment, "signature verification failed"));
        }

        inner.last_sequence = sequence;
        inner.fragments.insert(
            (fragment.state_id.clone(), fragment.index),
            fragment.data.clone(),
        );

        let mut recomputed = checksum_bytes(&fragment.data);
        if self.corrupt_acks.load(Ordering::SeqCst) {
            recomputed = checksum_bytes(b"corrupted");
        }

        // Acks carry their own strictly increasing sequence and are signed
        // over (checksum, sequence) so the initiator can authenticate them.
        inner.ack_sequence += 1;
        let ack_sequence = inner.ack_sequence;
        let message = signed_message(recomputed.as_bytes(), ack_sequence);
        let ack_signature = if self.forge_ack_signatures.load(Ordering::SeqCst) {
            SigningKey::generate(&mut OsRng).sign(&message)
        } else {
            self.signing.sign(&message)
        };

        Ok(FragmentAck {
            node_id: self.node_id.clone(),
            state_id: fragment.state_id.clone(),
            index: fragment.index,
            recomputed_checksum: recomputed,
            sequence: ack_sequence,
            signature: ack_signature.to_bytes().to_vec(),
            accepted: true,
            reason: None,
        })
    }
}

impl LoopbackNode {
    fn nack(&self, fragment: &Fragment, reason: &str) -> FragmentAck {
        log::warn!(
            "Node {} rejected fragment {} of state {}: {}",
            self.node_id,
            fragment.index,
            fragment.state_id,
            reason
        );
        FragmentAck {
            node_id: self.node_id.clone(),
            state_id: fragment.state_id.clone(),
            index: fragment.index,
            recomputed_checksum: String::new(),
            sequence: 0,
            signature: Vec::new(),
            accepted: false,
            reason: Some(reason.to_string()),
        }
    }
}
