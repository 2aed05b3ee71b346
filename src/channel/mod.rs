//! SecureChannel — authenticated, confidential channel establishment
//!
//! Handshake flow against a destination node:
//! 1. Public-key + nonce exchange via the peer's handshake primitive
//! 2. Symmetric session key derived from both public keys (SHA256 HKDF-style)
//! 3. Signed message exchange with strictly increasing sequence numbers
//!
//! Signing is ordinary ed25519; "quantum" security in the source domain is
//! modeled as standard asymmetric signing plus a seedable entropy pool.

pub mod session;

pub use session::SecureSession;

use std::sync::Mutex;
use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CoreConfig;
use crate::error::MeshError;

/// Reply from a node's handshake primitive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Responding node
    pub node_id: String,
    /// Node's ed25519 verifying key bytes
    pub public_key: Vec<u8>,
    /// Whether the node accepted our credential
    pub accepted: bool,
    /// Rejection reason, when not accepted
    pub reason: Option<String>,
}

/// The handshake primitive every destination must expose
#[async_trait::async_trait]
pub trait HandshakePeer: Send + Sync {
    /// Node identifier this peer answers for
    fn node_id(&self) -> String;

    /// Accept `(public_key, nonce)` and answer with the node credential
    async fn handshake(&self, public_key: &[u8], nonce: &[u8]) -> Result<HandshakeReply, MeshError>;
}

/// Pool of CSPRNG bytes used for nonce and key generation
struct EntropyPool {
    buffer: Mutex<Vec<u8>>,
}

const ENTROPY_REFILL: usize = 1024;

impl EntropyPool {
    /// Seed the pool; fails if the OS random source cannot produce bytes
    fn seed() -> Result<Self, MeshError> {
        let mut buffer = vec![0u8; ENTROPY_REFILL];
        OsRng
            .try_fill_bytes(&mut buffer)
            .map_err(|e| MeshError::EntropyUnavailable(e.to_string()))?;
        Ok(Self {
            buffer: Mutex::new(buffer),
        })
    }

    /// Take `n` bytes, refilling from the OS source when drained
    fn take(&self, n: usize) -> Result<Vec<u8>, MeshError> {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if buffer.len() < n {
            let mut refill = vec![0u8; ENTROPY_REFILL.max(n)];
            OsRng
                .try_fill_bytes(&mut refill)
                .map_err(|e| MeshError::EntropyUnavailable(e.to_string()))?;
            buffer.extend_from_slice(&refill);
        }
        let at = buffer.len() - n;
        Ok(buffer.split_off(at))
    }
}

/// Channel establishment and payload signing/verification
pub struct SecureChannel {
    signing_key: SigningKey,
    entropy: EntropyPool,
    handshake_timeout: Duration,
    session_ttl_secs: u64,
}

impl SecureChannel {
    /// Generate the local keypair and seed the entropy pool
    pub fn initialize(config: &CoreConfig) -> Result<Self, MeshError> {
        let entropy = EntropyPool::seed()?;
        let key_bytes: [u8; 32] = entropy
            .take(32)?
            .try_into()
            .map_err(|_| MeshError::EntropyUnavailable("short read".to_string()))?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        log::info!(
            "Secure channel initialized, public key {}...",
            &hex::encode(signing_key.verifying_key().as_bytes())[..16]
        );
        Ok(Self {
            signing_key,
            entropy,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            session_ttl_secs: config.session_ttl_secs,
        })
    }

    /// Local verifying key
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// A fresh asymmetric keypair; pure beyond entropy consumption
    pub fn generate_keypair(&self) -> Result<(SigningKey, VerifyingKey), MeshError> {
        let key_bytes: [u8; 32] = self
            .entropy
            .take(32)?
            .try_into()
            .map_err(|_| MeshError::EntropyUnavailable("short read".to_string()))?;
        let signing = SigningKey::from_bytes(&key_bytes);
        let verifying = signing.verifying_key();
        Ok((signing, verifying))
    }

    /// Handshake against a destination and derive a session
    pub async fn establish_secure_connection(
        &self,
        peer: &dyn HandshakePeer,
    ) -> Result<SecureSession, MeshError> {
        let node_id = peer.node_id();
        let nonce = self.entropy.take(32)?;
        let local_public = self.public_key().to_bytes();

        let reply = tokio::time::timeout(
            self.handshake_timeout,
            peer.handshake(&local_public, &nonce),
        )
        .await
        .map_err(|_| MeshError::HandshakeTimeout(node_id.clone()))??;

        if !reply.accepted {
            return Err(MeshError::HandshakeRejected {
                node: node_id,
                reason: reply
                    .reason
                    .unwrap_or_else(|| "credential rejected".to_string()),
            });
        }

        let peer_bytes: [u8; 32] =
            reply
                .public_key
                .as_slice()
                .try_into()
                .map_err(|_| MeshError::HandshakeRejected {
                    node: node_id.clone(),
                    reason: "malformed peer public key".to_string(),
                })?;
        let peer_public =
            VerifyingKey::from_bytes(&peer_bytes).map_err(|e| MeshError::HandshakeRejected {
                node: node_id.clone(),
                reason: format!("invalid peer credential: {}", e),
            })?;

        let session_key = derive_session_key(&local_public, &peer_bytes, &nonce);
        let session = SecureSession::new(&node_id, session_key, peer_public, self.session_ttl_secs);
        log::info!(
            "Session {} established to node {}",
            &session.session_id[..8],
            node_id
        );
        Ok(session)
    }

    /// Sign a payload under a session, issuing the next sequence number
    pub fn sign_payload(
        &self,
        session: &mut SecureSession,
        bytes: &[u8],
    ) -> Result<(Vec<u8>, u64), MeshError> {
        if session.is_expired() {
            return Err(MeshError::SessionExpired(session.node_id.clone()));
        }
        if session.session_key().is_none() {
            return Err(MeshError::SessionNotEstablished(session.node_id.clone()));
        }
        let sequence = session.next_sequence();
        let signature = self.signing_key.sign(&signed_message(bytes, sequence));
        Ok((signature.to_bytes().to_vec(), sequence))
    }

    /// Verify a peer signature under a session, enforcing anti-replay.
    ///
    /// Rejects any sequence number not strictly greater than the last
    /// accepted value before doing cryptographic work; advances the
    /// watermark only on a fully valid message.
    pub fn verify_signature(
        &self,
        session: &mut SecureSession,
        bytes: &[u8],
        signature: &[u8],
        sequence: u64,
    ) -> bool {
        if !session.is_usable() {
            return false;
        }
        if sequence <= session.last_accepted {
            log::warn!(
                "Replayed or out-of-order sequence {} on session {} (last accepted {})",
                sequence,
                &session.session_id[..8],
                session.last_accepted
            );
            return false;
        }
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        if session
            .peer_public()
            .verify(&signed_message(bytes, sequence), &sig)
            .is_err()
        {
            return false;
        }
        session.last_accepted = sequence;
        true
    }
}

/// Message bytes covered by a payload signature
pub fn signed_message(bytes: &[u8], sequence: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(bytes.len() + 8);
    msg.extend_from_slice(bytes);
    msg.extend_from_slice(&sequence.to_le_bytes());
    msg
}

/// HKDF-style derivation from both public keys plus the handshake nonce.
/// Public keys are sorted so both sides derive the same key.
pub fn derive_session_key(local: &[u8; 32], peer: &[u8; 32], nonce: &[u8]) -> Vec<u8> {
    let (first, second) = if local <= peer {
        (local, peer)
    } else {
        (peer, local)
    };
    let mut h = Sha256::new();
    h.update(first);
    h.update(second);
    h.update(nonce);
    h.update(b"statemesh-session-key-v1");
    h.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePeer {
        id: String,
        signing: SigningKey,
        accept: bool,
        delay: Option<Duration>,
    }

    impl FakePeer {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                signing: SigningKey::generate(&mut OsRng),
                accept: true,
                delay: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl HandshakePeer for FakePeer {
        fn node_id(&self) -> String {
            self.id.clone()
        }

        async fn handshake(
            &self,
            _public_key: &[u8],
            _nonce: &[u8],
        ) -> Result<HandshakeReply, MeshError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(HandshakeReply {
                node_id: self.id.clone(),
                public_key: self.signing.verifying_key().to_bytes().to_vec(),
                accepted: self.accept,
                reason: if self.accept {
                    None
                } else {
                    Some("untrusted credential".to_string())
                },
            })
        }
    }

    fn channel() -> SecureChannel {
        SecureChannel::initialize(&CoreConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_establish_session() {
        let ch = channel();
        let peer = FakePeer::new("node-1");
        let session = ch.establish_secure_connection(&peer).await.unwrap();
        assert_eq!(session.node_id, "node-1");
        assert!(session.is_usable());
        assert_eq!(session.session_key().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let ch = channel();
        let mut peer = FakePeer::new("node-1");
        peer.accept = false;
        let err = ch.establish_secure_connection(&peer).await.unwrap_err();
        assert!(matches!(err, MeshError::HandshakeRejected { .. }));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let config = CoreConfig {
            handshake_timeout_ms: 20,
            ..CoreConfig::default()
        };
        let ch = SecureChannel::initialize(&config).unwrap();
        let mut peer = FakePeer::new("node-slow");
        peer.delay = Some(Duration::from_millis(500));
        let err = ch.establish_secure_connection(&peer).await.unwrap_err();
        assert!(matches!(err, MeshError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn test_sign_and_verify_between_channels() {
        // Two channels, each holding a session that trusts the other's key.
        let ch_a = channel();
        let ch_b = channel();

        let key = derive_session_key(
            &ch_a.public_key().to_bytes(),
            &ch_b.public_key().to_bytes(),
            b"nonce",
        );
        let mut session_a = SecureSession::new("b", key.clone(), ch_b.public_key(), 300);
        let mut session_b = SecureSession::new("a", key, ch_a.public_key(), 300);

        let payload = b"fragment bytes";
        let (sig, seq) = ch_a.sign_payload(&mut session_a, payload).unwrap();
        assert_eq!(seq, 1);
        assert!(ch_b.verify_signature(&mut session_b, payload, &sig, seq));
    }

    #[tokio::test]
    async fn test_anti_replay() {
        let ch_a = channel();
        let ch_b = channel();
        let key = derive_session_key(
            &ch_a.public_key().to_bytes(),
            &ch_b.public_key().to_bytes(),
            b"nonce",
        );
        let mut session_a = SecureSession::new("b", key.clone(), ch_b.public_key(), 300);
        let mut session_b = SecureSession::new("a", key, ch_a.public_key(), 300);

        let payload = b"once only";
        let (sig, seq) = ch_a.sign_payload(&mut session_a, payload).unwrap();
        assert!(ch_b.verify_signature(&mut session_b, payload, &sig, seq));
        // Replay of a previously accepted message must be rejected.
        assert!(!ch_b.verify_signature(&mut session_b, payload, &sig, seq));
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let ch_a = channel();
        let ch_b = channel();
        let key = derive_session_key(
            &ch_a.public_key().to_bytes(),
            &ch_b.public_key().to_bytes(),
            b"nonce",
        );
        let mut session_a = SecureSession::new("b", key.clone(), ch_b.public_key(), 300);
        let mut session_b = SecureSession::new("a", key, ch_a.public_key(), 300);

        let (sig1, seq1) = ch_a.sign_payload(&mut session_a, b"first").unwrap();
        let (sig2, seq2) = ch_a.sign_payload(&mut session_a, b"second").unwrap();
        assert!(ch_b.verify_signature(&mut session_b, b"second", &sig2, seq2));
        // Earlier sequence arriving late is not accepted.
        assert!(!ch_b.verify_signature(&mut session_b, b"first", &sig1, seq1));
    }

    #[tokio::test]
    async fn test_tampered_payload_rejected() {
        let ch_a = channel();
        let ch_b = channel();
        let key = derive_session_key(
            &ch_a.public_key().to_bytes(),
            &ch_b.public_key().to_bytes(),
            b"nonce",
        );
        let mut session_a = SecureSession::new("b", key.clone(), ch_b.public_key(), 300);
        let mut session_b = SecureSession::new("a", key, ch_a.public_key(), 300);

        let (sig, seq) = ch_a.sign_payload(&mut session_a, b"original").unwrap();
        assert!(!ch_b.verify_signature(&mut session_b, b"tampered", &sig, seq));
    }

    #[tokio::test]
    async fn test_expired_session_refuses_signing() {
        let ch = channel();
        let peer_key = SigningKey::generate(&mut OsRng).verifying_key();
        let mut session = SecureSession::new("n", vec![0u8; 32], peer_key, 0);
        let err = ch.sign_payload(&mut session, b"late").unwrap_err();
        assert!(matches!(err, MeshError::SessionExpired(_)));
    }

    #[test]
    fn test_session_key_symmetric() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(
            derive_session_key(&a, &b, b"n"),
            derive_session_key(&b, &a, b"n")
        );
    }

    #[test]
    fn test_generate_keypair_distinct() {
        let ch = channel();
        let (_, pub1) = ch.generate_keypair().unwrap();
        let (_, pub2) = ch.generate_keypair().unwrap();
        assert_ne!(pub1.to_bytes(), pub2.to_bytes());
    }
}
