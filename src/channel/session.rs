//! SecureSession — per-transfer, per-node authenticated channel context
//!
//! Holds the derived symmetric session key, the peer's verifying key, and the
//! anti-replay sequence counters. A session is exclusively owned by the
//! channel that created it and is never shared across concurrent transfers.
//! The key is zeroed on close and on drop.

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::VerifyingKey;
use zeroize::Zeroize;

/// An established, authenticated session to one destination node
#[derive(Debug)]
pub struct SecureSession {
    /// Session identifier
    pub session_id: String,
    /// The node this session is bound to
    pub node_id: String,
    /// Symmetric key derived from the handshake
    session_key: Vec<u8>,
    /// Peer's verifying key, from the handshake reply
    peer_public: VerifyingKey,
    /// Last sequence number we issued (strictly increasing, starts at 0)
    pub send_sequence: u64,
    /// Highest sequence number accepted from the peer (0 = none yet)
    pub last_accepted: u64,
    /// When the session was established
    pub established_at: DateTime<Utc>,
    /// After this instant the session refuses signing
    pub expires_at: DateTime<Utc>,
    closed: bool,
}

impl SecureSession {
    pub(crate) fn new(
        node_id: impl Into<String>,
        session_key: Vec<u8>,
        peer_public: VerifyingKey,
        ttl_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            session_key,
            peer_public,
            send_sequence: 0,
            last_accepted: 0,
            established_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            closed: false,
        }
    }

    /// The derived session key, if the session is still open
    pub fn session_key(&self) -> Option<&[u8]> {
        if self.closed {
            None
        } else {
            Some(&self.session_key)
        }
    }

    /// Peer verifying key
    pub fn peer_public(&self) -> &VerifyingKey {
        &self.peer_public
    }

    /// Whether the session lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the session can still sign and verify
    pub fn is_usable(&self) -> bool {
        !self.closed && !self.is_expired()
    }

    /// Issue the next send sequence number (strictly increasing)
    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.send_sequence += 1;
        self.send_sequence
    }

    /// Zero the key material and mark the session closed
    pub fn close(&mut self) {
        self.session_key.zeroize();
        self.session_key.clear();
        self.closed = true;
        log::debug!(
            "Session {} to node {} closed",
            &self.session_id[..8],
            self.node_id
        );
    }
}

impl Drop for SecureSession {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}
