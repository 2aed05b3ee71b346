//! State — the opaque payload under transfer and storage management
//!
//! A State is bytes plus declared shape metadata. The payload format is
//! opaque to the core; the only enforced property is the SHA256 checksum,
//! which is recomputed on every read and must match the recorded value.

pub mod encoder;

pub use encoder::{Fragment, StateEncoder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Declared semantic shape of a state payload (advisory metadata)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateShape {
    /// Dimension counts of the source structure
    pub dims: Vec<usize>,
    /// Element type label (e.g. "f32", "u8", "json")
    pub element_type: String,
    /// Declared payload size in bytes
    pub size_bytes: u64,
}

impl StateShape {
    /// Shape for a flat byte blob
    pub fn opaque(size_bytes: u64) -> Self {
        Self {
            dims: vec![size_bytes as usize],
            element_type: "u8".to_string(),
            size_bytes,
        }
    }
}

/// An opaque, checksummed state blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Stable identifier (caller-supplied or generated)
    pub state_id: String,
    /// The raw payload
    pub payload: Vec<u8>,
    /// Declared shape metadata
    pub shape: StateShape,
    /// SHA256 of the payload, hex-encoded
    pub checksum: String,
    /// Caller-reported quality scalar in [0,1]; advisory only, never validated
    pub fidelity: f64,
    /// Schema version of the payload, used by translation
    pub format_version: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// SHA256 checksum of a byte slice, hex-encoded
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl State {
    /// Create a state with a generated ID and opaque shape
    pub fn new(payload: Vec<u8>) -> Self {
        let shape = StateShape::opaque(payload.len() as u64);
        Self::with_shape(uuid::Uuid::new_v4().to_string(), payload, shape)
    }

    /// Create a state with an explicit ID and shape
    pub fn with_shape(state_id: impl Into<String>, payload: Vec<u8>, shape: StateShape) -> Self {
        let checksum = checksum_bytes(&payload);
        Self {
            state_id: state_id.into(),
            payload,
            shape,
            checksum,
            fidelity: 1.0,
            format_version: 1,
            created_at: Utc::now(),
        }
    }

    /// Payload size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Recompute the payload checksum and compare against the recorded value
    pub fn verify_checksum(&self) -> bool {
        checksum_bytes(&self.payload) == self.checksum
    }

    /// One-line description
    pub fn summary(&self) -> String {
        format!(
            "State {} | {} bytes | v{} | fidelity={:.3} | checksum={}...",
            &self.state_id[..8.min(self.state_id.len())],
            self.payload.len(),
            self.format_version,
            self.fidelity,
            &self.checksum[..16],
        )
    }
}
