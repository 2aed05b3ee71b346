//! StateEncoder — payload ↔ ordered fragment sequence
//!
//! Splits a state payload into contiguous, independently checksummed slices
//! and reassembles them. Purely functional: no hidden state, deterministic
//! given inputs. Per-fragment checksums let a single corrupted fragment be
//! identified without rehashing the whole state.

use serde::{Deserialize, Serialize};

use super::{checksum_bytes, State};
use crate::error::MeshError;

/// A contiguous slice of a state payload with positional metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    /// Owning state
    pub state_id: String,
    /// Position in [0, total)
    pub index: usize,
    /// Total fragments in the set
    pub total: usize,
    /// Byte offset into the original payload
    pub offset: u64,
    /// Slice length in bytes
    pub length: u64,
    /// SHA256 of `data`, hex-encoded
    pub checksum: String,
    /// The slice itself
    pub data: Vec<u8>,
}

impl Fragment {
    /// Recompute the data checksum and compare against the recorded value
    pub fn verify_checksum(&self) -> bool {
        checksum_bytes(&self.data) == self.checksum
    }
}

/// Fragment encoder/decoder
pub struct StateEncoder;

impl StateEncoder {
    /// Split a state payload into `ceil(size / fragment_size)` fragments.
    ///
    /// A zero-byte payload produces a single empty fragment so the set is
    /// never empty and reassembly stays uniform.
    pub fn encode(state: &State, fragment_size: usize) -> Vec<Fragment> {
        let fragment_size = fragment_size.max(1);
        let payload = &state.payload;

        if payload.is_empty() {
            return vec![Fragment {
                state_id: state.state_id.clone(),
                index: 0,
                total: 1,
                offset: 0,
                length: 0,
                checksum: checksum_bytes(&[]),
                data: Vec::new(),
            }];
        }

        let total = payload.len().div_ceil(fragment_size);
        payload
            .chunks(fragment_size)
            .enumerate()
            .map(|(index, chunk)| Fragment {
                state_id: state.state_id.clone(),
                index,
                total,
                offset: (index * fragment_size) as u64,
                length: chunk.len() as u64,
                checksum: checksum_bytes(chunk),
                data: chunk.to_vec(),
            })
            .collect()
    }

    /// Reassemble a payload from fragments.
    ///
    /// Validates that indices form a contiguous [0, N) set with no gaps or
    /// duplicates, and that every fragment's checksum matches its data,
    /// before any bytes are concatenated.
    pub fn decode(fragments: &[Fragment]) -> Result<Vec<u8>, MeshError> {
        if fragments.is_empty() {
            return Err(MeshError::IncompleteFragmentSet("empty set".to_string()));
        }

        let total = fragments[0].total;
        if fragments.iter().any(|f| f.total != total) {
            return Err(MeshError::IncompleteFragmentSet(
                "fragments disagree on total count".to_string(),
            ));
        }
        if fragments.len() != total {
            return Err(MeshError::IncompleteFragmentSet(format!(
                "have {} fragments, expected {}",
                fragments.len(),
                total
            )));
        }

        let mut seen = vec![false; total];
        for f in fragments {
            if f.index >= total {
                return Err(MeshError::IncompleteFragmentSet(format!(
                    "index {} out of range [0, {})",
                    f.index, total
                )));
            }
            if seen[f.index] {
                return Err(MeshError::IncompleteFragmentSet(format!(
                    "duplicate index {}",
                    f.index
                )));
            }
            seen[f.index] = true;
        }

        for f in fragments {
            if !f.verify_checksum() {
                return Err(MeshError::FragmentChecksumMismatch(format!(
                    "state {} fragment {}",
                    f.state_id, f.index
                )));
            }
        }

        let mut ordered: Vec<&Fragment> = fragments.iter().collect();
        ordered.sort_by_key(|f| f.index);

        let capacity: usize = ordered.iter().map(|f| f.data.len()).sum();
        let mut payload = Vec::with_capacity(capacity);
        for f in ordered {
            payload.extend_from_slice(&f.data);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_state(len: usize) -> State {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        State::new(payload)
    }

    #[test]
    fn test_roundtrip_even_division() {
        let state = make_state(1024);
        let fragments = StateEncoder::encode(&state, 256);
        assert_eq!(fragments.len(), 4);
        assert_eq!(StateEncoder::decode(&fragments).unwrap(), state.payload);
    }

    #[test]
    fn test_roundtrip_uneven_division() {
        let state = make_state(1000);
        let fragments = StateEncoder::encode(&state, 333);
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments.last().unwrap().length, 1);
        assert_eq!(StateEncoder::decode(&fragments).unwrap(), state.payload);
    }

    #[test]
    fn test_roundtrip_single_fragment() {
        let state = make_state(10);
        let fragments = StateEncoder::encode(&state, 4096);
        assert_eq!(fragments.len(), 1);
        assert_eq!(StateEncoder::decode(&fragments).unwrap(), state.payload);
    }

    #[test]
    fn test_empty_payload() {
        let state = State::new(Vec::new());
        let fragments = StateEncoder::encode(&state, 64);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].length, 0);
        assert!(StateEncoder::decode(&fragments).unwrap().is_empty());
    }

    #[test]
    fn test_length_sum_invariant() {
        let state = make_state(7777);
        let fragments = StateEncoder::encode(&state, 512);
        let sum: u64 = fragments.iter().map(|f| f.length).sum();
        assert_eq!(sum, state.size_bytes());
    }

    #[test]
    fn test_decode_out_of_order() {
        let state = make_state(600);
        let mut fragments = StateEncoder::encode(&state, 100);
        fragments.reverse();
        assert_eq!(StateEncoder::decode(&fragments).unwrap(), state.payload);
    }

    #[test]
    fn test_decode_missing_fragment() {
        let state = make_state(600);
        let mut fragments = StateEncoder::encode(&state, 100);
        fragments.remove(2);
        assert!(matches!(
            StateEncoder::decode(&fragments),
            Err(MeshError::IncompleteFragmentSet(_))
        ));
    }

    #[test]
    fn test_decode_duplicate_fragment() {
        let state = make_state(600);
        let mut fragments = StateEncoder::encode(&state, 100);
        fragments[1] = fragments[0].clone();
        assert!(matches!(
            StateEncoder::decode(&fragments),
            Err(MeshError::IncompleteFragmentSet(_))
        ));
    }

    #[test]
    fn test_decode_corrupted_fragment() {
        let state = make_state(600);
        let mut fragments = StateEncoder::encode(&state, 100);
        fragments[3].data[0] ^= 0xff;
        assert!(matches!(
            StateEncoder::decode(&fragments),
            Err(MeshError::FragmentChecksumMismatch(_))
        ));
    }
}
