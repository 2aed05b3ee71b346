//! PersistenceManager — durable system of record for transferred states
//!
//! Stores state payloads and their distribution records behind a backing
//! store, with gzip compression, replica management, and integrity-verified
//! retrieval. Writes are all-or-nothing per call; concurrent writes to the
//! same state are rejected rather than racing.

pub mod store;

pub use store::{BackingStore, FileStore, MemoryStore};

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::state::{checksum_bytes, State, StateShape};
use crate::swarm::DistributionRecord;

/// Durable record for one persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub state_id: String,
    /// Primary storage location descriptor
    pub location: String,
    /// Checksum of the uncompressed payload
    pub checksum: String,
    /// Uncompressed payload size
    pub size_bytes: u64,
    pub compressed: bool,
    pub original_size: u64,
    pub compressed_size: Option<u64>,
    pub encrypted: bool,
    pub shape: StateShape,
    pub fidelity: f64,
    pub format_version: u32,
    pub replica_locations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable manifest: entries plus their distribution records
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: HashMap<String, PersistedEntry>,
    records: HashMap<String, DistributionRecord>,
}

/// Durable storage of states and their distribution records
pub struct PersistenceManager {
    store: Box<dyn BackingStore>,
    entries: RwLock<HashMap<String, PersistedEntry>>,
    records: RwLock<HashMap<String, DistributionRecord>>,
    in_flight: Mutex<HashSet<String>>,
    manifest_path: Option<PathBuf>,
}

/// Removes the in-flight mark when a write completes or unwinds
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    state_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.state_id);
    }
}

impl PersistenceManager {
    /// Manager over an in-memory store (tests and demo)
    pub fn in_memory(capacity: Option<u64>) -> Self {
        Self {
            store: Box::new(MemoryStore::new(capacity)),
            entries: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            manifest_path: None,
        }
    }

    /// Manager over a directory, loading any existing manifest
    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, MeshError> {
        let dir = dir.into();
        let store = FileStore::open(&dir)?;
        let manifest_path = dir.join("manifest.json");
        let manifest = if manifest_path.exists() {
            let json = std::fs::read_to_string(&manifest_path)?;
            let manifest: Manifest = serde_json::from_str(&json)?;
            info!(
                "Loaded persistence manifest with {} entries",
                manifest.entries.len()
            );
            manifest
        } else {
            Manifest::default()
        };
        Ok(Self {
            store: Box::new(store),
            entries: RwLock::new(manifest.entries),
            records: RwLock::new(manifest.records),
            in_flight: Mutex::new(HashSet::new()),
            manifest_path: Some(manifest_path),
        })
    }

    /// Manager over a caller-supplied store
    pub fn with_store(store: Box<dyn BackingStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            manifest_path: None,
        }
    }

    fn begin_write(&self, state_id: &str) -> Result<InFlightGuard<'_>, MeshError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_flight.insert(state_id.to_string()) {
            return Err(MeshError::ConcurrentModification(state_id.to_string()));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            state_id: state_id.to_string(),
        })
    }

    fn save_manifest(&self) -> Result<(), MeshError> {
        if let Some(path) = &self.manifest_path {
            let manifest = Manifest {
                entries: self.entries.read().unwrap().clone(),
                records: self.records.read().unwrap().clone(),
            };
            std::fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
        }
        Ok(())
    }

    /// Durably record a state and its distribution, returning the location.
    ///
    /// Surfaces `StorageExhausted` before writing anything; a failed persist
    /// leaves no entry behind.
    pub fn persist(
        &self,
        state: &State,
        record: Option<&DistributionRecord>,
    ) -> Result<String, MeshError> {
        let _guard = self.begin_write(&state.state_id)?;

        if !state.verify_checksum() {
            return Err(MeshError::IntegrityViolation(state.state_id.clone()));
        }
        let needed = state.size_bytes();
        if let Some(available) = self.store.free_capacity() {
            if needed > available {
                return Err(MeshError::StorageExhausted { needed, available });
            }
        }

        let location = self.store.put(&state.state_id, &state.payload)?;
        let entry = PersistedEntry {
            state_id: state.state_id.clone(),
            location: location.clone(),
            checksum: state.checksum.clone(),
            size_bytes: needed,
            compressed: false,
            original_size: needed,
            compressed_size: None,
            encrypted: false,
            shape: state.shape.clone(),
            fidelity: state.fidelity,
            format_version: state.format_version,
            replica_locations: Vec::new(),
            created_at: state.created_at,
        };
        self.entries
            .write()
            .unwrap()
            .insert(state.state_id.clone(), entry);
        if let Some(record) = record {
            self.records
                .write()
                .unwrap()
                .insert(state.state_id.clone(), record.clone());
        }
        self.save_manifest()?;
        info!("Persisted state {} ({} bytes)", state.state_id, needed);
        Ok(location)
    }

    /// Read a state back, transparently decompressing and verifying integrity
    pub fn load(&self, state_id: &str, verify_integrity: bool) -> Result<State, MeshError> {
        let entry = self
            .entries
            .read()
            .unwrap()
            .get(state_id)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(state_id.to_string()))?;

        let stored = self.store.get(state_id)?;
        let payload = if entry.compressed {
            let mut decoder = GzDecoder::new(stored.as_slice());
            let mut out = Vec::with_capacity(entry.original_size as usize);
            decoder.read_to_end(&mut out)?;
            out
        } else {
            stored
        };

        if verify_integrity && checksum_bytes(&payload) != entry.checksum {
            return Err(MeshError::IntegrityViolation(state_id.to_string()));
        }

        Ok(State {
            state_id: entry.state_id,
            payload,
            shape: entry.shape,
            checksum: entry.checksum,
            fidelity: entry.fidelity,
            format_version: entry.format_version,
            created_at: entry.created_at,
        })
    }

    /// Replace the stored bytes with a gzip representation.
    ///
    /// Reversible: a subsequent `load` transparently decompresses. Replica
    /// copies are rewritten so they stay byte-identical with the primary.
    /// Returns `(original_size, compressed_size)`.
    pub fn compress(&self, state_id: &str) -> Result<(u64, u64), MeshError> {
        let _guard = self.begin_write(state_id)?;

        let entry = self
            .entries
            .read()
            .unwrap()
            .get(state_id)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(state_id.to_string()))?;
        if entry.compressed {
            return Ok((
                entry.original_size,
                entry.compressed_size.unwrap_or(entry.original_size),
            ));
        }

        let payload = self.store.get(state_id)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;
        let compressed_size = compressed.len() as u64;

        self.store.put(state_id, &compressed)?;
        for i in 0..entry.replica_locations.len() {
            self.store.put(&replica_key(state_id, i), &compressed)?;
        }

        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(state_id) {
            entry.compressed = true;
            entry.compressed_size = Some(compressed_size);
        }
        drop(entries);
        self.save_manifest()?;

        info!(
            "Compressed state {}: {} -> {} bytes",
            state_id, entry.original_size, compressed_size
        );
        Ok((entry.original_size, compressed_size))
    }

    /// Copy the stored payload to additional locations, converging on
    /// exactly `replica_count` replicas. Idempotent.
    pub fn replicate(&self, state_id: &str, replica_count: usize) -> Result<Vec<String>, MeshError> {
        let _guard = self.begin_write(state_id)?;

        let entry = self
            .entries
            .read()
            .unwrap()
            .get(state_id)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(state_id.to_string()))?;
        let current = entry.replica_locations.len();

        if current > replica_count {
            for i in replica_count..current {
                self.store.delete(&replica_key(state_id, i))?;
            }
        } else if current < replica_count {
            let payload = self.store.get(state_id)?;
            let added = (replica_count - current) as u64 * payload.len() as u64;
            if let Some(available) = self.store.free_capacity() {
                if added > available {
                    return Err(MeshError::StorageExhausted {
                        needed: added,
                        available,
                    });
                }
            }
            for i in current..replica_count {
                self.store.put(&replica_key(state_id, i), &payload)?;
            }
        }

        let locations: Vec<String> = (0..replica_count)
            .map(|i| self.store.location(&replica_key(state_id, i)))
            .collect();
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(state_id) {
            entry.replica_locations = locations.clone();
        }
        drop(entries);
        self.save_manifest()?;

        info!("State {} now has {} replicas", state_id, replica_count);
        Ok(locations)
    }

    /// Logical delete: removes the entry, payload, and replicas.
    /// Returns the number of bytes freed.
    pub fn delete(&self, state_id: &str) -> Result<u64, MeshError> {
        let _guard = self.begin_write(state_id)?;

        let entry = self
            .entries
            .write()
            .unwrap()
            .remove(state_id)
            .ok_or_else(|| MeshError::NotFound(state_id.to_string()))?;
        self.records.write().unwrap().remove(state_id);

        let stored_size = entry.compressed_size.unwrap_or(entry.size_bytes);
        self.store.delete(state_id)?;
        for i in 0..entry.replica_locations.len() {
            // A missing replica is not fatal to the delete.
            let _ = self.store.delete(&replica_key(state_id, i));
        }
        self.save_manifest()?;

        let freed = stored_size * (1 + entry.replica_locations.len() as u64);
        info!("Deleted state {} ({} bytes freed)", state_id, freed);
        Ok(freed)
    }

    /// Durable entry for a state, if present
    pub fn get_entry(&self, state_id: &str) -> Option<PersistedEntry> {
        self.entries.read().unwrap().get(state_id).cloned()
    }

    /// Distribution record persisted alongside a state, if any
    pub fn get_record(&self, state_id: &str) -> Option<DistributionRecord> {
        self.records.read().unwrap().get(state_id).cloned()
    }

    /// All persisted state IDs
    pub fn list_states(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn summary(&self) -> String {
        let entries = self.entries.read().unwrap();
        let total_bytes: u64 = entries.values().map(|e| e.size_bytes).sum();
        let compressed = entries.values().filter(|e| e.compressed).count();
        format!(
            "PersistenceManager | {} states | {} bytes | {} compressed",
            entries.len(),
            total_bytes,
            compressed
        )
    }
}

fn replica_key(state_id: &str, index: usize) -> String {
    format!("{}.replica{}", state_id, index)
}
