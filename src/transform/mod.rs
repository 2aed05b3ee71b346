//! TransformationEngine — derive new states from persisted ones
//!
//! Merge, translate, and enhance operate over persisted states and are pure
//! with respect to their sources: inputs are never mutated in place, and
//! every result is a new state the caller must persist explicitly.
//!
//! Merge works on structured (JSON-object) payloads, detecting field-level
//! conflicts and resolving them under the chosen strategy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MeshError;
use crate::persist::PersistenceManager;
use crate::state::{checksum_bytes, State, StateShape};

/// How field-level merge conflicts are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Majority value wins; ties broken by earliest source `created_at`
    Consensus,
    /// The value from the most recently created source wins
    Latest,
    /// Conflicts are returned unresolved instead of a merged state
    Manual,
}

/// One field on which source states disagreed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConflict {
    pub key: String,
    /// Distinct values observed across sources
    pub values: Vec<Value>,
    /// The winning value, when the strategy resolved it
    pub resolved: Option<Value>,
}

/// Accounting for a merge run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub conflicts: usize,
    pub conflicts_resolved: usize,
    pub unresolved: Vec<FieldConflict>,
}

/// Result of a merge: a new state unless manual conflicts remain
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: Option<State>,
    pub report: ConflictReport,
}

/// Before/after integrity bookkeeping for enhance/optimize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformReport {
    pub source_state_id: String,
    pub result_state_id: String,
    pub source_checksum: String,
    pub result_checksum: String,
    pub source_size: u64,
    pub result_size: u64,
}

type MigrationFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, MeshError> + Send + Sync>;

/// Produces new states from persisted ones
pub struct TransformationEngine {
    persistence: Arc<PersistenceManager>,
    migrations: HashMap<(u32, u32), MigrationFn>,
}

impl TransformationEngine {
    pub fn new(persistence: Arc<PersistenceManager>) -> Self {
        Self {
            persistence,
            migrations: HashMap::new(),
        }
    }

    /// Register a schema migration from one format version to another
    pub fn register_migration<F>(&mut self, from: u32, to: u32, migrate: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, MeshError> + Send + Sync + 'static,
    {
        self.migrations.insert((from, to), Arc::new(migrate));
    }

    /// Merge persisted states into a new one under a conflict strategy
    pub fn merge(
        &self,
        state_ids: &[String],
        strategy: ConflictStrategy,
    ) -> Result<MergeOutcome, MeshError> {
        let mut sources = Vec::with_capacity(state_ids.len());
        for id in state_ids {
            sources.push(self.persistence.load(id, true)?);
        }
        if sources.is_empty() {
            return Err(MeshError::NotFound("no merge sources given".to_string()));
        }

        let mut maps: Vec<BTreeMap<String, Value>> = Vec::with_capacity(sources.len());
        for state in &sources {
            let map: BTreeMap<String, Value> = serde_json::from_slice(&state.payload)?;
            maps.push(map);
        }

        let keys: BTreeSet<&String> = maps.iter().flat_map(|m| m.keys()).collect();
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        let mut conflicts = 0usize;
        let mut resolved = 0usize;
        let mut unresolved: Vec<FieldConflict> = Vec::new();

        for key in keys {
            // (value, index of contributing source) for sources holding the key
            let present: Vec<(&Value, usize)> = maps
                .iter()
                .enumerate()
                .filter_map(|(i, m)| m.get(key).map(|v| (v, i)))
                .collect();
            let mut distinct: Vec<&Value> = Vec::new();
            for (v, _) in &present {
                if !distinct.contains(v) {
                    distinct.push(v);
                }
            }

            if distinct.len() <= 1 {
                merged.insert(key.clone(), present[0].0.clone());
                continue;
            }

            conflicts += 1;
            match strategy {
                ConflictStrategy::Consensus => {
                    let winner = consensus_winner(&present, &sources);
                    merged.insert(key.clone(), winner.clone());
                    resolved += 1;
                }
                ConflictStrategy::Latest => {
                    let winner = present
                        .iter()
                        .max_by_key(|(_, i)| sources[*i].created_at)
                        .map(|(v, _)| (*v).clone())
                        .unwrap_or(Value::Null);
                    merged.insert(key.clone(), winner);
                    resolved += 1;
                }
                ConflictStrategy::Manual => {
                    unresolved.push(FieldConflict {
                        key: key.clone(),
                        values: distinct.into_iter().cloned().collect(),
                        resolved: None,
                    });
                }
            }
        }

        let report = ConflictReport {
            conflicts,
            conflicts_resolved: resolved,
            unresolved,
        };

        if !report.unresolved.is_empty() {
            info!(
                "Merge of {} states left {} manual conflicts unresolved",
                sources.len(),
                report.unresolved.len()
            );
            return Ok(MergeOutcome {
                merged: None,
                report,
            });
        }

        let payload = serde_json::to_vec(&merged)?;
        let fidelity =
            sources.iter().map(|s| s.fidelity).sum::<f64>() / sources.len() as f64;
        let format_version = sources.iter().map(|s| s.format_version).max().unwrap_or(1);

        let mut state = State::with_shape(
            uuid::Uuid::new_v4().to_string(),
            payload,
            StateShape {
                dims: vec![merged.len()],
                element_type: "json".to_string(),
                size_bytes: 0,
            },
        );
        state.shape.size_bytes = state.size_bytes();
        state.fidelity = fidelity;
        state.format_version = format_version;

        info!(
            "Merged {} states into {}: {} conflicts, {} resolved",
            sources.len(),
            state.state_id,
            report.conflicts,
            report.conflicts_resolved
        );
        Ok(MergeOutcome {
            merged: Some(state),
            report,
        })
    }

    /// Apply registered schema migrations to reach a target format version.
    ///
    /// Follows the shortest chain of registered (from, to) edges; fails with
    /// `UnsupportedFormatVersion` when no path exists.
    pub fn translate(&self, state_id: &str, target_version: u32) -> Result<State, MeshError> {
        let source = self.persistence.load(state_id, true)?;
        if source.format_version == target_version {
            return Ok(derive_state(&source, source.payload.clone(), target_version));
        }

        let path = self
            .migration_path(source.format_version, target_version)
            .ok_or(MeshError::UnsupportedFormatVersion {
                from: source.format_version,
                to: target_version,
            })?;

        let mut payload = source.payload.clone();
        for (from, to) in &path {
            let migrate = &self.migrations[&(*from, *to)];
            payload = migrate(&payload)?;
        }

        info!(
            "Translated state {} from v{} to v{} via {} step(s)",
            state_id,
            source.format_version,
            target_version,
            path.len()
        );
        Ok(derive_state(&source, payload, target_version))
    }

    /// Apply a caller-supplied transformation to a persisted payload.
    ///
    /// The engine's contract is the before/after integrity bookkeeping, not
    /// the transformation's content.
    pub fn enhance<F>(&self, state_id: &str, transform: F) -> Result<(State, TransformReport), MeshError>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let source = self.persistence.load(state_id, true)?;
        let result_payload = transform(&source.payload);
        let result = derive_state(&source, result_payload, source.format_version);

        let report = TransformReport {
            source_state_id: source.state_id.clone(),
            result_state_id: result.state_id.clone(),
            source_checksum: source.checksum.clone(),
            result_checksum: result.checksum.clone(),
            source_size: source.size_bytes(),
            result_size: result.size_bytes(),
        };
        Ok((result, report))
    }

    /// Same contract as `enhance`, logging the size ratio
    pub fn optimize_state<F>(
        &self,
        state_id: &str,
        transform: F,
    ) -> Result<(State, TransformReport), MeshError>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let (state, report) = self.enhance(state_id, transform)?;
        let ratio = if report.result_size > 0 {
            report.source_size as f64 / report.result_size as f64
        } else {
            f64::INFINITY
        };
        info!(
            "Optimized state {}: {} -> {} bytes (ratio {:.2})",
            state_id, report.source_size, report.result_size, ratio
        );
        Ok((state, report))
    }

    /// Shortest chain of registered migrations, BFS over version edges
    fn migration_path(&self, from: u32, to: u32) -> Option<Vec<(u32, u32)>> {
        let mut frontier = vec![from];
        let mut parent: HashMap<u32, (u32, u32)> = HashMap::new();
        let mut visited: BTreeSet<u32> = BTreeSet::new();
        visited.insert(from);

        while let Some(version) = frontier.pop() {
            for &(edge_from, edge_to) in self.migrations.keys() {
                if edge_from == version && visited.insert(edge_to) {
                    parent.insert(edge_to, (edge_from, edge_to));
                    if edge_to == to {
                        let mut path = Vec::new();
                        let mut cursor = to;
                        while cursor != from {
                            let edge = parent[&cursor];
                            path.push(edge);
                            cursor = edge.0;
                        }
                        path.reverse();
                        return Some(path);
                    }
                    frontier.push(edge_to);
                }
            }
        }
        None
    }
}

/// New state derived from a source: fresh ID and checksum, source metadata
fn derive_state(source: &State, payload: Vec<u8>, format_version: u32) -> State {
    let checksum = checksum_bytes(&payload);
    let size = payload.len() as u64;
    State {
        state_id: uuid::Uuid::new_v4().to_string(),
        payload,
        shape: StateShape {
            dims: source.shape.dims.clone(),
            element_type: source.shape.element_type.clone(),
            size_bytes: size,
        },
        checksum,
        fidelity: source.fidelity,
        format_version,
        created_at: chrono::Utc::now(),
    }
}

/// Majority value; ties broken by the earliest contributing source
fn consensus_winner(present: &[(&Value, usize)], sources: &[State]) -> Value {
    let mut tally: Vec<(&Value, usize, chrono::DateTime<chrono::Utc>)> = Vec::new();
    for (value, source_idx) in present {
        let created = sources[*source_idx].created_at;
        match tally.iter_mut().find(|(v, _, _)| v == value) {
            Some((_, count, earliest)) => {
                *count += 1;
                if created < *earliest {
                    *earliest = created;
                }
            }
            None => tally.push((value, 1, created)),
        }
    }
    tally
        .into_iter()
        .max_by(|(_, c1, e1), (_, c2, e2)| c1.cmp(c2).then(e2.cmp(e1)))
        .map(|(v, _, _)| v.clone())
        .unwrap_or(Value::Null)
}
