//! Execution checkpoints and their stores.
//!
//! A [`Checkpoint`] is a deep, serializable snapshot of a run: goal,
//! packet, plan, completed outputs, the executed set, the ledger so far,
//! and metrics. The scheduler cuts one every `checkpoint_interval`
//! completed tasks and before surfacing any error, so a failed run can
//! always resume. Stores are pluggable behind [`CheckpointStore`];
//! in-memory and filesystem (`<base>/<run_id>/<checkpoint_id>.json`)
//! implementations ship here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::context::ContextPacket;
use crate::ledger::LedgerEntry;
use crate::plan::Plan;
use crate::types::{Goal, RunMetrics};

/// Checkpoint schema version written by this build. Only the major
/// component is enforced on load.
pub const CURRENT_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The run state captured inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    /// The run's goal.
    pub goal: Goal,
    /// The immutable context packet.
    pub context: ContextPacket,
    /// The plan being executed.
    pub plan: Plan,
    /// Outputs of completed tasks.
    pub outputs: BTreeMap<String, Value>,
    /// Ids of tasks that reached `TASK_END`.
    pub executed: BTreeSet<String>,
    /// Ledger entries up to the snapshot point.
    pub ledger: Vec<LedgerEntry>,
    /// Run metrics at the snapshot point.
    pub metrics: RunMetrics,
}

/// A versioned, restorable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Checkpoint identifier (unique within the run).
    pub id: String,
    /// The run this snapshot belongs to.
    pub run_id: String,
    /// Milliseconds since the Unix epoch at snapshot time.
    pub ts: i64,
    /// Schema version (semver; only major is enforced).
    pub version: String,
    /// Captured state.
    pub state: CheckpointState,
}

impl Checkpoint {
    /// Snapshot `state` for `run_id` with a fresh id at the current
    /// schema version.
    pub fn capture(run_id: impl Into<String>, state: CheckpointState) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            ts: Utc::now().timestamp_millis(),
            version: CURRENT_VERSION.to_owned(),
            state,
        }
    }

    /// Reject snapshots with missing identity or an incompatible major
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Invalid`] or
    /// [`CheckpointError::VersionMismatch`].
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.id.is_empty() || self.run_id.is_empty() {
            return Err(CheckpointError::Invalid(
                "checkpoint id and run id must be non-empty".to_owned(),
            ));
        }
        let stored = major_version(&self.version).ok_or_else(|| {
            CheckpointError::Invalid(format!("unparseable version {:?}", self.version))
        })?;
        let current = major_version(CURRENT_VERSION).unwrap_or(0);
        if stored != current {
            return Err(CheckpointError::VersionMismatch {
                stored: self.version.clone(),
                current: CURRENT_VERSION.to_owned(),
            });
        }
        Ok(())
    }

    /// Store-facing metadata view.
    pub fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            id: self.id.clone(),
            run_id: self.run_id.clone(),
            ts: self.ts,
            version: self.version.clone(),
        }
    }
}

fn major_version(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}

/// Listing metadata for a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    /// Checkpoint identifier.
    pub id: String,
    /// Owning run.
    pub run_id: String,
    /// Snapshot timestamp (ms).
    pub ts: i64,
    /// Schema version.
    pub version: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Checkpoint store failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint matched the query.
    #[error("checkpoint not found: run {run_id}, id {id:?}")]
    NotFound {
        /// Queried run.
        run_id: String,
        /// Queried id, when one was given.
        id: Option<String>,
    },
    /// The snapshot's major version differs from this build's.
    #[error("checkpoint version {stored} is incompatible with {current}")]
    VersionMismatch {
        /// Version stored in the snapshot.
        stored: String,
        /// Version this build writes.
        current: String,
    },
    /// The snapshot is structurally unusable.
    #[error("invalid checkpoint: {0}")]
    Invalid(String),
    /// Filesystem failure.
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("checkpoint codec: {0}")]
    Codec(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Pluggable persistence for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot. Validates before writing.
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Fetch a snapshot: the named one, or the latest by timestamp when
    /// `id` is omitted. Validates after reading.
    async fn get(&self, run_id: &str, id: Option<&str>) -> Result<Checkpoint, CheckpointError>;

    /// Metadata for all snapshots of a run, newest first.
    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError>;

    /// Drop all but the `keep_last` newest snapshots. Returns how many
    /// were removed.
    async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, CheckpointError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Non-durable store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.validate()?;
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        runs.entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn get(&self, run_id: &str, id: Option<&str>) -> Result<Checkpoint, CheckpointError> {
        let runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let snapshots = runs.get(run_id);
        let found = match (snapshots, id) {
            (Some(list), Some(id)) => list.iter().find(|c| c.id == id).cloned(),
            (Some(list), None) => list.iter().max_by_key(|c| c.ts).cloned(),
            (None, _) => None,
        };
        let checkpoint = found.ok_or_else(|| CheckpointError::NotFound {
            run_id: run_id.to_owned(),
            id: id.map(ToOwned::to_owned),
        })?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut metas: Vec<CheckpointMeta> = runs
            .get(run_id)
            .map(|list| list.iter().map(Checkpoint::meta).collect())
            .unwrap_or_default();
        metas.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(metas)
    }

    async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, CheckpointError> {
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(list) = runs.get_mut(run_id) else {
            return Ok(0);
        };
        let before = list.len();
        list.sort_by(|a, b| b.ts.cmp(&a.ts));
        list.truncate(keep_last);
        Ok(before.saturating_sub(list.len()))
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Durable store: `<base>/<run_id>/<checkpoint_id>.json`, pretty-printed,
/// written atomically via tmp-rename.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    base: PathBuf,
}

impl FsCheckpointStore {
    /// Store rooted at `base`. The directory is created on first write.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base.join(run_id)
    }

    fn read_all(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            snapshots.push(serde_json::from_str(&contents)?);
        }
        Ok(snapshots)
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.validate()?;
        let dir = self.run_dir(&checkpoint.run_id);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", checkpoint.id));
        let tmp = dir.join(format!("{}.json.tmp", checkpoint.id));
        let contents = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &path)?;

        debug!(run_id = %checkpoint.run_id, id = %checkpoint.id, "checkpoint written");
        Ok(())
    }

    async fn get(&self, run_id: &str, id: Option<&str>) -> Result<Checkpoint, CheckpointError> {
        let found = match id {
            Some(id) => {
                let path = self.run_dir(run_id).join(format!("{id}.json"));
                if path.is_file() {
                    let contents = std::fs::read_to_string(&path)?;
                    Some(serde_json::from_str(&contents)?)
                } else {
                    None
                }
            }
            None => self
                .read_all(run_id)?
                .into_iter()
                .max_by_key(|c: &Checkpoint| c.ts),
        };
        let checkpoint = found.ok_or_else(|| CheckpointError::NotFound {
            run_id: run_id.to_owned(),
            id: id.map(ToOwned::to_owned),
        })?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let mut metas: Vec<CheckpointMeta> = self
            .read_all(run_id)?
            .iter()
            .map(Checkpoint::meta)
            .collect();
        metas.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(metas)
    }

    async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, CheckpointError> {
        let mut snapshots = self.read_all(run_id)?;
        snapshots.sort_by(|a, b| b.ts.cmp(&a.ts));
        let mut removed = 0usize;
        for stale in snapshots.iter().skip(keep_last) {
            let path = self.run_dir(run_id).join(format!("{}.json", stale.id));
            std::fs::remove_file(&path)?;
            removed = removed.saturating_add(1);
        }
        Ok(removed)
    }
}
