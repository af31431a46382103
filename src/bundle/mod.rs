//! Replay bundles: a run as a portable, validatable directory.
//!
//! [`export`] writes goal, context, plans (selected flagged), planner
//! record, the full ledger as JSONL, per-task I/O, and checkpoints, plus
//! a `manifest.json` carrying per-file digests and a bundle digest over
//! the canonical sort of `path:digest` pairs. [`validate`] re-checks all
//! of it, including the ledger digest chain; [`load`] reconstructs an
//! in-memory view.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::context::ContextPacket;
use crate::digest::{digest_text, sha256_hex};
use crate::ledger::{validate_entries, Ledger, LedgerEntry, LedgerError};
use crate::nucleus::NucleusMetrics;
use crate::plan::Plan;
use crate::types::Goal;

/// Bundle schema version written by this build; major is enforced on
/// validate/load.
pub const BUNDLE_SCHEMA_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Artifact types
// ---------------------------------------------------------------------------

/// What the planner did, preserved for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerRecord {
    /// Digest of the emit-stage prompt.
    pub prompt_digest: String,
    /// Rationale of the selected plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Nucleus telemetry across planning stages.
    #[serde(default)]
    pub metrics: NucleusMetrics,
    /// Rejected candidates as `(label, reason)`.
    #[serde(default)]
    pub rejected: Vec<(String, String)>,
}

/// One task's input and output as executed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIo {
    /// Input handed to the handler.
    pub input: Value,
    /// Output the task produced.
    pub output: Value,
}

/// Everything a run leaves behind, ready for export.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    /// The run id.
    pub run_id: String,
    /// The run's goal.
    pub goal: Goal,
    /// The immutable context packet.
    pub context: ContextPacket,
    /// All candidate plans.
    pub plans: Vec<Plan>,
    /// Id of the plan that actually ran.
    pub selected_plan_id: String,
    /// The planner record, when planning happened in-process.
    pub planner: Option<PlannerRecord>,
    /// The full ledger.
    pub ledger_entries: Vec<LedgerEntry>,
    /// Per-task I/O for executed tasks.
    pub task_io: BTreeMap<String, TaskIo>,
    /// Checkpoints cut during the run.
    pub checkpoints: Vec<Checkpoint>,
}

/// The manifest written at the bundle root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    /// Bundle schema version.
    pub schema_version: String,
    /// The exported run.
    pub run_id: String,
    /// Export time, milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Relative path → content digest for every bundled file.
    pub files: BTreeMap<String, String>,
    /// Digest over the canonical sort of `path:digest` pairs.
    pub digest: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Bundle export/validate/load failures.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Filesystem failure.
    #[error("bundle io: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("bundle codec: {0}")]
    Codec(#[from] serde_json::Error),
    /// A required file is absent.
    #[error("bundle is missing {0}")]
    MissingFile(String),
    /// A file's content does not match its manifest digest.
    #[error("digest mismatch for {path}")]
    FileDigestMismatch {
        /// Offending relative path.
        path: String,
    },
    /// The manifest's bundle digest does not match its file table.
    #[error("bundle digest mismatch")]
    BundleDigestMismatch,
    /// The bundle was written by an incompatible schema.
    #[error("bundle schema {stored} is incompatible with {current}")]
    SchemaMismatch {
        /// Version stored in the manifest.
        stored: String,
        /// Version this build understands.
        current: String,
    },
    /// The bundled ledger fails its own integrity checks.
    #[error("ledger integrity: {0}")]
    Ledger(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Write `artifacts` as a bundle directory at `dir`.
///
/// # Errors
///
/// Returns [`BundleError`] on I/O or serialization failure.
pub fn export(dir: &Path, artifacts: &RunArtifacts) -> Result<BundleManifest, BundleError> {
    std::fs::create_dir_all(dir)?;
    std::fs::create_dir_all(dir.join("plans"))?;
    std::fs::create_dir_all(dir.join("task-io"))?;
    std::fs::create_dir_all(dir.join("checkpoints"))?;

    let mut files: BTreeMap<String, String> = BTreeMap::new();
    let mut write = |relative: String, contents: String| -> Result<(), BundleError> {
        let path = dir.join(&relative);
        std::fs::write(&path, &contents)?;
        files.insert(relative, digest_text(&contents));
        Ok(())
    };

    write("goal.json".to_owned(), pretty(&artifacts.goal)?)?;
    write("context.json".to_owned(), pretty(&artifacts.context)?)?;
    write(
        "planner.json".to_owned(),
        pretty(&artifacts.planner.clone().unwrap_or_default())?,
    )?;

    for plan in &artifacts.plans {
        let entry = serde_json::json!({
            "selected": plan.id == artifacts.selected_plan_id,
            "plan": plan,
        });
        write(format!("plans/{}.json", plan.id), pretty(&entry)?)?;
    }

    let ledger = Ledger::new();
    ledger.restore(artifacts.ledger_entries.clone());
    write("ledger.jsonl".to_owned(), ledger.to_jsonl())?;

    for (task_id, io) in &artifacts.task_io {
        write(format!("task-io/{task_id}.json"), pretty(io)?)?;
    }

    for checkpoint in &artifacts.checkpoints {
        write(
            format!("checkpoints/{}.json", checkpoint.id),
            pretty(checkpoint)?,
        )?;
    }

    let manifest = BundleManifest {
        schema_version: BUNDLE_SCHEMA_VERSION.to_owned(),
        run_id: artifacts.run_id.clone(),
        created_at: Utc::now().timestamp_millis(),
        digest: bundle_digest(&files),
        files,
    };
    std::fs::write(dir.join("manifest.json"), pretty(&manifest)?)?;

    debug!(dir = %dir.display(), files = manifest.files.len(), "bundle exported");
    Ok(manifest)
}

/// The bundle digest: SHA-256 over sorted `path:digest` lines.
fn bundle_digest(files: &BTreeMap<String, String>) -> String {
    let mut canonical = String::new();
    for (path, digest) in files {
        canonical.push_str(path);
        canonical.push(':');
        canonical.push_str(digest);
        canonical.push('\n');
    }
    sha256_hex(canonical.as_bytes())
}

fn pretty<T: Serialize>(value: &T) -> Result<String, BundleError> {
    Ok(serde_json::to_string_pretty(value)?)
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Required files beyond the plan set.
const REQUIRED_FILES: [&str; 4] = ["goal.json", "context.json", "planner.json", "ledger.jsonl"];

/// Check a bundle directory: manifest schema, per-file digests, bundle
/// digest, and the ledger digest chain.
///
/// # Errors
///
/// Returns the first [`BundleError`] found.
pub fn validate(dir: &Path) -> Result<(), BundleError> {
    let manifest = read_manifest(dir)?;

    for required in REQUIRED_FILES {
        if !manifest.files.contains_key(required) {
            return Err(BundleError::MissingFile(required.to_owned()));
        }
    }
    if !manifest.files.keys().any(|path| path.starts_with("plans/")) {
        return Err(BundleError::MissingFile("plans/*.json".to_owned()));
    }

    for (relative, expected) in &manifest.files {
        let path = dir.join(relative);
        if !path.is_file() {
            return Err(BundleError::MissingFile(relative.clone()));
        }
        let contents = std::fs::read_to_string(&path)?;
        if digest_text(&contents) != *expected {
            return Err(BundleError::FileDigestMismatch {
                path: relative.clone(),
            });
        }
    }

    if bundle_digest(&manifest.files) != manifest.digest {
        return Err(BundleError::BundleDigestMismatch);
    }

    let ledger_text = std::fs::read_to_string(dir.join("ledger.jsonl"))?;
    let entries = Ledger::from_jsonl(&ledger_text)?;
    validate_entries(&entries)?;

    Ok(())
}

fn read_manifest(dir: &Path) -> Result<BundleManifest, BundleError> {
    let path = dir.join("manifest.json");
    if !path.is_file() {
        return Err(BundleError::MissingFile("manifest.json".to_owned()));
    }
    let manifest: BundleManifest = serde_json::from_str(&std::fs::read_to_string(path)?)?;

    let stored_major = manifest.schema_version.split('.').next().unwrap_or("");
    let current_major = BUNDLE_SCHEMA_VERSION.split('.').next().unwrap_or("0");
    if stored_major != current_major {
        return Err(BundleError::SchemaMismatch {
            stored: manifest.schema_version.clone(),
            current: BUNDLE_SCHEMA_VERSION.to_owned(),
        });
    }
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// An in-memory view of a loaded bundle.
#[derive(Debug, Clone)]
pub struct ReplayBundle {
    /// The bundle manifest.
    pub manifest: BundleManifest,
    /// The run's goal.
    pub goal: Goal,
    /// The immutable context packet.
    pub context: ContextPacket,
    /// All bundled plans with their selection flag.
    pub plans: Vec<(bool, Plan)>,
    /// The planner record.
    pub planner: PlannerRecord,
    /// The full ledger.
    pub ledger: Vec<LedgerEntry>,
    /// Per-task I/O.
    pub task_io: BTreeMap<String, TaskIo>,
    /// Bundled checkpoints.
    pub checkpoints: Vec<Checkpoint>,
}

impl ReplayBundle {
    /// The plan that actually ran.
    pub fn selected_plan(&self) -> Option<&Plan> {
        self.plans
            .iter()
            .find(|(selected, _)| *selected)
            .map(|(_, plan)| plan)
    }

    /// Executed task outputs, keyed by task id.
    pub fn outputs_by_task(&self) -> BTreeMap<String, Value> {
        self.task_io
            .iter()
            .map(|(id, io)| (id.clone(), io.output.clone()))
            .collect()
    }
}

/// Validate, then load a bundle directory into memory.
///
/// # Errors
///
/// Returns [`BundleError`] on any integrity or codec failure.
pub fn load(dir: &Path) -> Result<ReplayBundle, BundleError> {
    validate(dir)?;
    let manifest = read_manifest(dir)?;

    let goal: Goal = read_json(&dir.join("goal.json"))?;
    let context: ContextPacket = read_json(&dir.join("context.json"))?;
    let planner: PlannerRecord = read_json(&dir.join("planner.json"))?;

    let mut plans = Vec::new();
    let mut task_io = BTreeMap::new();
    let mut checkpoints = Vec::new();
    for relative in manifest.files.keys() {
        let path = dir.join(relative);
        if relative.starts_with("plans/") {
            let entry: Value = read_json(&path)?;
            let selected = entry.get("selected").and_then(Value::as_bool).unwrap_or(false);
            let plan: Plan =
                serde_json::from_value(entry.get("plan").cloned().unwrap_or(Value::Null))?;
            plans.push((selected, plan));
        } else if relative.starts_with("task-io/") {
            let io: TaskIo = read_json(&path)?;
            let task_id = file_stem(&path);
            task_io.insert(task_id, io);
        } else if relative.starts_with("checkpoints/") {
            checkpoints.push(read_json(&path)?);
        }
    }

    let ledger_text = std::fs::read_to_string(dir.join("ledger.jsonl"))?;
    let ledger = Ledger::from_jsonl(&ledger_text)?;

    Ok(ReplayBundle {
        manifest,
        goal,
        context,
        plans,
        planner,
        ledger,
        task_io,
        checkpoints,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, BundleError> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_owned()
}
