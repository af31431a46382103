//! Append-only decision ledger.
//!
//! Every consequential decision a run makes (plan selection, guard
//! evaluations, policy gates, tool calls, nucleus inference rounds,
//! verification results) is appended here as a typed entry with a content
//! digest. The ledger is the substrate of replay: it is exported verbatim
//! into the replay bundle and snapshotted into every checkpoint.
//!
//! Invariants: entry ids are strictly increasing, entries are never deleted
//! or mutated, and [`Ledger::validate`] recomputes every digest.

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::digest::digest_value;

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

/// The decision categories a run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// The scheduler committed to a plan.
    PlanSelected,
    /// An edge guard was evaluated.
    GuardEval,
    /// A task began its pipeline body.
    TaskStart,
    /// A task completed successfully.
    TaskEnd,
    /// Pre-execution policy decision for a task.
    PolicyPre,
    /// Post-execution policy decision for a task.
    PolicyPost,
    /// Verification expressions were evaluated against a task output.
    Verification,
    /// A tool call envelope stage (start, complete, or error).
    ToolCall,
    /// One nucleus inference round (prompt digest + reasoning preview).
    NucleusInference,
    /// A retrieved artifact was promoted into a task's internal scope,
    /// or a retrieval directive failed to resolve.
    ContextInternalized,
    /// The end-of-run goal summary.
    GoalSummary,
    /// A failure at any pipeline stage.
    Error,
    /// A guarded branch was committed.
    BranchTaken,
    /// A compensation-required edge fired.
    Compensation,
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// One appended decision record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic id, unique within the ledger.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    /// Decision category.
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Type-specific payload.
    pub details: Value,
    /// SHA-256 over the canonical `{id, ts, type, details}`, when computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl LedgerEntry {
    /// Recompute the digest this entry should carry.
    pub fn expected_digest(&self) -> String {
        digest_value(&json!({
            "id": self.id,
            "ts": self.ts,
            "type": self.entry_type,
            "details": self.details,
        }))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Ledger integrity and codec errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An entry's stored digest does not match its recomputed digest.
    #[error("digest mismatch at entry {id}: stored {stored}, computed {computed}")]
    DigestMismatch {
        /// Offending entry id.
        id: u64,
        /// Digest carried by the entry.
        stored: String,
        /// Digest recomputed from the entry contents.
        computed: String,
    },
    /// Entry ids are not strictly increasing.
    #[error("non-monotonic entry id {id} after {previous}")]
    NonMonotonicId {
        /// Offending entry id.
        id: u64,
        /// The id that preceded it.
        previous: u64,
    },
    /// A JSONL line failed to decode.
    #[error("line {line}: {message}")]
    Decode {
        /// 1-based line number.
        line: usize,
        /// Parse failure text.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerInner {
    entries: Vec<LedgerEntry>,
    next_id: u64,
}

/// Append-only ordered sequence of [`LedgerEntry`] with monotonic ids.
///
/// Appends are strictly serial: the interior mutex is held for the full
/// id-assignment-and-push, so no two entries interleave and ids never
/// repeat. Readers get snapshots, never live references.
#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry with a computed digest. Returns the stored entry.
    pub fn append(&self, entry_type: EntryType, details: Value) -> LedgerEntry {
        self.push(entry_type, details, true)
    }

    /// Append an entry without a digest (diagnostic payloads that will
    /// never be replay-verified).
    pub fn append_raw(&self, entry_type: EntryType, details: Value) -> LedgerEntry {
        self.push(entry_type, details, false)
    }

    fn push(&self, entry_type: EntryType, details: Value, compute_digest: bool) -> LedgerEntry {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = inner.next_id;
        inner.next_id = id.saturating_add(1);

        let mut entry = LedgerEntry {
            id,
            ts: Utc::now().timestamp_millis(),
            entry_type,
            details,
            digest: None,
        };
        if compute_digest {
            entry.digest = Some(entry.expected_digest());
        }
        inner.entries.push(entry.clone());
        entry
    }

    /// Immutable snapshot of all entries.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.clone())
            .unwrap_or_default()
    }

    /// Snapshot of entries matching one type.
    pub fn entries_by_type(&self, entry_type: EntryType) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .entries
                    .iter()
                    .filter(|e| e.entry_type == entry_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of entries appended so far.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    /// Whether the ledger holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify id monotonicity and every stored digest.
    ///
    /// # Errors
    ///
    /// Returns the first [`LedgerError`] found.
    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_entries(&self.entries())
    }

    /// Replace the ledger contents with entries restored from a
    /// checkpoint. Subsequent appends continue after the highest restored
    /// id, so monotonicity holds across a resume.
    pub fn restore(&self, entries: Vec<LedgerEntry>) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_id = entries
            .last()
            .map(|e| e.id.saturating_add(1))
            .unwrap_or(0);
        inner.entries = entries;
    }

    /// Encode the ledger as JSONL, one entry per line.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            if let Ok(line) = serde_json::to_string(&entry) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    /// Decode a JSONL document produced by [`Ledger::to_jsonl`].
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Decode`] naming the offending line.
    pub fn from_jsonl(text: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry: LedgerEntry =
                serde_json::from_str(trimmed).map_err(|e| LedgerError::Decode {
                    line: index.saturating_add(1),
                    message: e.to_string(),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Validate a standalone entry slice (used by the bundle validator on
/// entries decoded from disk).
pub fn validate_entries(entries: &[LedgerEntry]) -> Result<(), LedgerError> {
    let mut previous: Option<u64> = None;
    for entry in entries {
        if let Some(prev) = previous {
            if entry.id <= prev {
                return Err(LedgerError::NonMonotonicId {
                    id: entry.id,
                    previous: prev,
                });
            }
        }
        previous = Some(entry.id);

        if let Some(stored) = &entry.digest {
            let computed = entry.expected_digest();
            if *stored != computed {
                return Err(LedgerError::DigestMismatch {
                    id: entry.id,
                    stored: stored.clone(),
                    computed,
                });
            }
        }
    }
    Ok(())
}
