//! Subscriber wiring for processes hosting the kernel.
//!
//! The kernel itself only *emits* `tracing` events; installing a
//! subscriber is the embedder's call. This module packages the two
//! shapes embedders keep rebuilding around a run: stderr-only (tests,
//! one-shot embeddings) and stderr plus a daily-rotated JSON file for
//! long-lived hosts that want process logs next to their replay
//! bundles. Both honor `RUST_LOG`, falling back to a kernel-scoped
//! filter so a noisy embedder crate does not drown run telemetry.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Rotated file name stem; the appender suffixes the date.
const LOG_FILE_STEM: &str = "straylight.jsonl";

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "straylight=info,warn";

/// What to install. `RUST_LOG` always wins over `default_filter`.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for the rotated JSON log; stderr-only when unset.
    pub logs_dir: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            logs_dir: None,
            default_filter: DEFAULT_FILTER.to_owned(),
        }
    }
}

impl LogOptions {
    /// Also write rotated JSON logs under `dir`, builder style.
    #[must_use]
    pub fn with_logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(dir.into());
        self
    }
}

/// Keeps the non-blocking file writer alive. Dropping it flushes and
/// closes the rotated log; hold it for the life of the host process.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Assemble the subscriber without installing it. Split from [`init`]
/// so tests can scope it with `tracing::subscriber::with_default`.
fn build(
    options: &LogOptions,
) -> anyhow::Result<(impl tracing::Subscriber + Send + Sync, Option<WorkerGuard>)> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let (file_layer, guard) = match &options.logs_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                anyhow::anyhow!("failed to create logs directory {}: {e}", dir.display())
            })?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_STEM));
            let layer = tracing_subscriber::fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    Ok((subscriber, guard))
}

/// Install the global subscriber described by `options`.
///
/// # Errors
///
/// Returns an error when the logs directory cannot be created or when a
/// global subscriber is already installed.
pub fn init(options: LogOptions) -> anyhow::Result<LoggingGuard> {
    let (subscriber, guard) = build(&options)?;
    subscriber
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
    Ok(LoggingGuard { _file: guard })
}

/// Best-effort stderr logging for tests and demos. Safe to call from
/// every test; losing the install race to an earlier caller is fine.
pub fn init_for_tests() {
    let _ = init(LogOptions::default());
}
