//! Configuration loading.
//!
//! Loads `straylight.toml` (or `$STRAYLIGHT_CONFIG_PATH`) into
//! [`StraylightConfig`]. Precedence: env vars > config file > defaults.
//! Invalid env overrides are logged and ignored rather than failing the
//! load.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::nucleus::NucleusConfig;
use crate::plan::{Backoff, RetrySpec};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StraylightConfig {
    /// Nucleus budgets and hooks (`[nucleus]`).
    pub nucleus: NucleusSection,
    /// Runtime checkpointing (`[runtime]`).
    pub runtime: RuntimeSection,
    /// Default retry contract (`[retry]`).
    pub retry: RetrySection,
    /// Reference LLM transport (`[llm]`).
    pub llm: LlmSection,
}

/// `[nucleus]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NucleusSection {
    /// Context window budget in tokens.
    pub max_context_tokens: u64,
    /// Maximum inference rounds per invocation.
    pub max_query_rounds: u32,
    /// Maximum retrieval fulfillments per invocation.
    pub max_retrieval_rounds: u32,
    /// Whether the preflight hook runs.
    pub preflight: bool,
    /// Whether the postcheck hook runs.
    pub postcheck: bool,
    /// Maximum response tokens per round.
    pub max_answer_tokens: u32,
}

impl Default for NucleusSection {
    fn default() -> Self {
        let defaults = NucleusConfig::default();
        Self {
            max_context_tokens: defaults.max_context_tokens,
            max_query_rounds: defaults.max_query_rounds,
            max_retrieval_rounds: defaults.max_retrieval_rounds,
            preflight: defaults.preflight_enabled,
            postcheck: defaults.postcheck_enabled,
            max_answer_tokens: defaults.max_answer_tokens,
        }
    }
}

/// `[runtime]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Checkpoint after this many completed tasks.
    pub checkpoint_interval: u32,
    /// Filesystem checkpoint store root; unset means in-memory only.
    pub checkpoint_dir: Option<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            checkpoint_interval: 1,
            checkpoint_dir: None,
        }
    }
}

/// `[retry]` section: the contract applied to tasks naming a
/// `retry_policy`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Total attempts including the first.
    pub attempts: u32,
    /// `"fixed"` or `"exp"`.
    pub backoff: String,
    /// Base delay in milliseconds.
    pub base_ms: u64,
    /// Whether to jitter delays by uniform(0.5, 1.0).
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: "exp".to_owned(),
            base_ms: 1000,
            jitter: true,
        }
    }
}

/// `[llm]` section for the reference transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// API base URL.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// API key; usually supplied via `STRAYLIGHT_API_KEY`.
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_owned(),
            model: "claude-sonnet-4-20250514".to_owned(),
            api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl StraylightConfig {
    /// Load configuration: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only when the config file exists but cannot be
    /// read or parsed; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                toml::from_str(&contents).context("failed to parse config TOML")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    fn config_path(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("STRAYLIGHT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("straylight.toml"))
    }

    /// Apply env overrides. Takes a resolver so tests avoid touching the
    /// process environment.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        override_parse(&env, "STRAYLIGHT_MAX_CONTEXT_TOKENS", &mut self.nucleus.max_context_tokens);
        override_parse(&env, "STRAYLIGHT_MAX_QUERY_ROUNDS", &mut self.nucleus.max_query_rounds);
        override_parse(
            &env,
            "STRAYLIGHT_MAX_RETRIEVAL_ROUNDS",
            &mut self.nucleus.max_retrieval_rounds,
        );
        override_parse(&env, "STRAYLIGHT_PREFLIGHT", &mut self.nucleus.preflight);
        override_parse(&env, "STRAYLIGHT_POSTCHECK", &mut self.nucleus.postcheck);
        override_parse(
            &env,
            "STRAYLIGHT_CHECKPOINT_INTERVAL",
            &mut self.runtime.checkpoint_interval,
        );

        if let Some(dir) = env("STRAYLIGHT_CHECKPOINT_DIR") {
            self.runtime.checkpoint_dir = Some(dir);
        }
        if let Some(model) = env("STRAYLIGHT_MODEL") {
            self.llm.model = model;
        }
        if let Some(base_url) = env("STRAYLIGHT_BASE_URL") {
            self.llm.base_url = base_url;
        }
        if let Some(key) = env("STRAYLIGHT_API_KEY") {
            self.llm.api_key = Some(key);
        }
    }

    /// Project the `[nucleus]` section into the runtime's config type.
    pub fn nucleus_config(&self) -> NucleusConfig {
        NucleusConfig {
            max_context_tokens: self.nucleus.max_context_tokens,
            max_query_rounds: self.nucleus.max_query_rounds,
            max_retrieval_rounds: self.nucleus.max_retrieval_rounds,
            preflight_enabled: self.nucleus.preflight,
            postcheck_enabled: self.nucleus.postcheck,
            allowed_tools: Vec::new(),
            max_answer_tokens: self.nucleus.max_answer_tokens,
        }
    }

    /// Project the `[retry]` section into the plan-level retry type.
    pub fn retry_spec(&self) -> RetrySpec {
        RetrySpec {
            attempts: self.retry.attempts.max(1),
            backoff: match self.retry.backoff.as_str() {
                "fixed" => Backoff::Fixed,
                _ => Backoff::Exp,
            },
            base_ms: self.retry.base_ms,
            jitter: self.retry.jitter,
        }
    }
}

fn override_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = env(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => {
                tracing::warn!(var = key, value = %raw, "ignoring invalid env override");
            }
        }
    }
}
