//! Run configuration stored under `.mutation/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::coordinator::RetryPolicy;
use crate::core::packing::PackingLimits;

/// Run configuration (TOML).
///
/// Passed explicitly to every command; there is no process-global state.
/// Missing fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Parts per worker packet.
    pub types_per_worker: usize,

    /// Worker processes (and therefore ports) per batch.
    pub max_workers: usize,

    /// Port of the first worker; packet `i` uses `base_port + i`.
    pub base_port: u16,

    /// Operations per packing slot.
    pub ops_per_slot: usize,

    pub retry: RetryConfig,

    pub timing: TimingConfig,

    /// Case-insensitive regexes; a matching last error ends the current part.
    pub fatal_error_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_executions: u32,
    pub max_undelivered: u32,
    pub hard_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_executions: policy.max_executions,
            max_undelivered: policy.max_undelivered,
            hard_limit: policy.hard_limit,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            inactivity_timeout_secs: 90,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            types_per_worker: 4,
            max_workers: 10,
            base_port: 30001,
            ops_per_slot: 10,
            retry: RetryConfig::default(),
            timing: TimingConfig::default(),
            fatal_error_patterns: default_fatal_patterns(),
        }
    }
}

fn default_fatal_patterns() -> Vec<String> {
    [
        r"connection (refused|reset)",
        r"transport error",
        r"broken pipe",
        r"(entity|resource|component) .*(not found|does not exist)",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.types_per_worker == 0 {
            return Err(anyhow!("types_per_worker must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.ops_per_slot == 0 {
            return Err(anyhow!("ops_per_slot must be > 0"));
        }
        if usize::from(self.base_port) + self.max_workers - 1 > usize::from(u16::MAX) {
            return Err(anyhow!(
                "base_port {} + max_workers {} overflows the port range",
                self.base_port,
                self.max_workers
            ));
        }
        if self.retry.max_executions == 0 || self.retry.max_undelivered == 0 {
            return Err(anyhow!("retry limits must be > 0"));
        }
        if self.retry.hard_limit < self.retry.max_executions.max(self.retry.max_undelivered) {
            return Err(anyhow!("retry.hard_limit must be >= the other retry limits"));
        }
        if self.timing.heartbeat_interval_secs == 0 || self.timing.inactivity_timeout_secs == 0 {
            return Err(anyhow!("timing intervals must be > 0"));
        }
        self.fatal_patterns()?;
        Ok(())
    }

    pub fn packing_limits(&self) -> PackingLimits {
        PackingLimits {
            types_per_worker: self.types_per_worker,
            max_workers: self.max_workers,
            ops_per_slot: self.ops_per_slot,
            base_port: self.base_port,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_executions: self.retry.max_executions,
            max_undelivered: self.retry.max_undelivered,
            hard_limit: self.retry.hard_limit,
        }
    }

    /// Compile `fatal_error_patterns` (case-insensitive).
    pub fn fatal_patterns(&self) -> Result<Vec<Regex>> {
        self.fatal_error_patterns
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?i){pattern}"))
                    .with_context(|| format!("invalid fatal_error_patterns entry '{pattern}'"))
            })
            .collect()
    }
}

/// Load config from a TOML file. A missing file is an error; run `init` first.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "missing config {} (run `mutation-runner init`)",
            path.display()
        ));
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!(path = %path.display(), workers = cfg.max_workers, "config loaded");
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
