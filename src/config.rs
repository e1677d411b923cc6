//! Global configuration parsing and validation.
//!
//! Every field carries a default, so an empty TOML document is a valid
//! configuration. Watchdog thresholds are layered: a per-stage table under
//! `[watchdog.stages.<name>]` overrides the top-level `[watchdog]` keys.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::subprocess::options::{DEFAULT_KILL_GRACE_MS, DEFAULT_MAX_OUTPUT_BYTES};
use crate::{AppError, Result};

/// Stage name whose overrides drive the file-processing watchdog.
pub const PROCESSING_STAGE: &str = "processing";

/// Defaults applied to every tracked subprocess spawn.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubprocessConfig {
    /// Capture cap per stream; the oldest bytes are dropped past it.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Window between the polite signal and `SIGKILL`.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Signal sent first when terminating a tree.
    #[serde(default = "default_kill_signal")]
    pub kill_signal: String,
    /// Maximum number of entries retained in the registry event ledger.
    #[serde(default = "default_event_ledger_limit")]
    pub event_ledger_limit: usize,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
            kill_signal: default_kill_signal(),
            event_ledger_limit: default_event_ledger_limit(),
        }
    }
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_kill_grace_ms() -> u64 {
    DEFAULT_KILL_GRACE_MS
}

fn default_kill_signal() -> String {
    "SIGTERM".into()
}

fn default_event_ledger_limit() -> usize {
    512
}

/// Inputs for building deterministic ownership ids.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OwnershipConfig {
    /// Build identifier embedded in the default stage prefix.
    #[serde(default = "default_build_id")]
    pub build_id: String,
    /// Replaces `stage1:<build_id>` when set to a non-blank value.
    #[serde(default)]
    pub stage1_file_prefix: Option<String>,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            build_id: default_build_id(),
            stage1_file_prefix: None,
        }
    }
}

fn default_build_id() -> String {
    "build".into()
}

/// Raw watchdog thresholds in milliseconds. `None` means "not configured".
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogThresholds {
    /// Interval of the "still working" heartbeat.
    pub progress_heartbeat_ms: Option<u64>,
    /// Idle time before periodic stall snapshots are logged.
    pub stall_snapshot_ms: Option<u64>,
    /// Idle time before the stage is aborted; `0` disables.
    pub stall_abort_ms: Option<u64>,
    /// Idle time before a soft-kick; `0` disables, unset derives from abort.
    pub stall_soft_kick_ms: Option<u64>,
    /// Minimum spacing between soft-kicks.
    pub soft_kick_cooldown_ms: Option<u64>,
    /// Soft-kicks allowed between two progress ticks.
    pub soft_kick_max_attempts: Option<u32>,
}

impl WatchdogThresholds {
    /// Fill every unset field of `self` from `fallback`.
    #[must_use]
    pub fn or(&self, fallback: &Self) -> Self {
        Self {
            progress_heartbeat_ms: self.progress_heartbeat_ms.or(fallback.progress_heartbeat_ms),
            stall_snapshot_ms: self.stall_snapshot_ms.or(fallback.stall_snapshot_ms),
            stall_abort_ms: self.stall_abort_ms.or(fallback.stall_abort_ms),
            stall_soft_kick_ms: self.stall_soft_kick_ms.or(fallback.stall_soft_kick_ms),
            soft_kick_cooldown_ms: self.soft_kick_cooldown_ms.or(fallback.soft_kick_cooldown_ms),
            soft_kick_max_attempts: self
                .soft_kick_max_attempts
                .or(fallback.soft_kick_max_attempts),
        }
    }
}

/// Watchdog configuration: top-level thresholds plus per-stage overrides.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// Thresholds applied to every stage.
    #[serde(flatten)]
    pub defaults: WatchdogThresholds,
    /// Stage-specific overrides keyed by stage name.
    #[serde(default)]
    pub stages: HashMap<String, WatchdogThresholds>,
}

impl WatchdogConfig {
    /// Thresholds for `stage`, with stage overrides taking precedence.
    #[must_use]
    pub fn thresholds_for(&self, stage: &str) -> WatchdogThresholds {
        self.stages
            .get(stage)
            .map_or_else(|| self.defaults.clone(), |stage| stage.or(&self.defaults))
    }
}

/// Global configuration parsed from `index-warden.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Subprocess spawn defaults.
    #[serde(default)]
    pub subprocess: SubprocessConfig,
    /// Ownership id inputs.
    #[serde(default)]
    pub ownership: OwnershipConfig,
    /// Stall watchdog thresholds.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Thresholds for the file-processing stage.
    #[must_use]
    pub fn processing_thresholds(&self) -> WatchdogThresholds {
        self.watchdog.thresholds_for(PROCESSING_STAGE)
    }

    fn validate(&self) -> Result<()> {
        if self.subprocess.max_output_bytes == 0 {
            return Err(AppError::Config(
                "subprocess.max_output_bytes must be greater than zero".into(),
            ));
        }

        if self.subprocess.event_ledger_limit == 0 {
            return Err(AppError::Config(
                "subprocess.event_ledger_limit must be greater than zero".into(),
            ));
        }

        crate::subprocess::kill_tree::KillSignal::parse(&self.subprocess.kill_signal)?;

        if self.ownership.build_id.trim().is_empty() {
            return Err(AppError::Config("ownership.build_id must not be blank".into()));
        }

        Ok(())
    }
}
