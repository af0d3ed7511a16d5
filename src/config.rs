/// Global sandbox defaults, loaded from JSON and overridden by `LIMITBOX_*` variables
use crate::types::{Result, SandboxError, SpawnMode, DEFAULT_GRACE_PERIOD};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_SPAWN_MODE: &str = "LIMITBOX_SPAWN_MODE";
pub const ENV_POLL_INTERVAL_MS: &str = "LIMITBOX_POLL_INTERVAL_MS";
pub const ENV_TERMINATION_TIMEOUT_MS: &str = "LIMITBOX_TERMINATION_TIMEOUT_MS";
pub const ENV_WORKER_PROGRAM: &str = "LIMITBOX_WORKER_PROGRAM";
pub const ENV_POOL_SIZE: &str = "LIMITBOX_POOL_SIZE";
pub const ENV_GRACE_PERIOD: &str = "LIMITBOX_GRACE_PERIOD";
pub const ENV_WARNINGS: &str = "LIMITBOX_WARNINGS";

/// Sandbox-wide configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Spawn mode used when a call does not pick one
    pub spawn_mode: SpawnMode,
    /// Supervision loop tick
    pub poll_interval: Duration,
    /// Time a signalled child gets before SIGKILL
    pub termination_timeout: Duration,
    /// Program re-executed in fresh-process mode, defaults to the current executable
    pub worker_program: Option<PathBuf>,
    /// Number of parked workers in pre-forked pool mode
    pub pool_size: usize,
    /// Grace period applied to limits built by the CLI
    pub default_grace_period: u64,
    /// Emit warnings about degraded capabilities
    pub warnings: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            spawn_mode: SpawnMode::CopyOnWrite,
            poll_interval: Duration::from_millis(10),
            termination_timeout: Duration::from_secs(1),
            worker_program: None,
            pool_size: 2,
            default_grace_period: DEFAULT_GRACE_PERIOD,
            warnings: true,
        }
    }
}

impl SandboxConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SandboxConfig = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the environment
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `LIMITBOX_*` variables on top of this configuration
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(value) = env_var(ENV_SPAWN_MODE) {
            self.spawn_mode = value.parse()?;
        }
        if let Some(value) = env_var(ENV_POLL_INTERVAL_MS) {
            self.poll_interval = Duration::from_millis(parse_number(ENV_POLL_INTERVAL_MS, &value)?);
        }
        if let Some(value) = env_var(ENV_TERMINATION_TIMEOUT_MS) {
            self.termination_timeout =
                Duration::from_millis(parse_number(ENV_TERMINATION_TIMEOUT_MS, &value)?);
        }
        if let Some(value) = env_var(ENV_WORKER_PROGRAM) {
            self.worker_program = Some(PathBuf::from(value));
        }
        if let Some(value) = env_var(ENV_POOL_SIZE) {
            self.pool_size = parse_number(ENV_POOL_SIZE, &value)? as usize;
        }
        if let Some(value) = env_var(ENV_GRACE_PERIOD) {
            self.default_grace_period = parse_number(ENV_GRACE_PERIOD, &value)?;
        }
        if let Some(value) = env_var(ENV_WARNINGS) {
            self.warnings = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(SandboxError::Config(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_WARNINGS, other
                    )))
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SandboxError::Config("poll_interval must be positive".to_string()));
        }
        if self.spawn_mode == SpawnMode::PreforkedPool && self.pool_size == 0 {
            return Err(SandboxError::Config(
                "pool_size must be at least 1 in pre-forked pool mode".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_spawn_mode(mut self, mode: SpawnMode) -> Self {
        self.spawn_mode = mode;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Worker program for fresh-process mode
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| SandboxError::Config(format!("{} must be a number, got '{}'", key, value)))
}
