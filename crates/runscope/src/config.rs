//! # Configuration
//!
//! `RunscopeConfig` is read from `$RUNSCOPE_HOME/config.toml` when it exists.
//! Every field has a default, so an empty or missing file is a valid
//! configuration. Command line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::errors::{Result, RunscopeError};

/// Environment variable carrying the run-scoped channel id to instrumented processes
pub const CHANNEL_ENV_VAR: &str = "RUNSCOPE_IPC_ID";

/// Environment variable overriding the runscope home directory
pub const HOME_ENV_VAR: &str = "RUNSCOPE_HOME";

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 250;
pub const DEFAULT_TAIL_POLL_MS: u64 = 500;
pub const DEFAULT_TAIL_CHUNK_BYTES: usize = 8 * 256;
pub const DEFAULT_TAIL_MAX_BATCH: usize = 1000;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 15_000;
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:3010";

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn get_runscope_home() -> PathBuf {
    match std::env::var_os(HOME_ENV_VAR) {
        Some(home) => PathBuf::from(home),
        None => home_dir().unwrap_or_default().join(".runscope"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunscopeConfig {
    /// Root directory holding one subdirectory per project
    pub samples_root: PathBuf,
    /// Sampler and delay probe base interval
    pub sample_interval_ms: u64,
    /// How long a tail waits at end of file before polling again
    pub tail_poll_ms: u64,
    pub tail_chunk_bytes: usize,
    /// Upper bound on events per batch sent to a viewer
    pub tail_max_batch: usize,
    /// How long the supervisor keeps the channel open after the child exits
    pub grace_period_ms: u64,
    pub server_address: SocketAddr,
    /// Tag used to register the supervised child itself
    pub main_tag: String,
    /// Environment variables copied into the run meta
    pub record_env: Vec<String>,
}

impl Default for RunscopeConfig {
    fn default() -> Self {
        Self {
            samples_root: get_runscope_home().join("samples"),
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            tail_poll_ms: DEFAULT_TAIL_POLL_MS,
            tail_chunk_bytes: DEFAULT_TAIL_CHUNK_BYTES,
            tail_max_batch: DEFAULT_TAIL_MAX_BATCH,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            server_address: DEFAULT_SERVER_ADDRESS
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 3010))),
            main_tag: "main".to_string(),
            record_env: Vec::new(),
        }
    }
}

impl FromStr for RunscopeConfig {
    type Err = RunscopeError;

    fn from_str(content: &str) -> Result<Self> {
        let config: RunscopeConfig =
            toml::from_str(content).map_err(|e| RunscopeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl RunscopeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        content.parse()
    }

    /// Load from an explicit path, or from the default location if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = get_runscope_home().join("config.toml");
                if default_path.exists() {
                    debug!("Loading configuration from {:?}", default_path);
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(RunscopeError::Config(
                "sample_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.tail_chunk_bytes == 0 || self.tail_max_batch == 0 {
            return Err(RunscopeError::Config(
                "tail_chunk_bytes and tail_max_batch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn tail_poll(&self) -> Duration {
        Duration::from_millis(self.tail_poll_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Number of probe readings that make up one flush, about one per second
    pub fn probe_flush_threshold(&self) -> usize {
        (1000 / self.sample_interval_ms).max(1) as usize
    }
}
