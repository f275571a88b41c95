//! Engine Configuration
//!
//! Loaded from YAML. Every field has a default so an empty file, or no file
//! at all, yields a usable configuration.
//!
//! ```yaml
//! run_poll_delay: 2
//! log_level: info
//! contexts:
//!   local:
//!     job_retry: 0
//!     clean: false
//!     io_retry:
//!       attempts: 3
//!       delay_ms: 500
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Seconds between two poll passes over a running step.
pub const DEFAULT_POLL_DELAY: u64 = 2;

/// Top-level engine settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds to sleep between poll passes
    pub run_poll_delay: u64,

    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,

    /// Optional file receiving log output instead of stderr
    pub log_file: Option<PathBuf>,

    /// Per execution/data context settings, keyed by context name
    pub contexts: BTreeMap<String, ContextConfig>,
}

/// Settings for one execution or data context.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Relaunches allowed per map item before the step fails
    pub job_retry: u32,

    /// Delete pre-existing output and staging targets before writing
    pub clean: bool,

    /// Retry policy for data operations (list, mkdir, copy...)
    pub io_retry: IoRetryConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IoRetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_poll_delay: DEFAULT_POLL_DELAY,
            log_level: "info".to_string(),
            log_file: None,
            contexts: BTreeMap::new(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            job_retry: 0,
            clean: false,
            io_retry: IoRetryConfig::default(),
        }
    }
}

impl Default for IoRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Reads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Parses configuration text. An empty document gives the defaults.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        debug!("Loaded config with {} context sections", config.contexts.len());
        Ok(config)
    }

    /// Settings for `context`, falling back to defaults.
    pub fn context(&self, context: &str) -> ContextConfig {
        self.contexts.get(context).cloned().unwrap_or_default()
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_secs(self.run_poll_delay)
    }

    /// Builder-style override, mostly for tests and embedding.
    pub fn with_poll_delay(mut self, seconds: u64) -> Self {
        self.run_poll_delay = seconds;
        self
    }

    pub fn with_context(mut self, name: impl Into<String>, context: ContextConfig) -> Self {
        self.contexts.insert(name.into(), context);
        self
    }
}
