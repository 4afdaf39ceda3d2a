//! Runtime configuration.

use crate::{Error, Result};
use serde::Deserialize;

/// Default write promise for outputs, also the default of every block's
/// implicit `OutputMaxWrite` constant.
pub const DEFAULT_MAX_WRITE: usize = 1024;

/// Default read promise for inputs.
pub const DEFAULT_MAX_READ: usize = 1024;

/// Configuration for a graph's runtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Write promise given to outputs that `start()` leaves alone.
    pub default_max_write: usize,
    /// Read promise given to inputs that `start()` leaves alone.
    pub default_max_read: usize,
    /// Input threshold given to inputs that `start()` leaves alone.
    pub default_threshold: usize,
    /// Maximum back-to-back flow calls per scheduling pass of one block.
    pub flow_batch: usize,
    /// Maximum jobs drained per scheduling pass of one block.
    pub drain_batch: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_max_write: DEFAULT_MAX_WRITE,
            default_max_read: DEFAULT_MAX_READ,
            default_threshold: 1,
            flow_batch: 64,
            drain_batch: 32,
            thread_name: "flow".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from TOML; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("default_max_write", self.default_max_write),
            ("default_max_read", self.default_max_read),
            ("default_threshold", self.default_threshold),
            ("flow_batch", self.flow_batch),
            ("drain_batch", self.drain_batch),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if self.default_threshold > self.default_max_read {
            return Err(Error::InvalidConfig(format!(
                "default_threshold {} exceeds default_max_read {}",
                self.default_threshold, self.default_max_read
            )));
        }
        Ok(())
    }
}
