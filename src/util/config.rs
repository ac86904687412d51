//! Engine configuration.
//!
//! All structs use `#[serde(default)]`, so a JSON file only needs the keys
//! it overrides:
//!
//! ```json
//! { "device": { "memory_limit_bytes": 268435456 }, "backend": { "max_register_count": 64 } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{Error, Result};

/// Environment variable holding the path of a JSON config file.
pub const CONFIG_ENV_VAR: &str = "LIDARSIM_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub backend: BackendConfig,
}

/// Device runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Upper bound on live device allocations; `None` means unlimited.
    pub memory_limit_bytes: Option<usize>,
    /// Kernel worker threads; 0 lets rayon pick.
    pub worker_threads: usize,
}

/// Module optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    Level0,
    Level1,
    Level2,
    Level3,
}

/// Module/pipeline debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLevel {
    None,
    Minimal,
    Full,
}

/// Ray-tracing backend compile, link and stack settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub max_register_count: u32,
    pub opt_level: OptLevel,
    pub debug_level: DebugLevel,
    pub num_payload_values: u32,
    pub num_attribute_values: u32,
    pub max_trace_depth: u32,
    pub direct_callable_stack_size_from_traversal: u32,
    pub direct_callable_stack_size_from_state: u32,
    pub continuation_stack_size: u32,
    pub max_traversable_graph_depth: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let debug = cfg!(debug_assertions);
        Self {
            max_register_count: 100,
            opt_level: if debug { OptLevel::Level0 } else { OptLevel::Level2 },
            debug_level: if debug { DebugLevel::Full } else { DebugLevel::None },
            num_payload_values: 4,
            num_attribute_values: 2,
            max_trace_depth: 2,
            direct_callable_stack_size_from_traversal: 2 * 1024,
            direct_callable_stack_size_from_state: 2 * 1024,
            continuation_stack_size: 2 * 1024,
            max_traversable_graph_depth: 3,
        }
    }
}

impl EngineConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Load from the file named by `LIDARSIM_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                tracing::debug!(path = ?path, "loading engine config");
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the backend would refuse at construction time.
    pub fn validate(&self) -> Result<()> {
        let b = &self.backend;
        if b.num_payload_values == 0 || b.num_payload_values > 8 {
            return Err(Error::Config(format!(
                "num_payload_values must be in 1..=8, got {}",
                b.num_payload_values
            )));
        }
        if b.num_attribute_values > 8 {
            return Err(Error::Config(format!(
                "num_attribute_values must be <= 8, got {}",
                b.num_attribute_values
            )));
        }
        if b.max_traversable_graph_depth < 2 {
            return Err(Error::Config(
                "max_traversable_graph_depth must allow instance -> geometry traversal (>= 2)"
                    .into(),
            ));
        }
        if b.max_trace_depth == 0 {
            return Err(Error::Config("max_trace_depth must be >= 1".into()));
        }
        if self.device.memory_limit_bytes == Some(0) {
            return Err(Error::Config("memory_limit_bytes must be non-zero".into()));
        }
        Ok(())
    }
}
