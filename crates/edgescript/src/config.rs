//! Engine configuration.
//!
//! All knobs carry defaults tuned for a constrained edge device, so an empty
//! config (or an empty YAML document) yields a working engine. Durations are
//! expressed in milliseconds to keep config files flat.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Top-level configuration for the script consumer and its subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker tasks draining the execution queue.
    pub workers: usize,
    /// Capacity of the bounded execution queue.
    pub queue_capacity: usize,
    /// How long a synchronous `execute_script` call waits for queue admission.
    pub admission_wait_ms: u64,
    /// Execution deadline applied when a script declares no timeout.
    pub default_timeout_ms: u64,
    /// Capability namespaces scripts may use.
    pub allowed_apis: Vec<String>,
    /// Interpreter pool sizing and eviction.
    pub pool: PoolConfig,
    /// Per-interpreter sandbox ceilings.
    pub limits: SandboxLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            admission_wait_ms: 2_000,
            default_timeout_ms: 5_000,
            allowed_apis: vec!["vars".to_string(), "sys".to_string()],
            pool: PoolConfig::default(),
            limits: SandboxLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from a YAML document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is not valid YAML or a
    /// field has the wrong type.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Queue admission deadline for synchronous submissions.
    #[must_use]
    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    /// Execution deadline for scripts that declare none.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Interpreter pool sizing and eviction ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of idle interpreters kept for reuse.
    pub max_size: usize,
    /// Idle time after which the sweep closes an interpreter.
    pub max_idle_ms: u64,
    /// Total lifetime after which an interpreter is retired.
    pub max_lifetime_ms: u64,
    /// How often the background sweep runs.
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            max_idle_ms: 5 * 60 * 1_000,
            max_lifetime_ms: 60 * 60 * 1_000,
            sweep_interval_ms: 60 * 1_000,
        }
    }
}

impl PoolConfig {
    /// Idle ceiling as a [`Duration`].
    #[must_use]
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    /// Lifetime ceiling as a [`Duration`].
    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    /// Sweep cadence as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Resource ceilings applied to every sandboxed interpreter.
///
/// These bound a runaway script: even an execution orphaned past its
/// timeout terminates once it exhausts its operation budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Maximum interpreter operations per run (0 disables the ceiling).
    pub max_operations: u64,
    /// Maximum nested call levels.
    pub max_call_levels: usize,
    /// Maximum string length a script may build.
    pub max_string_size: usize,
    /// Maximum array length a script may build.
    pub max_array_size: usize,
    /// Maximum object-map size a script may build.
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 5_000_000,
            max_call_levels: 64,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}
