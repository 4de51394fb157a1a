//! Limits and service configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capabilities::CapabilitySet;
use crate::error::ConfigError;
use crate::gatekeeper::GatePolicy;

/// Budgets for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Wall-clock budget in milliseconds.
    pub time_ms: u64,
    /// Upper bound on the transcript, in bytes.
    pub output_bytes: usize,
    /// Python frames deep before `RecursionError`.
    pub max_recursion_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_ms: 2_000,
            output_bytes: 64 * 1024,
            max_recursion_depth: 1_000,
        }
    }
}

impl Limits {
    /// Hard upper bounds for per-request overrides.
    pub fn ceilings() -> Self {
        Self {
            time_ms: 10_000,
            output_bytes: 1024 * 1024,
            ..Self::default()
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("time_ms", self.time_ms as usize),
            ("output_bytes", self.output_bytes),
            ("max_recursion_depth", self.max_recursion_depth),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }
}

/// rlimits applied to every worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLimits {
    /// Address space for the whole worker. Allocations past it surface as
    /// `MemoryError`.
    pub mem_kb: u64,
    pub nofile: u64,
    pub fsize_kb: u64,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            mem_kb: 1024 * 1024,
            nofile: 16,
            fsize_kb: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Applied when a request does not ask for anything else.
    pub limits: Limits,
    pub ceilings: Limits,
    pub capabilities: Arc<CapabilitySet>,
    pub policy: GatePolicy,
    pub worker: WorkerLimits,
    /// Binary re-executed as `codebox worker`. Defaults to the current executable.
    pub worker_exe: Option<PathBuf>,
    pub max_concurrent: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            ceilings: Limits::ceilings(),
            capabilities: Arc::new(CapabilitySet::standard()),
            policy: GatePolicy::default(),
            worker: WorkerLimits::default(),
            worker_exe: None,
            max_concurrent: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        self.ceilings.validate()?;
        if self.max_concurrent == 0 {
            return Err(ConfigError::Zero("max_concurrent"));
        }
        if self.worker.mem_kb == 0 {
            return Err(ConfigError::Zero("mem_kb"));
        }
        if self.limits.time_ms > self.ceilings.time_ms {
            return Err(ConfigError::AboveCeiling("time_ms"));
        }
        if self.limits.output_bytes > self.ceilings.output_bytes {
            return Err(ConfigError::AboveCeiling("output_bytes"));
        }
        Ok(())
    }

    /// Limits for one request: the defaults with any overrides, clamped to the
    /// ceilings. Zero overrides fall back to the defaults.
    pub fn limits_for(&self, time_ms: Option<u64>, output_bytes: Option<usize>) -> Limits {
        let mut limits = self.limits.clone();
        if let Some(ms) = time_ms.filter(|&ms| ms > 0) {
            limits.time_ms = ms.min(self.ceilings.time_ms);
        }
        if let Some(bytes) = output_bytes.filter(|&b| b > 0) {
            limits.output_bytes = bytes.min(self.ceilings.output_bytes);
        }
        limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SandboxConfig::default().validate().unwrap();
    }

    #[test]
    fn request_overrides_are_clamped() {
        let config = SandboxConfig::default();
        let limits = config.limits_for(Some(60_000), Some(usize::MAX));
        assert_eq!(limits.time_ms, config.ceilings.time_ms);
        assert_eq!(limits.output_bytes, config.ceilings.output_bytes);

        let limits = config.limits_for(Some(500), None);
        assert_eq!(limits.time_ms, 500);
        assert_eq!(limits.output_bytes, config.limits.output_bytes);

        assert_eq!(config.limits_for(Some(0), Some(0)), config.limits);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = SandboxConfig::default();
        config.limits.output_bytes = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("output_bytes")));

        let mut config = SandboxConfig::default();
        config.max_concurrent = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("max_concurrent")));
    }

    #[test]
    fn defaults_above_ceiling_are_rejected() {
        let mut config = SandboxConfig::default();
        config.limits.time_ms = config.ceilings.time_ms + 1;
        assert_eq!(config.validate(), Err(ConfigError::AboveCeiling("time_ms")));
    }

    #[test]
    fn limits_deserialize_with_defaults() {
        let limits: Limits = serde_json::from_str(r#"{"time_ms": 300}"#).unwrap();
        assert_eq!(limits.time_ms, 300);
        assert_eq!(limits.max_recursion_depth, Limits::default().max_recursion_depth);
    }
}
