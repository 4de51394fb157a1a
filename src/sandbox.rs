//! Service-facing entry point: concurrency cap, per-run limits and logging.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{info, info_span, Instrument};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::harness::{self, Evaluation};

/// Per-request overrides, clamped to the configured ceilings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub time_ms: Option<u64>,
    pub output_bytes: Option<usize>,
}

/// Cheap to clone; all clones share the configuration and the permits.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    permits: Arc<Semaphore>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            config: Arc::new(config),
            permits,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Names bound in every submission's namespace.
    pub fn capability_names(&self) -> Vec<&'static str> {
        self.config.capabilities.names().collect()
    }

    /// Screens and runs one submission. Waits for a permit when
    /// `max_concurrent` runs are already in flight.
    pub async fn execute(&self, code: &str, options: RunOptions) -> Evaluation {
        let run_id = uuid::Uuid::new_v4();
        let limits = self.config.limits_for(options.time_ms, options.output_bytes);
        let span = info_span!("run", %run_id);

        async {
            // The semaphore is never closed, so acquiring cannot fail.
            let _permit = self.permits.acquire().await.ok();
            let started = Instant::now();
            info!(code_bytes = code.len(), time_ms = limits.time_ms, "Running submission");

            let evaluation = harness::evaluate(code, &self.config, limits).await;

            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                rejected = evaluation.rejection.is_some(),
                failed = evaluation.result.failed,
                timed_out = evaluation.result.timed_out,
                truncated = evaluation.result.truncated,
                "Submission finished"
            );
            evaluation
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::error::ConfigError;

    #[test]
    fn invalid_configuration_is_refused() {
        let config = SandboxConfig {
            max_concurrent: 0,
            ..SandboxConfig::default()
        };
        assert!(matches!(
            Sandbox::new(config),
            Err(SandboxError::Config(ConfigError::Zero("max_concurrent")))
        ));
    }

    #[tokio::test]
    async fn request_limits_are_clamped() {
        let config = SandboxConfig {
            limits: Limits {
                output_bytes: 64,
                ..Limits::default()
            },
            ceilings: Limits {
                output_bytes: 128,
                ..Limits::ceilings()
            },
            ..SandboxConfig::default()
        };
        let sandbox = Sandbox::new(config).unwrap();
        let options = RunOptions {
            output_bytes: Some(1 << 20),
            ..RunOptions::default()
        };
        // Refused before any worker starts, so this stays in process.
        let evaluation = sandbox.execute(&format!("import os
{}", "#".repeat(200)), options).await;
        assert!(evaluation.result.failed);
        assert!(evaluation.rejection.is_some());
        assert!(evaluation.transcript().len() <= 128);
    }

    #[tokio::test]
    async fn lists_capabilities_in_order() {
        let sandbox = Sandbox::new(SandboxConfig::default()).unwrap();
        let names = sandbox.capability_names();
        assert_eq!(names.first(), Some(&"print"));
        assert!(names.contains(&"ValueError"));
        assert!(!names.contains(&"open"));
    }
}
