//! The contract offered to the gateway: `execute` and `health`.
//!
//! Requests flow filter → admission → runner → assembler. Admission is a
//! semaphore sized to the concurrency ceiling plus a bounded wait queue; a
//! request's wall-clock budget starts when it arrives, so time spent queued
//! is time it no longer has to run.

use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{self, Instant};

use crate::assembler::{self, ExecutionResult};
use crate::config::{ExecutionLimits, SandboxConfig};
use crate::policy::{PolicyFilter, PolicyViolation};
use crate::runner::{ProcessRunner, Runner};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub input_data: Option<String>,
    /// Gateway override for this request only.
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
}

fn default_language() -> String {
    "python".into()
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        ExecutionRequest {
            code: code.into(),
            language: default_language(),
            input_data: None,
            limits: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input_data = Some(input.into());
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub language: String,
    pub limits: ExecutionLimits,
    pub max_concurrent_executions: usize,
    pub in_flight: usize,
}

pub struct Executor<R = ProcessRunner> {
    config: SandboxConfig,
    policy: PolicyFilter,
    runner: R,
    slots: Semaphore,
    queued: AtomicUsize,
}

impl Executor<ProcessRunner> {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let runner = ProcessRunner::from_config(&config);
        Ok(Self::with_runner(config, runner))
    }
}

impl<R: Runner> Executor<R> {
    pub fn with_runner(config: SandboxConfig, runner: R) -> Self {
        Executor {
            policy: PolicyFilter::from_config(&config),
            slots: Semaphore::new(config.max_concurrent_executions),
            queued: AtomicUsize::new(0),
            config,
            runner,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn check(&self, code: &str) -> Option<PolicyViolation> {
        self.policy.check(code)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".into(),
            language: self.config.language.clone(),
            limits: self.config.limits,
            max_concurrent_executions: self.config.max_concurrent_executions,
            in_flight: self
                .config
                .max_concurrent_executions
                .saturating_sub(self.slots.available_permits()),
        }
    }

    /// Limit breaches come back as `Ok` results with the matching outcome;
    /// `Err` is reserved for capacity, bad requests and internal failures.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let arrived = Instant::now();

        if !request.language.eq_ignore_ascii_case(&self.config.language) {
            return Err(Error::UnsupportedLanguage {
                requested: request.language.clone(),
                supported: self.config.language.clone(),
            });
        }

        let limits = match request.limits {
            Some(limits) => {
                limits.validate()?;
                limits
            }
            None => self.config.limits,
        };

        if let Some(violation) = self.policy.check(&request.code) {
            log::warn!("Rejected submission: {}", violation);
            return Ok(assembler::assemble(Some(&violation), None));
        }

        let deadline = arrived + limits.wall_time();
        let _permit = self.admit(arrived, deadline).await?;

        let outcome = self
            .runner
            .run(
                &request.code,
                request.input_data.as_deref(),
                &limits,
                deadline,
            )
            .await
            .map_err(|e| {
                log::error!("Execution failed: {}", e);
                e
            })?;

        log::info!(
            "Execution finished: {:?}, exit code {:?}, {} ms",
            outcome.status,
            outcome.exit_code,
            outcome.duration.as_millis()
        );

        Ok(assembler::assemble(None, Some(outcome)))
    }

    async fn admit(&self, arrived: Instant, deadline: Instant) -> Result<SemaphorePermit<'_>> {
        if let Ok(permit) = self.slots.try_acquire() {
            return Ok(permit);
        }

        let waiting = QueueSlot::enter(&self.queued);
        if waiting.position >= self.config.max_queued_executions {
            log::warn!(
                "Execution queue full ({} waiting), refusing request",
                waiting.position
            );
            return Err(Error::QueueFull {
                limit: self.config.max_queued_executions,
            });
        }

        match time::timeout_at(deadline, self.slots.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::ExecutorClosed),
            Err(_) => {
                log::warn!("Request spent its whole wall-clock budget queued");
                Err(Error::QueueTimedOut {
                    waited: arrived.elapsed(),
                })
            }
        }
    }
}

/// Counts a request as queued for as long as it is alive.
struct QueueSlot<'a> {
    counter: &'a AtomicUsize,
    position: usize,
}

impl<'a> QueueSlot<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let position = counter.fetch_add(1, Ordering::SeqCst);
        QueueSlot { counter, position }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
