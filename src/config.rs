//! Process-wide sandbox configuration.
//!
//! Loaded once at start: defaults, then an optional JSON file, then
//! `SANDBOX_*` environment overrides. Nothing is reloaded afterwards.

use serde_derive::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use crate::policy::{ForbiddenPattern, DEFAULT_DENYLIST};
use crate::{Error, Result};

pub const DEFAULT_MAX_CPU_SECONDS: u64 = 10;
pub const DEFAULT_MAX_WALL_SECONDS: u64 = 10;
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_PROCESSES: u64 = 64;

/// Ceilings applied to every worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionLimits {
    pub max_cpu_seconds: u64,
    pub max_wall_seconds: u64,
    pub max_memory_bytes: u64,
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits {
            max_cpu_seconds: DEFAULT_MAX_CPU_SECONDS,
            max_wall_seconds: DEFAULT_MAX_WALL_SECONDS,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ExecutionLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_cpu_seconds == 0
            || self.max_wall_seconds == 0
            || self.max_memory_bytes == 0
            || self.max_output_bytes == 0
        {
            return Err(Error::InvalidLimits {
                reason: "every limit must be greater than zero".into(),
            });
        }

        // The wall-clock timer must not fire before CPU accounting could.
        if self.max_wall_seconds < self.max_cpu_seconds {
            return Err(Error::InvalidLimits {
                reason: format!(
                    "maxWallSeconds ({}) is below maxCpuSeconds ({})",
                    self.max_wall_seconds, self.max_cpu_seconds
                ),
            });
        }

        Ok(())
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_secs(self.max_wall_seconds)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_secs(self.max_cpu_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub limits: ExecutionLimits,
    /// The one language this instance executes.
    pub language: String,
    pub interpreter: PathBuf,
    pub interpreter_args: Vec<String>,
    pub max_source_bytes: usize,
    pub max_concurrent_executions: usize,
    /// Requests allowed to wait for a free slot before new ones are refused.
    pub max_queued_executions: usize,
    /// `RLIMIT_NPROC` for the worker. Counted per user namespace when the
    /// namespace could be created, otherwise across the host user.
    pub max_processes: u64,
    pub forbidden: Vec<ForbiddenPattern>,
    /// Best effort: ignored when the host does not allow unprivileged namespaces.
    pub isolate_network: bool,
    pub echo_last_expression: bool,
    pub kill_grace_millis: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            limits: ExecutionLimits::default(),
            language: "python".into(),
            interpreter: PathBuf::from("python3"),
            // Isolated mode ignores PYTHON* variables and the user site dir.
            interpreter_args: vec!["-I".into(), "-B".into()],
            max_source_bytes: 64 * 1024,
            max_concurrent_executions: 8,
            max_queued_executions: 32,
            max_processes: DEFAULT_MAX_PROCESSES,
            forbidden: DEFAULT_DENYLIST.clone(),
            isolate_network: true,
            echo_last_expression: true,
            kill_grace_millis: 2000,
        }
    }
}

impl SandboxConfig {
    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;

        log::debug!("Loaded sandbox configuration: {:?}", config.limits);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| Error::UnableToReadConfig {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::UnableToParseConfig {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// `lookup` is `env::var` in production; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "SANDBOX_MAX_CPU_SECONDS")? {
            self.limits.max_cpu_seconds = v;
        }
        if let Some(v) = parse_env(&lookup, "SANDBOX_MAX_WALL_SECONDS")? {
            self.limits.max_wall_seconds = v;
        }
        if let Some(v) = parse_env(&lookup, "SANDBOX_MAX_MEMORY_BYTES")? {
            self.limits.max_memory_bytes = v;
        }
        if let Some(v) = parse_env(&lookup, "SANDBOX_MAX_OUTPUT_BYTES")? {
            self.limits.max_output_bytes = v;
        }
        if let Some(v) = parse_env(&lookup, "SANDBOX_MAX_CONCURRENT")? {
            self.max_concurrent_executions = v;
        }
        if let Some(v) = parse_env(&lookup, "SANDBOX_MAX_QUEUED")? {
            self.max_queued_executions = v;
        }
        if let Some(v) = parse_env(&lookup, "SANDBOX_MAX_PROCESSES")? {
            self.max_processes = v;
        }
        if let Some(v) = lookup("SANDBOX_INTERPRETER") {
            self.interpreter = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.max_concurrent_executions == 0 {
            return Err(Error::InvalidLimits {
                reason: "maxConcurrentExecutions must be greater than zero".into(),
            });
        }
        if self.max_processes == 0 {
            return Err(Error::InvalidLimits {
                reason: "maxProcesses must be greater than zero".into(),
            });
        }
        if self.max_source_bytes == 0 {
            return Err(Error::InvalidLimits {
                reason: "maxSourceBytes must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }
}

fn parse_env<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidEnvOverride { key, value: raw }),
    }
}
