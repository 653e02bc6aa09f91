//! Result assembly: a pure merge of the policy verdict and the runner
//! outcome into the record handed back to callers.

use serde_derive::{Deserialize, Serialize};

use crate::policy::PolicyViolation;
use crate::runner::{self, RunnerOutcome, RunnerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Completed,
    TimedOut,
    MemoryExceeded,
    RejectedByPolicy,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Set when either stream hit the output ceiling.
    pub truncated: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// `None` when the worker was killed or never ran.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn empty(outcome: Outcome, reason: String) -> Self {
        ExecutionResult {
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            signal: None,
            outcome,
            reason: Some(reason),
            duration_ms: 0,
        }
    }

    pub fn rejected(violation: &PolicyViolation) -> Self {
        Self::empty(Outcome::RejectedByPolicy, violation.reason())
    }

    /// Body for an internal failure. Never reports `completed`.
    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::empty(Outcome::InternalError, reason.into())
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed && self.exit_code == Some(0)
    }
}

pub fn assemble(
    violation: Option<&PolicyViolation>,
    outcome: Option<RunnerOutcome>,
) -> ExecutionResult {
    if let Some(violation) = violation {
        return ExecutionResult::rejected(violation);
    }

    let outcome = match outcome {
        Some(outcome) => outcome,
        None => return ExecutionResult::internal_error("Runner produced no outcome"),
    };

    let (kind, reason) = match outcome.status {
        RunnerStatus::Completed => (
            Outcome::Completed,
            outcome.signal.map(runner::describe_signal),
        ),
        RunnerStatus::TimedOut => (
            Outcome::TimedOut,
            Some("Execution timeout: code exceeded the wall-clock limit".into()),
        ),
        RunnerStatus::CpuLimitExceeded => (
            Outcome::TimedOut,
            Some("Execution timeout: code exceeded the CPU time limit".into()),
        ),
        RunnerStatus::MemoryExceeded => (
            Outcome::MemoryExceeded,
            Some("Memory limit exceeded".into()),
        ),
    };

    ExecutionResult {
        stdout: outcome.stdout.to_string_lossy(),
        stderr: outcome.stderr.to_string_lossy(),
        truncated: outcome.stdout.truncated || outcome.stderr.truncated,
        stdout_truncated: outcome.stdout.truncated,
        stderr_truncated: outcome.stderr.truncated,
        exit_code: outcome.exit_code,
        signal: outcome.signal,
        outcome: kind,
        reason,
        duration_ms: outcome.duration.as_millis() as u64,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::Category;
    use crate::runner::CapturedOutput;
    use std::time::Duration;

    fn captured(text: &str, limit: usize) -> CapturedOutput {
        let mut captured = CapturedOutput::new(limit);
        captured.push(text.as_bytes());
        captured
    }

    fn outcome(status: RunnerStatus) -> RunnerOutcome {
        RunnerOutcome {
            status,
            exit_code: Some(0),
            signal: None,
            stdout: captured("Hello, World!\n", 1024),
            stderr: captured("", 1024),
            duration: Duration::from_millis(42),
        }
    }

    #[test]
    fn violation_short_circuits_runner_outcome() {
        let violation = PolicyViolation::ForbiddenToken {
            token: "os.system".into(),
            category: Category::ProcessSpawn,
            offset: 11,
            line: 1,
            column: 12,
        };
        let result = assemble(Some(&violation), Some(outcome(RunnerStatus::Completed)));

        assert_eq!(result.outcome, Outcome::RejectedByPolicy);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, None);
        assert_eq!(result.duration_ms, 0);
        assert!(result.reason.unwrap_or_default().contains("os.system"));
    }

    #[test]
    fn completed_outcome_is_copied_verbatim() {
        let result = assemble(None, Some(outcome(RunnerStatus::Completed)));

        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "Hello, World!\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.duration_ms, 42);
        assert_eq!(result.reason, None);
        assert!(!result.truncated);
        assert!(result.is_success());
    }

    #[test]
    fn limit_outcomes_map_to_result_tags() {
        let cases = [
            (RunnerStatus::TimedOut, Outcome::TimedOut),
            (RunnerStatus::CpuLimitExceeded, Outcome::TimedOut),
            (RunnerStatus::MemoryExceeded, Outcome::MemoryExceeded),
        ];
        for (status, expected) in cases.iter() {
            let mut killed = outcome(*status);
            killed.exit_code = None;
            killed.signal = Some(9);

            let result = assemble(None, Some(killed));
            assert_eq!(result.outcome, *expected);
            assert_eq!(result.exit_code, None);
            assert_eq!(result.signal, Some(9));
            assert!(result.reason.is_some());
            assert!(!result.is_success());
        }
    }

    #[test]
    fn signal_death_is_completed_with_its_cause() {
        let mut crashed = outcome(RunnerStatus::Completed);
        crashed.exit_code = None;
        crashed.signal = Some(11);

        let result = assemble(None, Some(crashed));
        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.signal, Some(11));
        assert_eq!(result.reason.as_deref(), Some("Terminated by SIGSEGV"));
        assert!(!result.is_success());
    }

    #[test]
    fn truncation_flags_are_per_stream() {
        let mut noisy = outcome(RunnerStatus::Completed);
        noisy.stderr = captured("0123456789", 4);

        let result = assemble(None, Some(noisy));
        assert!(result.truncated);
        assert!(result.stderr_truncated);
        assert!(!result.stdout_truncated);
        assert_eq!(result.stderr, "0123");
    }

    #[test]
    fn missing_outcome_is_never_completed() {
        let result = assemble(None, None);
        assert_eq!(result.outcome, Outcome::InternalError);
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let result = assemble(None, Some(outcome(RunnerStatus::TimedOut)));
        let json = serde_json::to_value(&result).expect("serializable");

        assert_eq!(json["outcome"], "timedOut");
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["durationMs"], 42);
        assert_eq!(json["truncated"], false);
    }
}
