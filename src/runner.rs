//! Resource-limited runner.
//!
//! Every execution gets a fresh scratch directory and one interpreter
//! process in its own process group. CPU time, address space, file size and
//! descriptor ceilings are installed by the kernel between `fork` and
//! `exec`, so they hold no matter what the interpreter does afterwards. A
//! wall-clock deadline catches programs that block without burning CPU.
//!
//! The worker is always killed (whole group) and reaped before
//! [`Runner::run`] returns, including on error paths. Descendants that left
//! the group are swept up by the [`reaper`](crate::reaper).

use nix::libc::rlim_t;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use std::{
    fs,
    future::Future,
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tempdir::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::{ExecutionLimits, SandboxConfig};
use crate::{echo, reaper, Error, Result};

const SOURCE_FILE_NAME: &str = "main.py";
const WORKER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_OPEN_FILES: rlim_t = 64;
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Bytes kept from the end of a stream, including bytes past the cap.
pub const TAIL_BYTES: usize = 4 * 1024;

const MEMORY_FAILURE_MARKERS: &[&str] = &["MemoryError", "Cannot allocate memory", "out of memory"];
/// Exit status of an interpreter that died of an uncaught exception.
const UNCAUGHT_EXCEPTION_EXIT: i32 = 1;

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Completed,
    /// The wall-clock deadline fired and the worker was killed.
    TimedOut,
    /// The kernel stopped the worker at its CPU-time ceiling.
    CpuLimitExceeded,
    MemoryExceeded,
}

/// One stream of worker output, capped at a byte limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    /// Everything the worker wrote, including bytes past the cap.
    pub total_bytes: u64,
    limit: usize,
    tail: Vec<u8>,
}

impl CapturedOutput {
    pub fn new(limit: usize) -> Self {
        CapturedOutput {
            limit,
            ..Default::default()
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;

        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..room.min(chunk.len())]);

        self.tail.extend_from_slice(chunk);
        if self.tail.len() > TAIL_BYTES {
            let excess = self.tail.len() - TAIL_BYTES;
            self.tail.drain(..excess);
        }
    }

    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOutcome {
    pub status: RunnerStatus,
    /// `None` when the worker was terminated by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
}

pub trait Runner: Send + Sync {
    /// Runs `code` once and returns only after the worker has been reaped.
    /// `deadline` is the absolute wall-clock cut-off for this request.
    fn run<'a>(
        &'a self,
        code: &'a str,
        input: Option<&'a str>,
        limits: &'a ExecutionLimits,
        deadline: Instant,
    ) -> impl Future<Output = Result<RunnerOutcome>> + Send + 'a;
}

/// Runs code in a freshly spawned interpreter process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    interpreter: PathBuf,
    interpreter_args: Vec<String>,
    isolate_network: bool,
    echo_last_expression: bool,
    kill_grace: Duration,
    max_processes: u64,
}

impl ProcessRunner {
    pub fn from_config(config: &SandboxConfig) -> Self {
        ProcessRunner {
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            isolate_network: config.isolate_network,
            echo_last_expression: config.echo_last_expression,
            kill_grace: config.kill_grace(),
            max_processes: config.max_processes,
        }
    }

    /// Whether the configured interpreter can be started at all.
    pub async fn is_available(&self) -> bool {
        let mut version_check = Command::new(&self.interpreter);
        version_check
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match reaper::spawn(&mut version_check) {
            Ok((mut child, _tracked)) => child
                .wait()
                .await
                .map(|status| status.success())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn execute(
        &self,
        code: &str,
        input: Option<&str>,
        limits: &ExecutionLimits,
        deadline: Instant,
    ) -> Result<RunnerOutcome> {
        let source = if self.echo_last_expression {
            echo::prepare(code)
        } else {
            code.to_string()
        };
        let workspace = Workspace::new(&source)?;
        let mut command = self.worker_command(&workspace, limits, input.is_some());

        log::debug!("Execution command is {:?}", command);

        let started = Instant::now();
        let (mut child, _tracked) = reaper::spawn(&mut command)
            .map_err(|e| Error::UnableToStartInterpreter { source: e })?;
        let group = ProcessGroup::of(child.id());

        let feeder = match (child.stdin.take(), input) {
            (Some(mut stdin), Some(data)) => {
                let data = data.as_bytes().to_vec();
                Some(tokio::spawn(async move {
                    // A worker that never reads its input closes the pipe on exit.
                    if let Err(e) = stdin.write_all(&data).await {
                        log::debug!("Worker stdin closed early: {}", e);
                    }
                    let _ = stdin.shutdown().await;
                }))
            }
            _ => None,
        };

        let stdout = child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, limits.max_output_bytes));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, limits.max_output_bytes));

        let (status, timed_out) = match time::timeout_at(deadline, child.wait()).await {
            Ok(status) => (
                status.map_err(|e| Error::UnableToWaitForWorker { source: e })?,
                false,
            ),
            Err(_) => {
                log::debug!("Wall-clock deadline reached, killing worker");
                group.kill();
                let _ = child.start_kill();

                let status = time::timeout(self.kill_grace, child.wait())
                    .await
                    .map_err(|_| Error::WorkerNotTerminated {
                        grace: self.kill_grace,
                    })?
                    .map_err(|e| Error::UnableToWaitForWorker { source: e })?;
                (status, true)
            }
        };
        let duration = started.elapsed();

        // Sweep anything the worker left behind so the pipes close: first its
        // group, then descendants that escaped the group.
        group.kill();
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        self.sweep_strays().await?;

        let stdout = collect("stdout", stdout, limits.max_output_bytes, self.kill_grace).await?;
        let stderr = collect("stderr", stderr, limits.max_output_bytes, self.kill_grace).await?;

        let status_kind = classify(status, timed_out, duration, limits.cpu_time(), &stderr);

        Ok(RunnerOutcome {
            status: status_kind,
            exit_code: status.code(),
            signal: status.signal(),
            stdout,
            stderr,
            duration,
        })
    }

    async fn sweep_strays(&self) -> Result<()> {
        let grace = self.kill_grace;
        let swept = tokio::task::spawn_blocking(move || reaper::sweep(grace))
            .await
            .map_err(|e| Error::ReaperFailed { source: e })??;
        if swept > 0 {
            log::warn!("Killed {} process(es) that escaped the worker's group", swept);
        }
        Ok(())
    }

    fn ceilings(&self, limits: &ExecutionLimits) -> Ceilings {
        Ceilings {
            cpu_seconds: limits.max_cpu_seconds as rlim_t,
            memory_bytes: limits.max_memory_bytes as rlim_t,
            file_bytes: limits.max_output_bytes as rlim_t,
            processes: self.max_processes as rlim_t,
            isolate_network: self.isolate_network,
        }
    }

    fn worker_command(
        &self,
        workspace: &Workspace,
        limits: &ExecutionLimits,
        has_input: bool,
    ) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.interpreter_args)
            .arg(&workspace.source_file)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", WORKER_PATH)
            .env("LANG", "C.UTF-8")
            .env("HOME", workspace.path())
            .stdin(if has_input {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let ceilings = self.ceilings(limits);
        // Only async-signal-safe syscalls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || ceilings.install());
        }

        cmd
    }
}

impl Runner for ProcessRunner {
    fn run<'a>(
        &'a self,
        code: &'a str,
        input: Option<&'a str>,
        limits: &'a ExecutionLimits,
        deadline: Instant,
    ) -> impl Future<Output = Result<RunnerOutcome>> + Send + 'a {
        self.execute(code, input, limits, deadline)
    }
}

/// Scratch directory holding the program; removed when dropped.
struct Workspace {
    scratch: TempDir,
    source_file: PathBuf,
}

impl Workspace {
    fn new(source: &str) -> Result<Self> {
        let scratch =
            TempDir::new("code-sandbox").map_err(|e| Error::UnableToCreateTempDir { source: e })?;
        let source_file = scratch.path().join(SOURCE_FILE_NAME);

        fs::write(&source_file, source)
            .map_err(|e| Error::UnableToCreateSourceFile { source: e })?;
        fs::set_permissions(&source_file, read_only_permissions())
            .map_err(|e| Error::UnableToSetSourcePermissions { source: e })?;

        log::debug!(
            "Wrote {} bytes of source to {}",
            source.len(),
            source_file.display()
        );

        Ok(Workspace {
            scratch,
            source_file,
        })
    }

    fn path(&self) -> &Path {
        self.scratch.path()
    }
}

fn read_only_permissions() -> fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    fs::Permissions::from_mode(0o444)
}

/// Resource ceilings applied inside the forked child.
#[derive(Debug, Clone, Copy)]
struct Ceilings {
    cpu_seconds: rlim_t,
    memory_bytes: rlim_t,
    file_bytes: rlim_t,
    processes: rlim_t,
    isolate_network: bool,
}

impl Ceilings {
    fn install(&self) -> io::Result<()> {
        // New session and process group: the whole tree can be killed at once.
        setsid()?;

        #[cfg(target_os = "linux")]
        {
            use nix::sched::{unshare, CloneFlags};

            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;

            if self.isolate_network {
                // Hosts without unprivileged user namespaces keep the network.
                let _ = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET);
            }
        }

        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_bytes, self.file_bytes)?;
        // After unshare, so a new user namespace counts only its own processes.
        setrlimit(Resource::RLIMIT_NPROC, self.processes, self.processes)?;
        // SIGXCPU at the soft limit, SIGKILL one second later.
        setrlimit(
            Resource::RLIMIT_CPU,
            self.cpu_seconds,
            self.cpu_seconds.saturating_add(1),
        )?;
        setrlimit(Resource::RLIMIT_AS, self.memory_bytes, self.memory_bytes)?;

        Ok(())
    }
}

/// The worker's process group. Killed explicitly on every exit path and
/// again on drop.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(pid: Option<u32>) -> Self {
        ProcessGroup(pid.map(|pid| Pid::from_raw(pid as i32)))
    }

    fn kill(&self) {
        if let Some(pgid) = self.0 {
            // ESRCH just means the group is already gone.
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

type Reader = JoinHandle<io::Result<CapturedOutput>>;

fn spawn_reader<R>(pipe: R, limit: usize) -> Reader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(drain(pipe, limit))
}

/// Reads to EOF. Bytes past the cap are discarded but still read, so the
/// worker never stalls on a full pipe.
async fn drain<R>(mut pipe: R, limit: usize) -> io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedOutput::new(limit);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(captured);
        }
        captured.push(&chunk[..n]);
    }
}

async fn collect(
    stream: &'static str,
    reader: Option<Reader>,
    limit: usize,
    grace: Duration,
) -> Result<CapturedOutput> {
    let mut reader = match reader {
        Some(reader) => reader,
        None => return Ok(CapturedOutput::new(limit)),
    };

    match time::timeout(grace, &mut reader).await {
        Ok(joined) => joined
            .map_err(|e| Error::OutputReaderFailed { source: e })?
            .map_err(|e| Error::UnableToReadOutput { stream, source: e }),
        Err(_) => {
            // Something outside the worker's group still holds the pipe.
            reader.abort();
            Err(Error::OutputStillOpen { stream, grace })
        }
    }
}

fn classify(
    status: ExitStatus,
    timed_out: bool,
    elapsed: Duration,
    cpu_budget: Duration,
    stderr: &CapturedOutput,
) -> RunnerStatus {
    if timed_out {
        return RunnerStatus::TimedOut;
    }

    let signal = status.signal();
    if signal == Some(Signal::SIGXCPU as i32) {
        return RunnerStatus::CpuLimitExceeded;
    }

    if died_of_memory_failure(status, stderr.tail()) {
        return RunnerStatus::MemoryExceeded;
    }

    // We did not send this SIGKILL: either the CPU hard limit or the
    // kernel's OOM killer did.
    if signal == Some(Signal::SIGKILL as i32) {
        return if elapsed >= cpu_budget {
            RunnerStatus::CpuLimitExceeded
        } else {
            RunnerStatus::MemoryExceeded
        };
    }

    RunnerStatus::Completed
}

/// An uncaught exception whose final traceback line names a memory
/// failure, or an abort with an allocation message anywhere in the tail.
fn died_of_memory_failure(status: ExitStatus, tail: &[u8]) -> bool {
    let text = String::from_utf8_lossy(tail);
    let mentions = |text: &str| MEMORY_FAILURE_MARKERS.iter().any(|m| text.contains(m));

    if status.code() == Some(UNCAUGHT_EXCEPTION_EXIT) {
        let last_line = text.lines().rev().find(|line| !line.trim().is_empty());
        return last_line.map_or(false, mentions);
    }
    status.signal() == Some(Signal::SIGABRT as i32) && mentions(&*text)
}

/// Human-readable cause for a worker killed by a signal we did not send.
pub fn describe_signal(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(Signal::SIGXFSZ) => "Terminated by SIGXFSZ: file size limit exceeded".into(),
        Ok(sig) => format!("Terminated by {}", sig.as_str()),
        Err(_) => format!("Terminated by signal {}", signal),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signalled(signal: Signal) -> ExitStatus {
        ExitStatus::from_raw(signal as i32)
    }

    fn stderr_with(text: &str) -> CapturedOutput {
        let mut captured = CapturedOutput::new(1024);
        captured.push(text.as_bytes());
        captured
    }

    const SECOND: Duration = Duration::from_secs(1);
    const BUDGET: Duration = Duration::from_secs(10);

    #[test]
    fn capture_stops_copying_at_limit() {
        let mut captured = CapturedOutput::new(8);
        captured.push(b"hello ");
        captured.push(b"world");
        captured.push(b"!!!");

        assert_eq!(captured.bytes, b"hello wo");
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 14);
        assert_eq!(captured.tail(), b"hello world!!!");
    }

    #[test]
    fn capture_exactly_at_limit_is_not_truncated() {
        let mut captured = CapturedOutput::new(5);
        captured.push(b"hello");
        assert!(!captured.truncated);
        captured.push(b"");
        assert!(!captured.truncated);
    }

    #[test]
    fn tail_keeps_only_the_end() {
        let mut captured = CapturedOutput::new(16);
        captured.push(&vec![b'a'; TAIL_BYTES]);
        captured.push(b"MemoryError");

        assert_eq!(captured.tail().len(), TAIL_BYTES);
        assert!(captured.tail().ends_with(b"MemoryError"));
        assert_eq!(captured.bytes.len(), 16);
    }

    #[test]
    fn clean_exit_is_completed() {
        let status = classify(exited(0), false, SECOND, BUDGET, &stderr_with(""));
        assert_eq!(status, RunnerStatus::Completed);

        let status = classify(exited(1), false, SECOND, BUDGET, &stderr_with("ValueError"));
        assert_eq!(status, RunnerStatus::Completed);
    }

    #[test]
    fn deadline_wins_over_everything() {
        let status = classify(
            signalled(Signal::SIGKILL),
            true,
            SECOND,
            BUDGET,
            &stderr_with("MemoryError"),
        );
        assert_eq!(status, RunnerStatus::TimedOut);
    }

    #[test]
    fn sigxcpu_is_cpu_limit() {
        let status = classify(signalled(Signal::SIGXCPU), false, BUDGET, BUDGET, &stderr_with(""));
        assert_eq!(status, RunnerStatus::CpuLimitExceeded);
    }

    #[test]
    fn memory_error_traceback_is_memory_exceeded() {
        let stderr = stderr_with("Traceback (most recent call last):\nMemoryError\n");
        let status = classify(exited(1), false, SECOND, BUDGET, &stderr);
        assert_eq!(status, RunnerStatus::MemoryExceeded);
    }

    #[test]
    fn memory_marker_needs_a_real_failure() {
        // Printed by the program itself, then a clean or custom exit.
        let stderr = stderr_with("MemoryError\n");
        assert_eq!(
            classify(exited(0), false, SECOND, BUDGET, &stderr),
            RunnerStatus::Completed
        );
        assert_eq!(
            classify(exited(3), false, SECOND, BUDGET, &stderr),
            RunnerStatus::Completed
        );

        // Mentioned earlier, but the traceback ends in something else.
        let stderr = stderr_with("MemoryError: fake\nTraceback (most recent call last):\nValueError: boom\n");
        assert_eq!(
            classify(exited(1), false, SECOND, BUDGET, &stderr),
            RunnerStatus::Completed
        );

        let stderr = stderr_with("Fatal Python error: out of memory\nCurrent thread 0x1:\n");
        assert_eq!(
            classify(signalled(Signal::SIGABRT), false, SECOND, BUDGET, &stderr),
            RunnerStatus::MemoryExceeded
        );
    }

    #[test]
    fn other_signals_are_completed_with_a_cause() {
        let status = classify(signalled(Signal::SIGSEGV), false, SECOND, BUDGET, &stderr_with(""));
        assert_eq!(status, RunnerStatus::Completed);
        assert_eq!(describe_signal(Signal::SIGSEGV as i32), "Terminated by SIGSEGV");
        assert!(describe_signal(Signal::SIGXFSZ as i32).contains("file size limit"));
        assert_eq!(describe_signal(999), "Terminated by signal 999");
    }

    #[test]
    fn unexplained_sigkill_is_memory_before_cpu_budget() {
        let status = classify(signalled(Signal::SIGKILL), false, SECOND, BUDGET, &stderr_with(""));
        assert_eq!(status, RunnerStatus::MemoryExceeded);

        let status = classify(
            signalled(Signal::SIGKILL),
            false,
            BUDGET + SECOND,
            BUDGET,
            &stderr_with(""),
        );
        assert_eq!(status, RunnerStatus::CpuLimitExceeded);
    }

    #[test]
    fn ceilings_follow_limits() {
        let config = SandboxConfig {
            max_processes: 16,
            isolate_network: false,
            ..Default::default()
        };
        let runner = ProcessRunner::from_config(&config);
        let ceilings = runner.ceilings(&ExecutionLimits::default());
        assert_eq!(ceilings.cpu_seconds, 10);
        assert_eq!(ceilings.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(ceilings.file_bytes, 1024 * 1024);
        assert_eq!(ceilings.processes, 16);
        assert!(!ceilings.isolate_network);

        let defaults = ProcessRunner::from_config(&SandboxConfig::default());
        assert_eq!(
            defaults.ceilings(&ExecutionLimits::default()).processes,
            crate::config::DEFAULT_MAX_PROCESSES as rlim_t
        );
    }

    #[test]
    fn workspace_holds_read_only_source() {
        use std::os::unix::fs::PermissionsExt;

        let workspace = Workspace::new("print(1)\n").expect("workspace");
        let written = fs::read_to_string(&workspace.source_file).expect("source");
        assert_eq!(written, "print(1)\n");

        let mode = fs::metadata(&workspace.source_file)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o444);

        let dir = workspace.path().to_path_buf();
        drop(workspace);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let config = SandboxConfig {
            interpreter: PathBuf::from("/nonexistent/interpreter"),
            ..Default::default()
        };
        let runner = ProcessRunner::from_config(&config);
        let limits = ExecutionLimits::default();
        let deadline = Instant::now() + limits.wall_time();

        assert!(!runner.is_available().await);
        let err = runner.run("print(1)", None, &limits, deadline).await.unwrap_err();
        assert!(matches!(err, Error::UnableToStartInterpreter { .. }));
        assert!(err.is_internal());
    }
}
