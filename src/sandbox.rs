use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::resources::{self, ExecutionTracker, ResourceLimits};
use crate::runtime::{CommandSpec, ExecutionResult, LanguageRunner};

// Idle tick for opportunistic memory sampling while waiting on output.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(25);
// Compilers write real artifacts, so they get a roomier file size cap.
const COMPILER_MAX_FILE_BYTES: u64 = 256 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Rate limit exceeded for '{0}', try again later")]
    RateLimitExceeded(String),

    #[error("Compilation error: {0}")]
    CompilationError(String),

    #[error("Execution timed out after {0} ms")]
    Timeout(u64),

    #[error("Output limit exceeded: program wrote more than {0} bytes")]
    OutputLimitExceeded(usize),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Gave up after waiting {0} ms for an execution slot")]
    QueueTimeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure classification handed back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    SecurityViolation,
    UnsupportedLanguage,
    RateLimitExceeded,
    CompilationError,
    ExecutionTimeout,
    OutputLimitExceeded,
    QueueTimeout,
    RuntimeError,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Validation(_) => ErrorKind::ValidationError,
            SandboxError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            SandboxError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            SandboxError::RateLimitExceeded(_) => ErrorKind::RateLimitExceeded,
            SandboxError::CompilationError(_) => ErrorKind::CompilationError,
            SandboxError::Timeout(_) => ErrorKind::ExecutionTimeout,
            SandboxError::OutputLimitExceeded(_) => ErrorKind::OutputLimitExceeded,
            SandboxError::QueueTimeout(_) => ErrorKind::QueueTimeout,
            SandboxError::RuntimeError(_) | SandboxError::Io(_) => ErrorKind::RuntimeError,
        }
    }

    /// Admission errors are raised before any slot, file, or process is allocated.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ValidationError
                | ErrorKind::SecurityViolation
                | ErrorKind::UnsupportedLanguage
                | ErrorKind::RateLimitExceeded
        )
    }
}

/// Size and time caps enforced by the sandbox itself.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_code_bytes: usize,
    pub max_output_bytes: usize,
    pub max_stderr_bytes: usize,
    pub compile_timeout: Duration,
    pub cpu_slack_s: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_code_bytes: 64 * 1024,
            max_output_bytes: 1024 * 1024,
            max_stderr_bytes: 64 * 1024,
            compile_timeout: Duration::from_secs(15),
            cpu_slack_s: 1,
        }
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone)]
pub struct ProgramOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

enum Capture {
    Exited(ExitStatus, Vec<u8>),
    Overflow,
}

/// Spawns submissions inside a confined scratch directory.
pub struct Sandbox {
    scratch_dir: PathBuf,
    limits: SandboxLimits,
    spawned: AtomicU64,
}

impl Sandbox {
    pub fn new(scratch_dir: impl Into<PathBuf>, limits: SandboxLimits) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            limits,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Number of OS processes started so far (compilers included).
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Cheap pre-spawn checks: size validation and the security filter.
    pub fn admit(&self, runner: &dyn LanguageRunner, code: &str) -> Result<(), SandboxError> {
        if code.trim().is_empty() {
            return Err(SandboxError::Validation("Code must not be empty".to_string()));
        }
        if code.len() > self.limits.max_code_bytes {
            return Err(SandboxError::Validation(format!(
                "Code is {} bytes, maximum allowed is {} bytes",
                code.len(),
                self.limits.max_code_bytes
            )));
        }
        runner.lint_code(code)
    }

    /// Runs a submission end to end and always returns a populated result.
    pub async fn execute(
        &self,
        runner: &dyn LanguageRunner,
        code: &str,
        stdin: Option<&str>,
        time_limit: Duration,
        tracker: &mut ExecutionTracker,
    ) -> ExecutionResult {
        match self.run(runner, code, stdin, time_limit, tracker).await {
            Ok(output) if output.exit_code == 0 => {
                ExecutionResult::completed(output.stdout, output.stderr, 0, tracker.stats())
            }
            Ok(output) => {
                let error = SandboxError::RuntimeError(describe_exit(&output));
                ExecutionResult::failed_with_output(
                    &error,
                    output.stdout,
                    output.stderr,
                    Some(output.exit_code),
                    tracker.stats(),
                )
            }
            Err(e) => {
                debug!(language = %runner.language(), "Execution failed: {}", e);
                ExecutionResult::failed(&e, tracker.stats())
            }
        }
    }

    async fn run(
        &self,
        runner: &dyn LanguageRunner,
        code: &str,
        stdin: Option<&str>,
        time_limit: Duration,
        tracker: &mut ExecutionTracker,
    ) -> Result<ProgramOutput, SandboxError> {
        self.admit(runner, code)?;

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        // Dropping the TempDir removes the source and any compiled artifact, on every path.
        let workspace = tempfile::Builder::new()
            .prefix(&format!("{}-", runner.language()))
            .tempdir_in(&self.scratch_dir)?;
        let workdir = workspace.path();
        let source_path = workdir.join(runner.source_file_name(code));
        tokio::fs::write(&source_path, runner.wrap(code)).await?;

        if let Some(compile) = runner.compile_command(&source_path, workdir) {
            let limits = ResourceLimits::for_time_limit(
                self.limits.compile_timeout,
                self.limits.cpu_slack_s,
                COMPILER_MAX_FILE_BYTES,
            );
            let compiled = self
                .run_process(&compile, workdir, None, self.limits.compile_timeout, limits, tracker)
                .await
                .map_err(|e| match e {
                    SandboxError::Timeout(ms) => {
                        SandboxError::CompilationError(format!("compiler timed out after {} ms", ms))
                    }
                    other => other,
                })?;
            if compiled.exit_code != 0 {
                return Err(SandboxError::CompilationError(compiler_message(&compiled)));
            }
        }

        let run = runner.run_command(&source_path, workdir);
        let limits = ResourceLimits::for_time_limit(
            time_limit,
            self.limits.cpu_slack_s,
            self.limits.max_output_bytes as u64,
        );
        let result = self
            .run_process(&run, workdir, stdin, time_limit, limits, tracker)
            .await;

        if let Err(e) = workspace.close() {
            warn!("Failed to remove scratch directory: {}", e);
        }
        result
    }

    async fn run_process(
        &self,
        spec: &CommandSpec,
        workdir: &Path,
        stdin: Option<&str>,
        time_limit: Duration,
        limits: ResourceLimits,
        tracker: &mut ExecutionTracker,
    ) -> Result<ProgramOutput, SandboxError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(workdir)
            .env_clear()
            .env("HOME", workdir)
            .env("LANG", "C.UTF-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        #[cfg(unix)]
        {
            // Own process group, so a timeout can take down everything the program forked.
            command.process_group(0);
            unsafe {
                command.pre_exec(move || resources::apply_resource_limits(&limits));
            }
        }
        #[cfg(not(unix))]
        let _ = limits;

        self.spawned.fetch_add(1, Ordering::SeqCst);
        let mut child = command.spawn().map_err(|e| {
            SandboxError::RuntimeError(format!("Failed to start {}: {}", spec.program, e))
        })?;
        let pid = child.id();
        debug!(program = %spec.program, pid = ?pid, "Spawned sandboxed process");
        tracker.sample(pid);

        if let (Some(mut pipe), Some(payload)) = (child.stdin.take(), stdin) {
            let payload = payload.as_bytes().to_vec();
            tokio::spawn(async move {
                // A program that never reads stdin closes the pipe early; that is fine.
                let _ = pipe.write_all(&payload).await;
                let _ = pipe.shutdown().await;
            });
        }

        let stderr_task = child.stderr.take().map(|pipe| {
            let cap = self.limits.max_stderr_bytes;
            tokio::spawn(read_truncated(pipe, cap))
        });
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::RuntimeError("stdout was not captured".to_string()))?;

        let max_output = self.limits.max_output_bytes;
        let deadline = Instant::now() + time_limit;
        let capture = timeout_at(deadline, async {
            let mut collected = Vec::new();
            let mut chunk = [0u8; READ_CHUNK];
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    read = stdout.read(&mut chunk) => {
                        let n = read?;
                        if n == 0 {
                            break;
                        }
                        if collected.len() + n > max_output {
                            return Ok(Capture::Overflow);
                        }
                        collected.extend_from_slice(&chunk[..n]);
                        tracker.sample(pid);
                    }
                    _ = ticker.tick() => {
                        tracker.sample(pid);
                    }
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>(Capture::Exited(status, collected))
        })
        .await;

        let (status, collected) = match capture {
            Ok(Ok(Capture::Exited(status, collected))) => (status, collected),
            Ok(Ok(Capture::Overflow)) => {
                warn!(program = %spec.program, "Output limit of {} bytes exceeded", max_output);
                terminate(&mut child, pid).await;
                abort_task(stderr_task);
                return Err(SandboxError::OutputLimitExceeded(max_output));
            }
            Ok(Err(e)) => {
                terminate(&mut child, pid).await;
                abort_task(stderr_task);
                return Err(SandboxError::Io(e));
            }
            Err(_) => {
                let limit_ms = time_limit.as_millis() as u64;
                warn!(program = %spec.program, "Execution timed out after {} ms", limit_ms);
                terminate(&mut child, pid).await;
                abort_task(stderr_task);
                return Err(SandboxError::Timeout(limit_ms));
            }
        };

        // The direct child is gone; anything it left running in its group goes with it.
        kill_group(pid);

        let stderr = match stderr_task {
            Some(mut task) => {
                let joined = timeout_at(deadline, &mut task).await;
                match joined {
                    Ok(joined) => joined.unwrap_or_default(),
                    Err(_) => {
                        warn!(program = %spec.program, "stderr still held open at the time limit, discarding it");
                        task.abort();
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        if let Some(signal) = termination_signal(&status) {
            // Hitting RLIMIT_CPU is a timeout that the kernel enforced for us.
            if is_cpu_limit_signal(signal) {
                return Err(SandboxError::Timeout(time_limit.as_millis() as u64));
            }
            info!(program = %spec.program, "Process terminated by signal {}", signal);
        }

        Ok(ProgramOutput {
            stdout: String::from_utf8_lossy(&collected).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Reads a pipe to the end, keeping at most `cap` bytes so the child never blocks on a full pipe.
async fn read_truncated<R: AsyncRead + Unpin>(mut pipe: R, cap: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

fn abort_task<T>(task: Option<tokio::task::JoinHandle<T>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Kills the whole process group, then reaps the direct child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    let _ = child.kill().await;
}

/// SIGKILLs the process group led by `pid`. A group that is already empty is not an error.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                warn!("Failed to kill process group {}: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn is_cpu_limit_signal(signal: i32) -> bool {
    signal == libc::SIGXCPU
}

#[cfg(not(unix))]
fn is_cpu_limit_signal(_signal: i32) -> bool {
    false
}

fn describe_exit(output: &ProgramOutput) -> String {
    let tail = last_lines(&output.stderr, 10);
    if tail.is_empty() {
        format!("Process exited with code {}", output.exit_code)
    } else {
        format!("Process exited with code {}: {}", output.exit_code, tail)
    }
}

fn compiler_message(output: &ProgramOutput) -> String {
    let diagnostics = if output.stderr.trim().is_empty() {
        &output.stdout
    } else {
        &output.stderr
    };
    let tail = last_lines(diagnostics, 20);
    if tail.is_empty() {
        format!("compiler exited with code {}", output.exit_code)
    } else {
        tail
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
