/// Execution Engine - Abstraction for Code Execution
///
/// **Core Responsibility:**
/// Run source code against a stdin under a hard wall-clock limit and hand
/// back raw stdout/stderr/exit status.
///
/// **Architectural Boundary:**
/// - Engine knows HOW to execute (child process, container)
/// - Engine does NOT compare outputs; the evaluator does
/// - Output is captured verbatim, never trimmed
///
/// Every run is a fresh process group in a fresh directory. Compiled
/// languages compile once per program; each run gets its own copy of the
/// artifacts.

use async_trait::async_trait;
use caseforge_common::types::{ExecutionStatus, SourceCode};
use caseforge_common::{LanguageSpec, LanguageTable};
use nix::libc::rlim_t;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Safety limits to keep pathological inputs away from the engines
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
/// Per stream; a run printing more is killed
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024; // 16MB

/// Largest file a program may write into its working directory
const MAX_FILE_BYTES: u64 = 256 * 1024 * 1024; // 256MB

/// How long pipes may keep draining once the process group is dead
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Raw result of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the process was killed or died from a signal
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// Killed for writing more than `MAX_OUTPUT_BYTES` to one stream
    pub output_limit_exceeded: bool,
}

impl RunOutput {
    pub fn status(&self) -> ExecutionStatus {
        if self.timed_out {
            ExecutionStatus::Timeout
        } else if self.exit_code == Some(0) && !self.output_limit_exceeded {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::RuntimeError
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status() == ExecutionStatus::Success
    }

    pub(crate) fn timed_out_after(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            timed_out: true,
            ..Default::default()
        }
    }
}

/// Append `chunk` to `buf` up to `MAX_OUTPUT_BYTES`; false once the limit
/// was crossed
pub(crate) fn append_capped(buf: &mut Vec<u8>, chunk: &[u8]) -> bool {
    let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
    if chunk.len() > room {
        buf.extend_from_slice(&chunk[..room]);
        return false;
    }
    buf.extend_from_slice(chunk);
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    pub message: String,
    pub timed_out: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("source code exceeds maximum size of {limit} bytes")]
    SourceTooLarge { limit: usize },
    #[error("input exceeds maximum size of {limit} bytes")]
    InputTooLarge { limit: usize },
    /// The sandbox itself broke (spawn failed, daemon unreachable); says
    /// nothing about the program under test
    #[error("sandbox failure: {0}")]
    Infrastructure(String),
}

impl SandboxError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SandboxError::Infrastructure(_))
    }
}

/// Compiled artifact handle. Dropping the last clone removes the working
/// directory.
#[derive(Debug, Clone)]
pub struct Program {
    pub spec: LanguageSpec,
    workdir: Arc<TempDir>,
}

impl Program {
    pub(crate) fn new(spec: LanguageSpec, workdir: TempDir) -> Self {
        Self {
            spec,
            workdir: Arc::new(workdir),
        }
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

#[derive(Debug)]
pub enum Compiled {
    Ready(Program),
    Failed(CompileFailure),
}

/// Result of the one-shot `execute` contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Ran(RunOutput),
    CompileError(CompileFailure),
}

impl Execution {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Execution::Ran(output) => output.status(),
            Execution::CompileError(_) => ExecutionStatus::CompileError,
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write the source into a fresh working directory and run the compile
    /// phase, if the language has one
    async fn compile(
        &self,
        spec: &LanguageSpec,
        code: &str,
        timeout: Duration,
    ) -> Result<Compiled, SandboxError>;

    async fn run(
        &self,
        program: &Program,
        stdin: &str,
        timeout: Duration,
    ) -> Result<RunOutput, SandboxError>;
}

/// Language dispatch plus a global bound on concurrent sandbox work.
/// Cheap to clone; holds no per-run state.
#[derive(Clone)]
pub struct Sandbox {
    engine: Arc<dyn ExecutionEngine>,
    languages: Arc<LanguageTable>,
    permits: Arc<Semaphore>,
    compile_timeout: Duration,
}

impl Sandbox {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        languages: LanguageTable,
        max_concurrency: usize,
        compile_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            languages: Arc::new(languages),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            compile_timeout,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn supports(&self, language: &str) -> bool {
        self.languages.supports(language)
    }

    pub async fn prepare(&self, source: &SourceCode) -> Result<Compiled, SandboxError> {
        if source.code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(SandboxError::SourceTooLarge {
                limit: MAX_SOURCE_CODE_BYTES,
            });
        }
        let spec = self
            .languages
            .get(&source.language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(source.language.clone()))?;

        let _permit = self.acquire().await?;
        let compiled = self
            .engine
            .compile(spec, &source.code, self.compile_timeout)
            .await?;
        if let Compiled::Failed(failure) = &compiled {
            debug!(
                language = %spec.name,
                timed_out = failure.timed_out,
                "Compilation failed"
            );
        }
        Ok(compiled)
    }

    #[tracing::instrument(skip(self, program, stdin), fields(language = %program.spec.name, timeout_ms = timeout.as_millis() as u64))]
    pub async fn run(
        &self,
        program: &Program,
        stdin: &str,
        timeout: Duration,
    ) -> Result<RunOutput, SandboxError> {
        if stdin.len() > MAX_INPUT_BYTES {
            return Err(SandboxError::InputTooLarge {
                limit: MAX_INPUT_BYTES,
            });
        }
        let _permit = self.acquire().await?;
        let output = self.engine.run(program, stdin, timeout).await?;
        crate::metrics::record_sandbox_run(output.status());
        if output.timed_out {
            warn!(duration_ms = output.duration_ms, "Run timed out");
        }
        Ok(output)
    }

    /// `Execute(code, language, stdin, timeout)`: compile then run once
    pub async fn execute(
        &self,
        source: &SourceCode,
        stdin: &str,
        timeout: Duration,
    ) -> Result<Execution, SandboxError> {
        match self.prepare(source).await? {
            Compiled::Ready(program) => Ok(Execution::Ran(self.run(&program, stdin, timeout).await?)),
            Compiled::Failed(failure) => Ok(Execution::CompileError(failure)),
        }
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, SandboxError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| SandboxError::Infrastructure("sandbox is shutting down".into()))
    }
}

/// Environment handed to untrusted programs; nothing else leaks through
const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Local child-process engine
///
/// Each run is a fresh process group with a cleared environment and a
/// private copy of the program directory as cwd. The group is killed once
/// the leader exits, times out or the run is dropped.
pub struct ProcessEngine {
    scratch_root: Option<PathBuf>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self { scratch_root: None }
    }

    /// Create working directories under `root` instead of the system temp dir
    pub fn with_scratch_root(root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: Some(root.into()),
        }
    }

    fn workdir(&self) -> Result<TempDir, SandboxError> {
        fresh_dir(self.scratch_root.as_deref())
    }

    /// Fresh copy of the program's files for a single run, so nothing one
    /// run writes is visible to the next
    async fn stage_run_dir(&self, program: &Program) -> Result<TempDir, SandboxError> {
        let run_dir = self.workdir()?;
        let io_err = |e: std::io::Error| SandboxError::Infrastructure(format!("failed to stage run directory: {}", e));

        let mut entries = tokio::fs::read_dir(program.workdir()).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if entry.file_type().await.map_err(io_err)?.is_file() {
                tokio::fs::copy(entry.path(), run_dir.path().join(entry.file_name()))
                    .await
                    .map_err(io_err)?;
            }
        }
        Ok(run_dir)
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn fresh_dir(root: Option<&Path>) -> Result<TempDir, SandboxError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("caseforge-");
    let dir = match root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    };
    dir.map_err(|e| SandboxError::Infrastructure(format!("failed to create working directory: {}", e)))
}

/// Runs in the forked child before exec: no core dumps, bounded files
fn limit_resources() -> std::io::Result<()> {
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(
        Resource::RLIMIT_FSIZE,
        MAX_FILE_BYTES as rlim_t,
        MAX_FILE_BYTES as rlim_t,
    )?;
    Ok(())
}

/// Process group of one run. Dropping it SIGKILLs every member, so
/// background children die with the program whichever way the run ends.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(
            child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        )
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            // ESRCH just means every member is already gone
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Read `reader` to EOF, keeping at most `MAX_OUTPUT_BYTES`. Crossing the
/// limit raises `overflow` and stops reading.
fn spawn_reader<R>(reader: Option<R>, overflow: Arc<Notify>) -> JoinHandle<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let Some(mut reader) = reader else {
            return (buf, false);
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => return (buf, false),
                Ok(n) => {
                    if !append_capped(&mut buf, &chunk[..n]) {
                        overflow.notify_one();
                        return (buf, true);
                    }
                }
            }
        }
    })
}

async fn drain(reader: JoinHandle<(Vec<u8>, bool)>) -> (String, bool) {
    match tokio::time::timeout(DRAIN_TIMEOUT, reader).await {
        Ok(Ok((bytes, overflowed))) => (String::from_utf8_lossy(&bytes).into_owned(), overflowed),
        _ => {
            warn!("Output pipe still held open after the run, dropping its contents");
            (String::new(), false)
        }
    }
}

/// Spawn `argv` in `cwd` as the leader of a new process group, feed
/// `stdin`, wait at most `timeout` for the leader to exit. The whole group
/// is killed before output is collected.
async fn run_process(
    argv: &[String],
    cwd: &Path,
    stdin: &str,
    timeout: Duration,
) -> Result<RunOutput, SandboxError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SandboxError::Infrastructure("empty command".into()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    // SAFETY: the hook only calls setrlimit, which is async-signal-safe and
    // touches nothing shared with the parent
    unsafe {
        command.pre_exec(limit_resources);
    }

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::Infrastructure(format!("failed to spawn {}: {}", program, e)))?;
    let mut group = ProcessGroup::of(&child);

    // Feed stdin from a separate task so a program that prints before
    // reading everything cannot deadlock against a full pipe
    if let Some(mut pipe) = child.stdin.take() {
        let input = stdin.as_bytes().to_vec();
        tokio::spawn(async move {
            // Broken pipe just means the program stopped reading
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }

    let overflow = Arc::new(Notify::new());
    let stdout = spawn_reader(child.stdout.take(), overflow.clone());
    let stderr = spawn_reader(child.stderr.take(), overflow.clone());

    let waited = tokio::time::timeout(timeout, async {
        tokio::select! {
            status = child.wait() => Some(status),
            _ = overflow.notified() => None,
        }
    })
    .await;
    let duration_ms = start.elapsed().as_millis() as u64;
    group.kill();

    let exit_code = match waited {
        Ok(Some(Ok(status))) => status.code(),
        Ok(Some(Err(e))) => {
            return Err(SandboxError::Infrastructure(format!(
                "failed waiting for {}: {}",
                program, e
            )))
        }
        // Output limit hit; the leader was killed with its group
        Ok(None) => None,
        Err(_) => return Ok(RunOutput::timed_out_after(duration_ms)),
    };

    let (stdout, stdout_over) = drain(stdout).await;
    let (stderr, stderr_over) = drain(stderr).await;
    let output_limit_exceeded = stdout_over || stderr_over;
    if output_limit_exceeded {
        warn!(limit = MAX_OUTPUT_BYTES, "Run exceeded output limit");
    }

    Ok(RunOutput {
        stdout,
        stderr,
        exit_code: if output_limit_exceeded { None } else { exit_code },
        duration_ms,
        timed_out: false,
        output_limit_exceeded,
    })
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn compile(
        &self,
        spec: &LanguageSpec,
        code: &str,
        timeout: Duration,
    ) -> Result<Compiled, SandboxError> {
        let workdir = self.workdir()?;
        tokio::fs::write(workdir.path().join(&spec.source_file), code)
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("failed to write source: {}", e)))?;

        if let Some(compile) = spec.compile.as_ref().filter(|c| !c.is_empty()) {
            let output = run_process(compile, workdir.path(), "", timeout).await?;
            if !output.succeeded() {
                let message = if output.timed_out {
                    format!("compilation timed out after {}ms", timeout.as_millis())
                } else {
                    // Compilers split diagnostics across both streams
                    format!("{}{}", output.stderr, output.stdout)
                };
                return Ok(Compiled::Failed(CompileFailure {
                    message,
                    timed_out: output.timed_out,
                }));
            }
        }

        Ok(Compiled::Ready(Program::new(spec.clone(), workdir)))
    }

    async fn run(
        &self,
        program: &Program,
        stdin: &str,
        timeout: Duration,
    ) -> Result<RunOutput, SandboxError> {
        let run_dir = self.stage_run_dir(program).await?;
        run_process(&program.spec.run, run_dir.path(), stdin, timeout).await
    }
}
