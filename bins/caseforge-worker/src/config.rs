// Worker settings for the caseforge worker
use caseforge_common::config::env_or;
use caseforge_common::languages::DEFAULT_LANGUAGES_PATH;
use caseforge_common::types::QueueKind;
use caseforge_common::Config;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    Process,
    Docker,
}

impl SandboxBackend {
    pub fn from_str(s: &str) -> Option<SandboxBackend> {
        match s.to_lowercase().as_str() {
            "process" => Some(SandboxBackend::Process),
            "docker" => Some(SandboxBackend::Docker),
            _ => None,
        }
    }
}

/// Worker configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub common: Config,
    pub worker_id: String,
    pub sandbox_backend: SandboxBackend,
    pub scratch_root: Option<PathBuf>,
    pub workers_submission: usize,
    pub workers_generation: usize,
    pub workers_ai: usize,
    pub sandbox_max_concurrency: usize,
    pub compile_timeout: Duration,
    pub processing_timeout: Duration,
    pub sweep_interval: Duration,
    pub promote_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub llm_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_timeout: Duration,
    pub hint_case_limit: usize,
    pub generated_case_count: u32,
    pub health_addr: String,
    pub languages_config: PathBuf,
    pub json_logs: bool,
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let hostname = non_empty("HOSTNAME").unwrap_or_else(|| "worker".to_string());
        Self {
            common: Config::from_env(),
            worker_id: non_empty("WORKER_ID").unwrap_or(hostname),
            sandbox_backend: env::var("SANDBOX_BACKEND")
                .ok()
                .and_then(|v| SandboxBackend::from_str(&v))
                .unwrap_or(SandboxBackend::Process),
            scratch_root: non_empty("SANDBOX_SCRATCH_DIR").map(PathBuf::from),
            workers_submission: env_or("WORKERS_SUBMISSION", 4),
            workers_generation: env_or("WORKERS_GENERATION", 2),
            workers_ai: env_or("WORKERS_AI", 2),
            sandbox_max_concurrency: env_or("SANDBOX_MAX_CONCURRENCY", 4),
            compile_timeout: Duration::from_millis(env_or("COMPILE_TIMEOUT_MS", 30_000)),
            processing_timeout: Duration::from_secs(env_or("PROCESSING_TIMEOUT_SECS", 600)),
            sweep_interval: Duration::from_secs(env_or("SWEEP_INTERVAL_SECS", 60)),
            promote_interval: Duration::from_millis(env_or("PROMOTE_INTERVAL_MS", 1000)),
            retry_base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 2000)),
            retry_max_delay: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 120_000)),
            llm_endpoint: non_empty("LLM_ENDPOINT"),
            llm_api_key: non_empty("LLM_API_KEY"),
            llm_timeout: Duration::from_secs(env_or("LLM_TIMEOUT_SECS", 120)),
            hint_case_limit: env_or("HINT_CASE_LIMIT", 3),
            generated_case_count: env_or("GENERATED_CASE_COUNT", 20),
            health_addr: env::var("HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
            languages_config: non_empty("LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LANGUAGES_PATH)),
            json_logs: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    pub fn pool_size(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Submission => self.workers_submission,
            QueueKind::Generation => self.workers_generation,
            QueueKind::Ai => self.workers_ai,
        }
    }

    /// Slowest stage attempt we expect to see: a bulk stage compiles once
    /// and then runs every generated case one after another, after waiting
    /// on at most one LLM call.
    pub fn worst_case_stage(&self) -> Duration {
        let runs = Duration::from_millis(self.common.max_timeout_ms)
            .saturating_mul(self.generated_case_count);
        self.compile_timeout + runs + self.llm_timeout
    }

    /// Settings that let the sweeper reclaim a job that is still running,
    /// or republish a message that is only waiting out its backoff
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.processing_timeout <= self.llm_timeout.saturating_mul(2) {
            warnings.push(format!(
                "PROCESSING_TIMEOUT_SECS={} should exceed twice LLM_TIMEOUT_SECS={}",
                self.processing_timeout.as_secs(),
                self.llm_timeout.as_secs()
            ));
        }
        if self.processing_timeout <= self.worst_case_stage() {
            warnings.push(format!(
                "PROCESSING_TIMEOUT_SECS={} is below the worst-case stage duration of {}s",
                self.processing_timeout.as_secs(),
                self.worst_case_stage().as_secs()
            ));
        }
        if self.retry_max_delay >= self.processing_timeout {
            warnings.push(format!(
                "RETRY_MAX_DELAY_MS={} should stay below PROCESSING_TIMEOUT_SECS={}",
                self.retry_max_delay.as_millis(),
                self.processing_timeout.as_secs()
            ));
        }
        if self.workers_submission == 0 {
            warnings.push("WORKERS_SUBMISSION=0: submissions will never be judged".to_string());
        }
        warnings
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
