// Prometheus metrics for the caseforge worker

use caseforge_common::types::{ExecutionStatus, JobType, QueueKind};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Stage attempts by job type and how they ended
    pub static ref JOBS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("caseforge_jobs_processed_total", "Stage attempts by outcome"),
        &["job_type", "outcome"]
    )
    .expect("metric can be created");

    pub static ref STAGE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "caseforge_stage_duration_ms",
            "Wall-clock time of one stage attempt in milliseconds"
        )
        .buckets(vec![50.0, 250.0, 1000.0, 5000.0, 15000.0, 60000.0, 180000.0, 600000.0]),
        &["job_type"]
    )
    .expect("metric can be created");

    // Duplicate deliveries that lost the claim race
    pub static ref CLAIM_CONFLICTS: IntCounterVec = IntCounterVec::new(
        Opts::new("caseforge_claim_conflicts_total", "Claims that found the job already taken"),
        &["job_type"]
    )
    .expect("metric can be created");

    pub static ref SWEEPER_RECLAIMS: IntCounterVec = IntCounterVec::new(
        Opts::new("caseforge_sweeper_reclaims_total", "Orphaned jobs reclaimed by the sweeper"),
        &["result"]
    )
    .expect("metric can be created");

    pub static ref SANDBOX_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new("caseforge_sandbox_runs_total", "Sandbox runs by execution status"),
        &["status"]
    )
    .expect("metric can be created");

    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("caseforge_queue_depth", "Ready messages per queue partition"),
        &["queue"]
    )
    .expect("metric can be created");
}

/// Register every collector; call once at startup
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(JOBS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(STAGE_DURATION.clone()))?;
    REGISTRY.register(Box::new(CLAIM_CONFLICTS.clone()))?;
    REGISTRY.register(Box::new(SWEEPER_RECLAIMS.clone()))?;
    REGISTRY.register(Box::new(SANDBOX_RUNS.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_stage(job_type: JobType, outcome: &str, elapsed_ms: f64) {
    JOBS_PROCESSED
        .with_label_values(&[job_type.as_str(), outcome])
        .inc();
    STAGE_DURATION
        .with_label_values(&[job_type.as_str()])
        .observe(elapsed_ms);
}

pub fn record_claim_conflict(job_type: JobType) {
    CLAIM_CONFLICTS.with_label_values(&[job_type.as_str()]).inc();
}

pub fn record_reclaim(result: &str) {
    SWEEPER_RECLAIMS.with_label_values(&[result]).inc();
}

pub fn record_sandbox_run(status: ExecutionStatus) {
    let label = match status {
        ExecutionStatus::Success => "success",
        ExecutionStatus::RuntimeError => "runtime_error",
        ExecutionStatus::Timeout => "timeout",
        ExecutionStatus::CompileError => "compile_error",
    };
    SANDBOX_RUNS.with_label_values(&[label]).inc();
}

pub fn set_queue_depth(kind: QueueKind, depth: usize) {
    let queue = kind.to_string();
    QUEUE_DEPTH
        .with_label_values(&[queue.as_str()])
        .set(depth as i64);
}
