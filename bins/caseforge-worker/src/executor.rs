/// Batch Executor - per-unit isolation for bulk stages
///
/// **Responsibility:**
/// Run one compiled program over many inputs, one fresh run per input.
///
/// - Ownership/cancellation is checked before every unit
/// - One unit's crash or timeout never aborts the batch
/// - If the sandbox itself failed on every unit, the batch is a
///   transient failure rather than a list of per-unit failures
///
/// This module is the glue layer between the sandbox and the stages; it
/// knows nothing about expected outputs.

use crate::engine::{Compiled, Program, RunOutput, Sandbox, SandboxError};
use crate::error::StageError;
use crate::pipeline::JobContext;
use caseforge_common::types::SourceCode;
use tracing::{debug, warn};

pub type UnitRun = Result<RunOutput, SandboxError>;

/// Compile `source`; a compile failure becomes `StageError::Compile`
pub async fn compile(sandbox: &Sandbox, source: &SourceCode, what: &str) -> Result<Program, StageError> {
    match sandbox.prepare(source).await? {
        Compiled::Ready(program) => Ok(program),
        Compiled::Failed(failure) => {
            warn!(what = what, timed_out = failure.timed_out, "Compilation failed");
            Err(StageError::compile(format!("{}: {}", what, failure.message.trim_end())))
        }
    }
}

pub async fn run_units<S: AsRef<str>>(
    ctx: &JobContext,
    sandbox: &Sandbox,
    program: &Program,
    inputs: &[S],
) -> Result<Vec<UnitRun>, StageError> {
    let mut runs = Vec::with_capacity(inputs.len());

    for (idx, input) in inputs.iter().enumerate() {
        ctx.ensure_active().await?;

        let run = sandbox.run(program, input.as_ref(), ctx.run_timeout()).await;
        match &run {
            Ok(output) => debug!(
                unit = idx + 1,
                status = ?output.status(),
                duration_ms = output.duration_ms,
                "Unit finished"
            ),
            Err(e) => warn!(unit = idx + 1, error = %e, "Unit could not be run"),
        }
        runs.push(run);
    }

    let all_broken = !runs.is_empty()
        && runs
            .iter()
            .all(|run| matches!(run, Err(e) if e.is_infrastructure()));
    if all_broken {
        let reason = runs
            .iter()
            .find_map(|run| run.as_ref().err())
            .map(|e| e.to_string())
            .unwrap_or_default();
        return Err(StageError::Transient(reason));
    }

    Ok(runs)
}
