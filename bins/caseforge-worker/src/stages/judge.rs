use super::{ensure_supported, require, with_deadline, StageDeps};
use crate::engine::Compiled;
use crate::error::StageError;
use crate::evaluator;
use crate::executor;
use crate::llm::FailedCase;
use crate::pipeline::{JobContext, StageOutput, TaskHandler};
use async_trait::async_trait;
use caseforge_common::types::{ExecutionResult, JobType, TestCase};
use tracing::{info, warn};

/// Judges a submission against the stored test set, one fresh run per case.
/// When any case fails, hints are requested once for the whole submission.
pub struct ExecuteSubmissionHandler {
    deps: StageDeps,
}

impl ExecuteSubmissionHandler {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }

    /// Best-effort: the verdict stands without hints
    async fn hints_for(&self, cases: &[TestCase], results: &[ExecutionResult]) -> Vec<String> {
        let failed: Vec<FailedCase> = cases
            .iter()
            .zip(results)
            .filter(|(_, result)| !result.passed)
            .take(self.deps.settings.hint_case_limit)
            .map(|(case, result)| FailedCase::summarize(case, result))
            .collect();
        if failed.is_empty() {
            return Vec::new();
        }

        match with_deadline(
            self.deps.settings.llm_timeout,
            "hint generation",
            self.deps.hints.generate_hints(&failed),
        )
        .await
        {
            Ok(hints) => hints,
            Err(e) => {
                warn!(error = %e, "Hint generation failed, returning results without hints");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl TaskHandler for ExecuteSubmissionHandler {
    fn job_type(&self) -> JobType {
        JobType::ExecuteSubmission
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput, StageError> {
        let submission = require(&ctx.payload().submission, "submission")?;
        ensure_supported(&self.deps.sandbox, &submission.language)?;

        let cases = self
            .deps
            .testcases
            .list(&ctx.job.platform, &ctx.job.problem_id)
            .await?;
        if cases.is_empty() {
            return Err(StageError::Permanent(format!(
                "no test cases for {}/{}",
                ctx.job.platform, ctx.job.problem_id
            )));
        }

        ctx.ensure_active().await?;
        let program = match self.deps.sandbox.prepare(submission).await? {
            Compiled::Ready(program) => program,
            Compiled::Failed(failure) => {
                return Err(StageError::Compile {
                    results: evaluator::compile_error_results(&cases, &failure.message),
                    message: failure.message.trim_end().to_string(),
                });
            }
        };

        let inputs: Vec<&str> = cases.iter().map(|c| c.input.as_str()).collect();
        let runs = executor::run_units(ctx, &self.deps.sandbox, &program, &inputs).await?;

        let results: Vec<ExecutionResult> = cases
            .iter()
            .zip(&runs)
            .map(|(case, run)| match run {
                Ok(output) => evaluator::judge(case, output, ctx.job.timeout_ms),
                Err(e) => evaluator::sandbox_failure(case, &e.to_string()),
            })
            .collect();

        let tally = evaluator::tally(&results);
        info!(
            passed = tally.succeeded,
            total = tally.total,
            language = %submission.language,
            "Submission judged"
        );

        let hints = if tally.all_succeeded() {
            Vec::new()
        } else {
            self.hints_for(&cases, &results).await
        };

        let mut output = StageOutput::new(tally).reviewed();
        output.outcome.results = results;
        output.outcome.hints = hints;
        Ok(output)
    }
}
