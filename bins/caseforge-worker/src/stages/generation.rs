//! Bulk stages that build a problem's test set.
//!
//! Each generator or solution run is an independent unit; failed units are
//! counted and dropped, and the set is written once with `replace_all`.

use super::{ensure_supported, require, StageDeps};
use crate::error::StageError;
use crate::evaluator;
use crate::executor;
use crate::pipeline::{JobContext, StageOutput, TaskHandler};
use async_trait::async_trait;
use caseforge_common::types::{JobType, Tally, TestCase};
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub struct GenerateTestCasesHandler {
    deps: StageDeps,
}

impl GenerateTestCasesHandler {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for GenerateTestCasesHandler {
    fn job_type(&self) -> JobType {
        JobType::GenerateTestCases
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput, StageError> {
        let payload = ctx.payload();
        let generator = require(&payload.generator, "generator")?;
        ensure_supported(&self.deps.sandbox, &generator.language)?;
        let count = payload
            .case_count
            .unwrap_or(self.deps.settings.generated_case_count);

        // Samples come first and carry their known outputs
        let mut cases: Vec<TestCase> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for sample in payload.metadata.iter().flat_map(|m| m.samples.iter()) {
            if seen.insert(evaluator::normalize(&sample.input)) {
                let id = cases.len() as u32 + 1;
                cases.push(TestCase::new(id, sample.input.clone()).with_expected(sample.output.clone()));
            }
        }
        let seeded = cases.len();

        let program = executor::compile(&self.deps.sandbox, generator, "test generator").await?;
        let seeds: Vec<String> = (1..=count).map(|i| format!("{}\n", i)).collect();
        let runs = executor::run_units(ctx, &self.deps.sandbox, &program, &seeds).await?;

        let mut tally = Tally::default();
        let mut duplicates = 0usize;
        for (idx, run) in runs.iter().enumerate() {
            let output = match run {
                Ok(output) if output.succeeded() => output,
                Ok(output) => {
                    warn!(
                        unit = idx + 1,
                        reason = %evaluator::failure_reason(output, ctx.job.timeout_ms).unwrap_or_default(),
                        "Generator run failed"
                    );
                    tally.record(false);
                    continue;
                }
                Err(e) => {
                    warn!(unit = idx + 1, error = %e, "Generator run could not be performed");
                    tally.record(false);
                    continue;
                }
            };

            let key = evaluator::normalize(&output.stdout);
            if key.is_empty() {
                debug!(unit = idx + 1, "Generator printed nothing");
                tally.record(false);
            } else if seen.insert(key) {
                let id = cases.len() as u32 + 1;
                cases.push(TestCase::new(id, output.stdout.clone()));
                tally.record(true);
            } else {
                duplicates += 1;
            }
        }

        if count > 0 && cases.len() == seeded {
            return Err(StageError::Permanent(format!(
                "test generator produced no usable input in {} runs",
                count
            )));
        }
        if cases.is_empty() {
            return Err(StageError::Permanent("no samples and no generated cases".into()));
        }

        ctx.ensure_active().await?;
        self.deps
            .testcases
            .replace_all(&ctx.job.platform, &ctx.job.problem_id, &cases)
            .await?;
        info!(
            cases = cases.len(),
            samples = seeded,
            failed_runs = tally.failed,
            duplicates = duplicates,
            "Test inputs written"
        );

        Ok(StageOutput::new(tally)
            .with_testcases(cases.len())
            .reviewed()
            .then(payload.clone()))
    }
}

/// Runs the reference solution on every stored input.
/// Sample cases keep their known output and must validate against it;
/// other cases get the solution's stdout verbatim, or are dropped if the
/// run failed.
pub struct GenerateOutputsHandler {
    deps: StageDeps,
}

impl GenerateOutputsHandler {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for GenerateOutputsHandler {
    fn job_type(&self) -> JobType {
        JobType::GenerateOutputs
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput, StageError> {
        let solution = require(&ctx.payload().solution, "solution")?;
        ensure_supported(&self.deps.sandbox, &solution.language)?;

        let cases = self
            .deps
            .testcases
            .list(&ctx.job.platform, &ctx.job.problem_id)
            .await?;
        if cases.is_empty() {
            return Err(StageError::Permanent(format!(
                "no test inputs stored for {}/{}",
                ctx.job.platform, ctx.job.problem_id
            )));
        }

        let program = executor::compile(&self.deps.sandbox, solution, "solution").await?;
        let inputs: Vec<&str> = cases.iter().map(|c| c.input.as_str()).collect();
        let runs = executor::run_units(ctx, &self.deps.sandbox, &program, &inputs).await?;

        let mut tally = Tally::default();
        let mut kept = Vec::with_capacity(cases.len());
        for (case, run) in cases.into_iter().zip(runs) {
            let output = match run {
                Ok(output) if output.succeeded() => Some(output),
                Ok(output) => {
                    warn!(
                        testcase_id = case.testcase_id,
                        reason = %evaluator::failure_reason(&output, ctx.job.timeout_ms).unwrap_or_default(),
                        "Solution run failed"
                    );
                    None
                }
                Err(e) => {
                    warn!(testcase_id = case.testcase_id, error = %e, "Solution run could not be performed");
                    None
                }
            };

            if let Some(expected) = case.expected_output.as_deref() {
                let matched = output
                    .as_ref()
                    .is_some_and(|o| evaluator::validate(expected, &o.stdout));
                if !matched {
                    warn!(testcase_id = case.testcase_id, "Solution disagrees with sample output");
                }
                tally.record(matched);
                kept.push(case);
            } else if let Some(output) = output {
                tally.record(true);
                kept.push(TestCase {
                    expected_output: Some(output.stdout),
                    ..case
                });
            } else {
                tally.record(false);
            }
        }

        if tally.succeeded == 0 {
            return Err(StageError::Permanent(
                "solution produced no usable output for any test case".into(),
            ));
        }

        ctx.ensure_active().await?;
        self.deps
            .testcases
            .replace_all(&ctx.job.platform, &ctx.job.problem_id, &kept)
            .await?;
        info!(kept = kept.len(), failed = tally.failed, "Expected outputs written");

        Ok(StageOutput::new(tally).with_testcases(kept.len()).reviewed())
    }
}
