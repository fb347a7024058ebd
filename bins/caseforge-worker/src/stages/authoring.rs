//! LLM-driven stages: metadata extraction, reference solution, test generator

use super::{ensure_supported, require, with_deadline, StageDeps};
use crate::error::StageError;
use crate::evaluator;
use crate::executor;
use crate::pipeline::{JobContext, StageOutput, TaskHandler};
use async_trait::async_trait;
use caseforge_common::types::{JobPayload, JobType, Tally};
use caseforge_common::ProblemRef;
use tracing::{info, warn};

pub struct ExtractMetadataHandler {
    deps: StageDeps,
}

impl ExtractMetadataHandler {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for ExtractMetadataHandler {
    fn job_type(&self) -> JobType {
        JobType::ExtractMetadata
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput, StageError> {
        let url = require(&ctx.payload().problem_url, "problem_url")?;
        let problem = ProblemRef::from_url(url)
            .map_err(|e| StageError::Permanent(format!("malformed problem URL: {}", e)))?;
        if problem.platform != ctx.job.platform || problem.problem_id != ctx.job.problem_id {
            return Err(StageError::Permanent(format!(
                "problem URL points at {}/{}, job is for {}/{}",
                problem.platform, problem.problem_id, ctx.job.platform, ctx.job.problem_id
            )));
        }

        ctx.ensure_active().await?;
        let metadata = with_deadline(
            self.deps.settings.llm_timeout,
            "metadata extraction",
            self.deps.author.extract_metadata(url),
        )
        .await?;
        info!(title = %metadata.title, samples = metadata.samples.len(), "Metadata extracted");

        let mut tally = Tally::default();
        tally.record(true);
        let next = JobPayload {
            metadata: Some(metadata),
            ..ctx.payload().clone()
        };
        Ok(StageOutput::new(tally).then(next))
    }
}

/// Asks for a reference solution and checks it against the samples.
/// A sample mismatch only raises `needs_review`.
pub struct GenerateSolutionHandler {
    deps: StageDeps,
}

impl GenerateSolutionHandler {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for GenerateSolutionHandler {
    fn job_type(&self) -> JobType {
        JobType::GenerateSolution
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput, StageError> {
        let metadata = require(&ctx.payload().metadata, "metadata")?;

        ctx.ensure_active().await?;
        let solution = with_deadline(
            self.deps.settings.llm_timeout,
            "solution generation",
            self.deps.author.generate_solution(metadata),
        )
        .await?;
        ensure_supported(&self.deps.sandbox, &solution.language)?;

        let mut tally = Tally::default();
        if !metadata.samples.is_empty() {
            let program = executor::compile(&self.deps.sandbox, &solution, "solution").await?;
            let inputs: Vec<&str> = metadata.samples.iter().map(|s| s.input.as_str()).collect();
            let runs = executor::run_units(ctx, &self.deps.sandbox, &program, &inputs).await?;

            for (idx, (sample, run)) in metadata.samples.iter().zip(&runs).enumerate() {
                let matched = matches!(
                    run,
                    Ok(output) if output.succeeded() && evaluator::validate(&sample.output, &output.stdout)
                );
                if !matched {
                    warn!(sample = idx + 1, "Generated solution disagrees with sample");
                }
                tally.record(matched);
            }
        }

        info!(
            language = %solution.language,
            samples_passed = tally.succeeded,
            samples_total = tally.total,
            "Solution generated"
        );
        let next = JobPayload {
            solution: Some(solution),
            ..ctx.payload().clone()
        };
        Ok(StageOutput::new(tally).reviewed().then(next))
    }
}

/// Asks for a program that prints one test input per case index.
/// The generator must compile here so later stages never see a broken one.
pub struct GenerateTestGeneratorHandler {
    deps: StageDeps,
}

impl GenerateTestGeneratorHandler {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for GenerateTestGeneratorHandler {
    fn job_type(&self) -> JobType {
        JobType::GenerateTestGenerator
    }

    async fn handle(&self, ctx: &JobContext) -> Result<StageOutput, StageError> {
        let payload = ctx.payload();
        let metadata = require(&payload.metadata, "metadata")?;
        let solution = require(&payload.solution, "solution")?;

        ctx.ensure_active().await?;
        let generator = with_deadline(
            self.deps.settings.llm_timeout,
            "test generator generation",
            self.deps.author.generate_test_generator(metadata, solution),
        )
        .await?;
        ensure_supported(&self.deps.sandbox, &generator.language)?;
        executor::compile(&self.deps.sandbox, &generator, "test generator").await?;

        info!(language = %generator.language, "Test generator ready");
        let mut tally = Tally::default();
        tally.record(true);
        let next = JobPayload {
            generator: Some(generator),
            ..payload.clone()
        };
        Ok(StageOutput::new(tally).then(next))
    }
}
