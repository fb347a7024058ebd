// CLI commands for driving Caseforge
use anyhow::{bail, Context, Result};
use caseforge_common::languages::{LanguagesJson, DEFAULT_LANGUAGES_PATH};
use caseforge_common::types::{Job, JobPayload, JobStatus, JobType, SourceCode};
use caseforge_common::{Backends, Config, LanguageSpec, LanguageTable, ProblemRef};
use std::fs;
use std::path::{Path, PathBuf};

fn languages_path() -> PathBuf {
    std::env::var("LANGUAGES_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LANGUAGES_PATH))
}

async fn connect(config: &Config) -> Result<Backends> {
    Backends::open(config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis_url))
}

/// Create the first stage of the generation pipeline
pub async fn start_pipeline(url: &str, cases: Option<u32>, timeout_ms: Option<u64>) -> Result<()> {
    let problem = ProblemRef::from_url(url).context("Invalid problem URL")?;
    let config = Config::from_env();

    let job = Job::new(
        JobType::ExtractMetadata,
        problem.platform.clone(),
        problem.problem_id.clone(),
        JobPayload {
            problem_url: Some(url.trim().to_string()),
            case_count: cases,
            ..Default::default()
        },
    )
    .with_max_attempts(config.max_attempts)
    .with_timeout_ms(config.clamp_timeout(timeout_ms));

    let backends = connect(&config).await?;
    backends.submit(&job).await.context("Failed to enqueue pipeline")?;

    println!("🚀 Pipeline started for {}/{}", problem.platform, problem.problem_id);
    println!("   Job: {}", job.job_id);
    println!("\n💡 Follow it with: caseforge-cli status --job {} --follow", job.job_id);
    Ok(())
}

pub async fn submit(
    platform: &str,
    problem: &str,
    language: &str,
    file: &Path,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let table = LanguageTable::load_or_builtin(&languages_path())?;
    let Some(spec) = table.get(language) else {
        bail!(
            "Unsupported language '{}'. Available: {}",
            language,
            table.names().join(", ")
        );
    };

    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if code.trim().is_empty() {
        bail!("{} is empty", file.display());
    }

    let config = Config::from_env();
    let backends = connect(&config).await?;
    if backends.testcases().list(platform, problem).await?.is_empty() {
        println!("⚠️  No test cases stored for {}/{} yet; the job will fail", platform, problem);
    }

    let job = Job::new(
        JobType::ExecuteSubmission,
        platform,
        problem,
        JobPayload {
            submission: Some(SourceCode::new(code, spec.name.clone())),
            ..Default::default()
        },
    )
    .with_max_attempts(config.max_attempts)
    .with_timeout_ms(config.clamp_timeout(timeout_ms));

    backends.submit(&job).await.context("Failed to enqueue submission")?;
    println!("✅ Submitted {} ({})", file.display(), spec.name);
    println!("   Job: {}", job.job_id);
    Ok(())
}

fn status_icon(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "⏳",
        JobStatus::Processing => "⚙️ ",
        JobStatus::Completed => "✅",
        JobStatus::Failed => "❌",
        JobStatus::Cancelled => "🚫",
    }
}

fn print_job(job: &Job) {
    println!(
        "{} {:<24} {:<11} {}/{}  {}",
        status_icon(job.status),
        job.job_type,
        job.status,
        job.platform,
        job.problem_id,
        job.job_id
    );
    println!(
        "   attempts {}/{}  updated {}",
        job.attempt_count,
        job.max_attempts,
        job.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    if job.needs_review {
        println!("   ⚠️  needs review");
    }
    if let Some(error) = &job.error_message {
        println!("   error: {}", error);
    }
    if let Some(outcome) = &job.outcome {
        println!(
            "   units: {} ok / {} failed / {} total",
            outcome.tally.succeeded, outcome.tally.failed, outcome.tally.total
        );
        for result in &outcome.results {
            let mark = if result.passed { "PASS" } else { "FAIL" };
            match &result.error {
                Some(error) => println!("   #{:<4} {} {:?}: {}", result.testcase_id, mark, result.status, error),
                None => println!("   #{:<4} {} {:?}", result.testcase_id, mark, result.status),
            }
        }
        for hint in &outcome.hints {
            println!("   💡 {}", hint);
        }
    }
}

pub async fn show_status(job_id: &str, follow: bool, json: bool) -> Result<()> {
    let backends = connect(&Config::from_env()).await?;
    let jobs = backends.jobs();

    let mut next = Some(job_id.to_string());
    while let Some(id) = next.take() {
        let job = jobs
            .get(&id)
            .await?
            .with_context(|| format!("Job {} not found", id))?;

        if json {
            println!("{}", serde_json::to_string_pretty(&job)?);
        } else {
            print_job(&job);
        }

        if follow {
            next = job.outcome.and_then(|o| o.next_job_id);
        }
    }
    Ok(())
}

pub async fn cancel(job_id: &str) -> Result<()> {
    let backends = connect(&Config::from_env()).await?;
    match backends.jobs().cancel(job_id, chrono::Utc::now()).await? {
        Some(job) => println!("🚫 Cancelled {} ({})", job.job_id, job.job_type),
        None => {
            let job = backends.jobs().require(job_id).await?;
            println!("Job {} already finished as {}", job.job_id, job.status);
        }
    }
    Ok(())
}

fn preview(text: &str) -> String {
    let first = text.lines().next().unwrap_or("");
    let more = if text.lines().nth(1).is_some() { " …" } else { "" };
    let clipped: String = first.chars().take(40).collect();
    format!("{}{}", clipped, more)
}

pub async fn list_cases(platform: &str, problem: &str, show: bool) -> Result<()> {
    let backends = connect(&Config::from_env()).await?;
    let cases = backends.testcases().list(platform, problem).await?;

    if cases.is_empty() {
        println!("No test cases stored for {}/{}.", platform, problem);
        println!("\n💡 Generate them with: caseforge-cli pipeline --url <problem-url>");
        return Ok(());
    }

    println!("📋 Test cases for {}/{}:\n", platform, problem);
    for case in &cases {
        let expected = case.expected_output.as_deref();
        if show {
            println!("── #{} ──", case.testcase_id);
            println!("input:\n{}", case.input.trim_end());
            println!("expected:\n{}", expected.unwrap_or("<not generated>").trim_end());
        } else {
            println!(
                "#{:<4} {:<44} -> {}",
                case.testcase_id,
                preview(&case.input),
                expected.map(preview).unwrap_or_else(|| "<not generated>".to_string())
            );
        }
    }

    let missing = cases.iter().filter(|c| c.expected_output.is_none()).count();
    println!("\n✅ Total: {} case(s), {} without expected output", cases.len(), missing);
    Ok(())
}

/// List all configured languages
pub fn list_languages() -> Result<()> {
    let path = languages_path();
    let table = LanguageTable::load_or_builtin(&path)?;
    if !path.exists() {
        println!("ℹ️  {} not found, showing built-in languages\n", path.display());
    }

    println!("{:<10} {:<12} {:<36} {:<22} {:<10}", "Name", "Source", "Compile", "Image", "CPU/Mem");
    println!("{}", "─".repeat(100));
    for spec in table.specs() {
        let compile = spec
            .compile
            .as_ref()
            .map(|c| c.join(" "))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<12} {:<36} {:<22} {:.1}/{} MB",
            spec.name,
            spec.source_file,
            compile,
            spec.image.as_deref().unwrap_or("-"),
            spec.cpu_limit,
            spec.memory_limit_mb
        );
    }
    println!("\n✅ Total: {} language(s)", table.specs().len());
    Ok(())
}

/// Arguments of `add-lang`
pub struct NewLanguage {
    pub name: String,
    pub source_file: String,
    pub run: String,
    pub compile: Option<String>,
    pub image: Option<String>,
    pub memory: u32,
    pub cpu: f32,
    pub aliases: Vec<String>,
}

impl NewLanguage {
    fn into_spec(self) -> Result<LanguageSpec> {
        let split = |cmd: &str| -> Vec<String> { cmd.split_whitespace().map(str::to_string).collect() };
        let name = self.name.trim().to_lowercase();
        if name.is_empty() || self.source_file.trim().is_empty() {
            bail!("Language name and source file cannot be empty");
        }
        let run = split(&self.run);
        if run.is_empty() {
            bail!("Run command cannot be empty");
        }
        Ok(LanguageSpec {
            name,
            source_file: self.source_file.trim().to_string(),
            compile: self.compile.as_deref().map(split).filter(|c| !c.is_empty()),
            run,
            image: self.image,
            memory_limit_mb: self.memory,
            cpu_limit: self.cpu,
            aliases: self.aliases,
        })
    }
}

/// Entries of the languages file; a missing file has none
fn load_languages_config(path: &Path) -> Result<LanguagesJson> {
    if !path.exists() {
        return Ok(LanguagesJson { languages: vec![] });
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn save_languages_config(path: &Path, config: &LanguagesJson) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json_content = serde_json::to_string_pretty(config)
        .context("Failed to serialize languages.json")?;
    fs::write(path, json_content).with_context(|| format!("Failed to write {}", path.display()))
}

fn upsert_language(path: &Path, spec: LanguageSpec) -> Result<bool> {
    let mut config = load_languages_config(path)?;
    let replaced = match config.languages.iter_mut().find(|l| l.name == spec.name) {
        Some(existing) => {
            *existing = spec;
            true
        }
        None => {
            config.languages.push(spec);
            false
        }
    };
    // Refuse to write a file the worker would reject
    LanguageTable::new(config.languages.clone())?;
    save_languages_config(path, &config)?;
    Ok(replaced)
}

fn drop_language(path: &Path, name: &str) -> Result<()> {
    let mut config = load_languages_config(path)?;
    let before = config.languages.len();
    config.languages.retain(|l| !l.name.eq_ignore_ascii_case(name));
    if config.languages.len() == before {
        bail!("Language '{}' not found in {}", name, path.display());
    }
    save_languages_config(path, &config)
}

pub fn add_language(language: NewLanguage) -> Result<()> {
    let spec = language.into_spec()?;
    let name = spec.name.clone();
    let path = languages_path();

    println!("🚀 Adding language: {}", name);
    let replaced = upsert_language(&path, spec)?;
    if replaced {
        println!("✅ Language '{}' updated in {}", name, path.display());
    } else {
        println!("✅ Language '{}' added to {}", name, path.display());
    }
    println!("\n📋 Restart the workers to pick up the change.");
    Ok(())
}

pub fn remove_language(name: &str) -> Result<()> {
    let path = languages_path();
    drop_language(&path, name)?;
    println!("✅ Language '{}' removed from {}", name, path.display());
    if LanguageTable::builtin().supports(name) {
        println!("ℹ️  '{}' is also built in, so workers keep supporting it", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn go() -> NewLanguage {
        NewLanguage {
            name: "Go".into(),
            source_file: "main.go".into(),
            run: "./main".into(),
            compile: Some("go build -o main main.go".into()),
            image: Some("golang:1.22".into()),
            memory: 512,
            cpu: 1.0,
            aliases: vec!["golang".into()],
        }
    }

    #[test]
    fn test_new_language_splits_commands() {
        let spec = go().into_spec().unwrap();
        assert_eq!(spec.name, "go");
        assert_eq!(spec.run, vec!["./main"]);
        assert_eq!(
            spec.compile,
            Some(vec!["go".to_string(), "build".into(), "-o".into(), "main".into(), "main.go".into()])
        );

        let mut blank = go();
        blank.run = "   ".into();
        assert!(blank.into_spec().is_err());
    }

    #[test]
    fn test_add_then_remove_language() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("languages.json");

        assert!(!upsert_language(&path, go().into_spec().unwrap()).unwrap());
        let table = LanguageTable::load(&path).unwrap();
        assert_eq!(table.get("golang").unwrap().source_file, "main.go");
        assert!(table.supports("python"));

        let mut updated = go();
        updated.memory = 1024;
        assert!(upsert_language(&path, updated.into_spec().unwrap()).unwrap());
        assert_eq!(load_languages_config(&path).unwrap().languages.len(), 1);

        drop_language(&path, "GO").unwrap();
        assert!(load_languages_config(&path).unwrap().languages.is_empty());
        assert!(drop_language(&path, "go").is_err());
    }

    #[test]
    fn test_preview_clips_long_input() {
        assert_eq!(preview("1 2"), "1 2");
        assert_eq!(preview("3\n1 2 3\n"), "3 …");
        assert_eq!(preview(&"9".repeat(100)).chars().count(), 40);
    }
}
