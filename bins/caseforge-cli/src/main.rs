mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "caseforge-cli")]
#[command(about = "Caseforge CLI - Start pipelines, submit code, inspect jobs and languages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the test-generation pipeline for a problem URL
    Pipeline {
        /// Problem URL (Codeforces, AtCoder or Baekjoon)
        #[arg(short, long)]
        url: String,

        /// Generator runs for the test-case stage
        #[arg(short, long)]
        cases: Option<u32>,

        /// Per-run time limit in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Judge a source file against a problem's test set
    Submit {
        /// Platform (codeforces, atcoder, baekjoon)
        #[arg(short, long)]
        platform: String,

        /// Problem id on that platform (e.g., 1A, abc300_a)
        #[arg(long)]
        problem: String,

        /// Language name or alias
        #[arg(short, long)]
        language: String,

        /// Source file to submit
        #[arg(short, long)]
        file: PathBuf,

        /// Per-run time limit in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Show a job; --follow walks the successor chain
    Status {
        #[arg(short, long)]
        job: String,

        #[arg(long, default_value = "false")]
        follow: bool,

        /// Print the raw job record
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Cancel a pending or running job
    Cancel {
        #[arg(short, long)]
        job: String,
    },

    /// List the stored test cases of a problem
    Cases {
        #[arg(short, long)]
        platform: String,

        #[arg(long)]
        problem: String,

        /// Print inputs and expected outputs in full
        #[arg(long, default_value = "false")]
        show: bool,
    },

    /// List the language dispatch table
    Languages,

    /// Add or replace a language in config/languages.json
    AddLang {
        /// Language name (e.g., go, kotlin)
        #[arg(short, long)]
        name: String,

        /// File the source is written to (e.g., main.go)
        #[arg(short, long)]
        source_file: String,

        /// Run command, whitespace separated (e.g., "./main")
        #[arg(short, long)]
        run: String,

        /// Compile command, whitespace separated (e.g., "go build -o main main.go")
        #[arg(short, long)]
        compile: Option<String>,

        /// Docker image for the docker sandbox
        #[arg(short, long)]
        image: Option<String>,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u32,

        /// CPU limit
        #[arg(long, default_value = "1.0")]
        cpu: f32,

        /// Extra names the language is known by
        #[arg(short, long)]
        alias: Vec<String>,
    },

    /// Remove a language from config/languages.json
    RemoveLang {
        #[arg(short, long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Pipeline {
            url,
            cases,
            timeout_ms,
        } => {
            commands::start_pipeline(&url, cases, timeout_ms).await?;
        }
        Commands::Submit {
            platform,
            problem,
            language,
            file,
            timeout_ms,
        } => {
            commands::submit(&platform, &problem, &language, &file, timeout_ms).await?;
        }
        Commands::Status { job, follow, json } => {
            commands::show_status(&job, follow, json).await?;
        }
        Commands::Cancel { job } => {
            commands::cancel(&job).await?;
        }
        Commands::Cases {
            platform,
            problem,
            show,
        } => {
            commands::list_cases(&platform, &problem, show).await?;
        }
        Commands::Languages => {
            commands::list_languages()?;
        }
        Commands::AddLang {
            name,
            source_file,
            run,
            compile,
            image,
            memory,
            cpu,
            alias,
        } => {
            commands::add_language(commands::NewLanguage {
                name,
                source_file,
                run,
                compile,
                image,
                memory,
                cpu,
                aliases: alias,
            })?;
        }
        Commands::RemoveLang { name } => {
            commands::remove_language(&name)?;
        }
    }

    Ok(())
}
