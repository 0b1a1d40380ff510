//! gradebox daemon CLI
//!
//! Grades student submissions inside demoted, timeout-bounded child
//! processes. Configuration comes from `--config` or the
//! `GRADEBOX_CONFIG` env var; the HTTP front end is a separate concern
//! and invokes the same library surface this CLI does.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gradebox::config::Config;
use gradebox::grader::Grader;
use gradebox::identity::SystemResolver;
use gradebox::script::Harness;
use gradebox::store::{AssignmentStore, AuditStore, GradeStore, GradingDb, StudentGradeDb};

#[derive(Parser, Debug)]
#[command(name = "gradebox")]
#[command(about = "Sandboxed grading of student code submissions")]
struct Args {
    /// Path to a JSON config file (defaults to GRADEBOX_CONFIG env var)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grade a submission and print the response as JSON
    Grade {
        /// Student handle (must match an OS account)
        #[arg(long)]
        student: String,

        /// Assignment id
        #[arg(long)]
        assignment: i64,

        /// Submission source file (reads stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List the assignment catalog as JSON
    Assignments,

    /// Print a student's scores and overall average as JSON
    Scores {
        #[arg(long)]
        student: String,
    },

    /// Create the grading database schema and course assignments
    Seed,

    /// Initialize a student's per-home grade database with zeroed rows
    SeedStudent {
        #[arg(long)]
        student: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays clean for JSON output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let grading_db = Arc::new(
        GradingDb::connect(&config.grading_db)
            .await
            .context("Failed to connect to grading database")?,
    );

    match args.command {
        Command::Grade {
            student,
            assignment,
            file,
        } => {
            let code = read_submission(file.as_deref()).await?;

            let harness = match &config.template_path {
                Some(path) => Harness::from_file(path)?,
                None => Harness::embedded(),
            };
            let grades = Arc::new(StudentGradeDb::new(config.student_root.clone()));
            let grader = Grader::new(
                &config,
                harness,
                Arc::clone(&grading_db) as Arc<dyn AssignmentStore>,
                grades as Arc<dyn GradeStore>,
                Arc::clone(&grading_db) as Arc<dyn AuditStore>,
                Arc::new(SystemResolver),
            );

            match grader.grade(&student, assignment, &code).await {
                Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                Err(rejection) => {
                    eprintln!("Submission rejected: {rejection}");
                    std::process::exit(2);
                }
            }
        }

        Command::Assignments => {
            let assignments = grading_db.list().await?;
            println!("{}", serde_json::to_string_pretty(&assignments)?);
        }

        Command::Scores { student } => {
            let grades = StudentGradeDb::new(config.student_root.clone());
            let scores = grades.read_all_scores(&student).await?;
            #[allow(clippy::cast_precision_loss)]
            let average = if scores.is_empty() {
                0.0
            } else {
                scores.values().sum::<i64>() as f64 / scores.len() as f64
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "scores": scores,
                    "average": average,
                }))?
            );
        }

        Command::Seed => {
            grading_db.seed().await?;
            info!("Grading database seeded");
        }

        Command::SeedStudent { student } => {
            let assignment_ids: Vec<i64> =
                grading_db.list().await?.iter().map(|a| a.id).collect();
            let grades = StudentGradeDb::new(config.student_root.clone());
            grades.init_student(&student, &assignment_ids).await?;
            info!(student = %student, "Student grade database initialized");
        }
    }

    Ok(())
}

/// Read the submission source from a file or stdin.
async fn read_submission(file: Option<&std::path::Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read submission: {}", path.display())),
        None => {
            let mut code = String::new();
            tokio::io::stdin()
                .read_to_string(&mut code)
                .await
                .context("Failed to read submission from stdin")?;
            Ok(code)
        }
    }
}
