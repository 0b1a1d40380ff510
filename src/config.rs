//! Daemon configuration.
//!
//! Configuration is JSON, loaded either from a file or from the
//! `GRADEBOX_CONFIG` environment variable. Every field has a default so
//! an empty object is a valid configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration for the grading daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory containing per-student home directories.
    /// The grading script and the student's grade database live in
    /// `<student_root>/<student>/`.
    #[serde(default = "default_student_root")]
    pub student_root: PathBuf,

    /// SQLite URL of the central grading database (assignments + audit log).
    #[serde(default = "default_grading_db")]
    pub grading_db: String,

    /// Interpreter used to execute materialized grading scripts.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Wall-clock budget for one grading run, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Path to a harness template overriding the embedded one.
    #[serde(default)]
    pub template_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            student_root: default_student_root(),
            grading_db: default_grading_db(),
            interpreter: default_interpreter(),
            timeout_seconds: default_timeout(),
            template_path: None,
        }
    }
}

impl Config {
    /// Load configuration from the `GRADEBOX_CONFIG` environment variable,
    /// falling back to defaults when it is not set.
    pub fn from_env() -> Result<Self> {
        match std::env::var("GRADEBOX_CONFIG") {
            Ok(json) => Self::from_json(&json),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse configuration JSON")
    }

    /// Directory holding a student's grading script and grade database.
    pub fn student_dir(&self, student: &str) -> PathBuf {
        self.student_root.join(student)
    }
}

fn default_student_root() -> PathBuf {
    "/home".into()
}

fn default_grading_db() -> String {
    "sqlite://grading.sqlite3?mode=rwc".into()
}

fn default_interpreter() -> String {
    "python3".into()
}

const fn default_timeout() -> u64 {
    2
}
