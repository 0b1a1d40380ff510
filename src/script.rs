//! Grading-script materialization.
//!
//! Merges the fixed harness template with the student's submitted source
//! and run parameters into one executable script. Substitution is purely
//! textual: whatever the submission contains lands verbatim at the code
//! slot, and the harness's scoring call embeds the student handle and
//! assignment id into its SQL string unescaped. That injection surface is
//! inherited from the harness contract and deliberately left in place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Template slot markers.
const CODE_SLOT: &str = "__STUDENT_CODE__";
const STUDENT_SLOT: &str = "__STUDENT__";
const ASSIGNMENT_SLOT: &str = "__ASSIGNMENT__";

/// File name of the materialized script inside the student's directory.
pub const SCRIPT_NAME: &str = "grading_script.py";

/// The fixed grading-harness template.
#[derive(Debug, Clone)]
pub struct Harness {
    template: String,
}

impl Harness {
    /// The harness bundled with the daemon.
    pub fn embedded() -> Self {
        Self {
            template: include_str!("../harness/template.py").to_string(),
        }
    }

    /// Load a harness template from disk (config override).
    pub fn from_file(path: &Path) -> Result<Self> {
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read harness template: {}", path.display()))?;
        Ok(Self { template })
    }

    /// Build a harness from raw template text.
    pub fn from_template_text(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Substitute the three template slots and return the script text.
    ///
    /// The handle and assignment slots are filled first so that marker
    /// text inside the student's source is not expanded — the code slot
    /// receives the submission verbatim.
    pub fn render(&self, code: &str, student: &str, assignment_id: i64) -> String {
        self.template
            .replace(STUDENT_SLOT, student)
            .replace(ASSIGNMENT_SLOT, &assignment_id.to_string())
            .replace(CODE_SLOT, code)
    }
}

/// Write the rendered script to the student's fixed script path,
/// overwriting any previous attempt.
///
/// Concurrent attempts for the same student race on this path; the
/// orchestrator holds a per-student run lock across materialize + run to
/// keep overwrite and read mutually exclusive.
pub async fn materialize(student_dir: &Path, script: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(student_dir)
        .await
        .with_context(|| format!("Failed to create student dir: {}", student_dir.display()))?;

    let path = student_dir.join(SCRIPT_NAME);
    tokio::fs::write(&path, script)
        .await
        .with_context(|| format!("Failed to write grading script: {}", path.display()))?;

    debug!(path = %path.display(), bytes = script.len(), "Materialized grading script");
    Ok(path)
}
