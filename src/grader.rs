//! Grading orchestrator.
//!
//! Sequences the pipeline for one submission: open-check, script
//! materialization, identity resolution, demoted execution, output
//! interpretation, score read-back, and the audit record. Everything
//! past the open-check is error-contained: internal failures are logged
//! with full detail server-side and surfaced to the student only as a
//! generic message.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::identity::{Demotion, IdentityResolver};
use crate::outcome::{self, RunOutcome};
use crate::runner::ProcessRunner;
use crate::script::{self, Harness};
use crate::store::{
    AssignmentCache, AssignmentStore, AuditStore, GradeStore, SubmissionRecord,
};

/// Student-facing text for contained internal failures. Never includes
/// exception detail.
pub const SERVER_ERROR_MESSAGE: &str =
    "Something went wrong while grading your submission. Please contact the teaching team.";

/// Response payload for one grading attempt.
#[derive(Debug, Clone, Serialize)]
pub struct GradeResponse {
    pub output: String,
    pub error: String,
    pub score: i64,
}

impl GradeResponse {
    fn server_error() -> Self {
        Self {
            output: String::new(),
            error: SERVER_ERROR_MESSAGE.to_string(),
            score: 0,
        }
    }
}

/// Rejections issued before any isolation resources are spent. These are
/// the only errors `grade` surfaces; execution failures are contained
/// into the response instead.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("assignment {0} is not open for submission")]
    AssignmentClosed(i64),
    #[error("assignment {0} does not exist")]
    UnknownAssignment(i64),
}

/// Orchestrates grading attempts.
pub struct Grader {
    harness: Harness,
    runner: ProcessRunner,
    student_root: PathBuf,
    assignments: AssignmentCache,
    grades: Arc<dyn GradeStore>,
    audit: Arc<dyn AuditStore>,
    resolver: Arc<dyn IdentityResolver>,
    /// Per-student run lock. Grading attempts for the same handle are
    /// serialized so the script-path overwrite and the runner's read of
    /// that path cannot race across requests. Different students run in
    /// parallel (different locks).
    run_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl Grader {
    pub fn new(
        config: &Config,
        harness: Harness,
        assignments: Arc<dyn AssignmentStore>,
        grades: Arc<dyn GradeStore>,
        audit: Arc<dyn AuditStore>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            harness,
            runner: ProcessRunner::new(
                config.interpreter.clone(),
                Duration::from_secs(config.timeout_seconds),
            ),
            student_root: config.student_root.clone(),
            assignments: AssignmentCache::new(assignments),
            grades,
            audit,
            resolver,
            run_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Grade one submission.
    ///
    /// Closed or unknown assignments are rejected before any script is
    /// written or process spawned. Past that point exactly one audit
    /// record is appended per attempt, including failed ones.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub async fn grade(
        &self,
        student: &str,
        assignment_id: i64,
        code: &str,
    ) -> Result<GradeResponse, Rejection> {
        let assignment = match self.assignments.get(assignment_id).await {
            Ok(Some(assignment)) => assignment,
            Ok(None) => return Err(Rejection::UnknownAssignment(assignment_id)),
            Err(e) => {
                error!(assignment = assignment_id, error = ?e, "Assignment lookup failed");
                return Ok(GradeResponse::server_error());
            }
        };

        if !assignment.open {
            return Err(Rejection::AssignmentClosed(assignment_id));
        }

        let (output, error, score) = match self.attempt(student, assignment_id, code).await {
            Ok(outcome) => {
                let score = match self.grades.read_score(student, assignment_id).await {
                    Ok(score) => score,
                    Err(e) => {
                        error!(student, error = ?e, "Failed to read score after run");
                        0
                    }
                };
                (outcome.stdout, outcome.stderr, score)
            }
            Err(e) => {
                error!(student, assignment = assignment_id, error = ?e, "Grading attempt failed");
                (String::new(), SERVER_ERROR_MESSAGE.to_string(), 0)
            }
        };

        let record = SubmissionRecord {
            assignment_id,
            student_id: student.to_string(),
            code: code.to_string(),
            score,
            time: Utc::now(),
        };
        if let Err(e) = self.audit.append(&record).await {
            // The attempt already ran; losing the record is a served
            // response with a loud log, not a student-facing failure.
            error!(student, assignment = assignment_id, error = ?e, "Failed to append audit record");
        }

        info!(student, assignment = assignment_id, score, "Graded submission");
        Ok(GradeResponse {
            output,
            error,
            score,
        })
    }

    /// Materialize and execute one attempt under the per-student lock.
    async fn attempt(&self, student: &str, assignment_id: i64, code: &str) -> Result<RunOutcome> {
        let run_lock = self.get_run_lock(student).await;
        let _guard = run_lock.lock().await;

        let script_text = self.harness.render(code, student, assignment_id);
        let script_path =
            script::materialize(&self.student_root.join(student), &script_text).await?;

        // Resolved fresh every run; OS account state may have changed.
        let demotion = self.resolver.resolve(student)?;
        if matches!(demotion, Demotion::Unavailable) {
            warn!(student, "Degraded-security run: privilege demotion unavailable");
        }

        let captured = self.runner.run(&script_path, &demotion).await?;
        Ok(outcome::interpret(captured, self.runner.timeout()))
    }

    /// Get or create the per-student run lock.
    async fn get_run_lock(&self, student: &str) -> Arc<Mutex<()>> {
        // Fast path: read lock
        {
            let locks = self.run_locks.read().await;
            if let Some(lock) = locks.get(student) {
                return Arc::clone(lock);
            }
        }
        // Slow path: create, dropping locks no in-flight attempt holds
        // so the map stays bounded by concurrent students, not by every
        // handle ever seen
        let mut locks = self.run_locks.write().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(
            locks
                .entry(student.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Invalidate a cached assignment (call after editing the catalog).
    pub async fn invalidate_assignment(&self, id: i64) {
        self.assignments.invalidate(id).await;
    }
}
