//! SQLite-backed store implementations.
//!
//! The central grading database holds the assignment catalog and the
//! append-only submission log. Each student additionally has their own
//! `database.sqlite3` under their home directory, which the executed
//! harness writes scores into and which `StudentGradeDb` reads back.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, QueryResult, Statement};
use tracing::{debug, info};

use super::{Assignment, AssignmentStore, AuditStore, GradeStore, SubmissionRecord};

/// Central grading database: assignment catalog + audit log.
pub struct GradingDb {
    db: DatabaseConnection,
}

impl GradingDb {
    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let db = Database::connect(url)
            .await
            .with_context(|| format!("Failed to open grading database: {url}"))?;

        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                starting_code TEXT NOT NULL,
                due TEXT NOT NULL,
                open INTEGER NOT NULL
            )",
        )
        .await
        .context("Failed to create assignments table")?;

        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS submissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                assignment_id INTEGER NOT NULL,
                student_id TEXT NOT NULL,
                code TEXT NOT NULL,
                grade INTEGER NOT NULL,
                time TEXT NOT NULL
            )",
        )
        .await
        .context("Failed to create submissions table")?;

        Ok(Self { db })
    }

    /// Insert the course assignments (idempotent).
    pub async fn seed(&self) -> Result<()> {
        let assignments = [
            (
                1_i64,
                "Add two numbers",
                "Write a function called \"add\" which adds two numbers.",
                "def add(a, b):\n    a = 1\n    return b + 1",
                "August 2",
                false,
            ),
            (
                2,
                "Print a list",
                "Write a function called \"print_list\" which prints out each value in a list.",
                "def print_list(x):\n    return x[0] + x[1] + x[2]",
                "August 9",
                false,
            ),
            (
                3,
                "Read a dictionary",
                "Write a function called \"get_height\" which takes a dictionary with strings as keys, and returns the value of the key \"height\".",
                "def get_height(x):\n    return x[\"hieght\"]",
                "August 16",
                false,
            ),
            (
                4,
                "Calculate max",
                "Write a function called \"find_max\" which takes a list and returns the largest value.",
                "def find_max(x):\n    return x",
                "September 7",
                true,
            ),
        ];

        for (id, title, description, starting_code, due, open) in assignments {
            self.db
                .execute(Statement::from_sql_and_values(
                    DbBackend::Sqlite,
                    "INSERT OR REPLACE INTO assignments (id, title, description, starting_code, due, open)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    [
                        id.into(),
                        title.into(),
                        description.into(),
                        starting_code.into(),
                        due.into(),
                        open.into(),
                    ],
                ))
                .await
                .with_context(|| format!("Failed to seed assignment {id}"))?;
        }

        info!(count = assignments.len(), "Seeded assignment catalog");
        Ok(())
    }
}

fn assignment_from(row: &QueryResult) -> Result<Assignment> {
    Ok(Assignment {
        id: row.try_get("", "id")?,
        title: row.try_get("", "title")?,
        description: row.try_get("", "description")?,
        starting_code: row.try_get("", "starting_code")?,
        due: row.try_get("", "due")?,
        open: row.try_get::<i64>("", "open")? != 0,
    })
}

#[async_trait]
impl AssignmentStore for GradingDb {
    async fn fetch(&self, id: i64) -> Result<Option<Assignment>> {
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT id, title, description, starting_code, due, open
                 FROM assignments WHERE id = ?",
                [id.into()],
            ))
            .await
            .context("Failed to query assignment")?;

        row.as_ref().map(assignment_from).transpose()
    }

    async fn list(&self) -> Result<Vec<Assignment>> {
        let rows = self
            .db
            .query_all(Statement::from_string(
                DbBackend::Sqlite,
                "SELECT id, title, description, starting_code, due, open
                 FROM assignments ORDER BY id",
            ))
            .await
            .context("Failed to list assignments")?;

        rows.iter().map(assignment_from).collect()
    }
}

#[async_trait]
impl AuditStore for GradingDb {
    async fn append(&self, record: &SubmissionRecord) -> Result<()> {
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO submissions (assignment_id, student_id, code, grade, time)
                 VALUES (?, ?, ?, ?, ?)",
                [
                    record.assignment_id.into(),
                    record.student_id.as_str().into(),
                    record.code.as_str().into(),
                    record.score.into(),
                    record.time.to_rfc3339().into(),
                ],
            ))
            .await
            .context("Failed to append submission record")?;

        debug!(
            student = %record.student_id,
            assignment = record.assignment_id,
            score = record.score,
            "Appended audit record"
        );
        Ok(())
    }
}

/// Per-student grade database under `<student_root>/<student>/`.
///
/// A fresh connection is opened per read — the file is owned by the
/// student's account and may be replaced between runs.
pub struct StudentGradeDb {
    student_root: PathBuf,
}

/// The harness writes the percent as a float; older rows are seeded as
/// integers. Accept both.
fn score_from(row: &QueryResult, column: &str) -> Result<i64> {
    if let Ok(score) = row.try_get::<i64>("", column) {
        return Ok(score);
    }
    let score: f64 = row.try_get("", column)?;
    #[allow(clippy::cast_possible_truncation)]
    Ok(score.round() as i64)
}

impl StudentGradeDb {
    pub fn new(student_root: impl Into<PathBuf>) -> Self {
        Self {
            student_root: student_root.into(),
        }
    }

    fn db_path(&self, student: &str) -> PathBuf {
        self.student_root.join(student).join("database.sqlite3")
    }

    async fn open(&self, student: &str) -> Result<DatabaseConnection> {
        let path = self.db_path(student);
        Database::connect(format!("sqlite://{}", path.display()))
            .await
            .with_context(|| format!("Failed to open grade database: {}", path.display()))
    }

    /// Create and zero a student's grade table for the given assignments.
    pub async fn init_student(&self, student: &str, assignment_ids: &[i64]) -> Result<()> {
        let dir = self.student_root.join(student);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create student dir: {}", dir.display()))?;

        let path = self.db_path(student);
        let db = Database::connect(format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .with_context(|| format!("Failed to create grade database: {}", path.display()))?;

        db.execute_unprepared(
            "CREATE TABLE IF NOT EXISTS grades (student TEXT, assignment INT, score INT)",
        )
        .await
        .context("Failed to create grades table")?;

        for id in assignment_ids {
            db.execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO grades (student, assignment, score)
                 SELECT ?, ?, 0
                 WHERE NOT EXISTS (SELECT 1 FROM grades WHERE student = ? AND assignment = ?)",
                [student.into(), (*id).into(), student.into(), (*id).into()],
            ))
            .await
            .context("Failed to seed grade row")?;
        }

        info!(student, db = %path.display(), "Initialized student grade database");
        Ok(())
    }
}

#[async_trait]
impl GradeStore for StudentGradeDb {
    async fn read_score(&self, student: &str, assignment_id: i64) -> Result<i64> {
        let db = self.open(student).await?;
        let row = db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT score FROM grades WHERE student = ? AND assignment = ?",
                [student.into(), assignment_id.into()],
            ))
            .await
            .context("Failed to query score")?;

        match row {
            Some(row) => score_from(&row, "score"),
            None => Ok(0),
        }
    }

    async fn read_all_scores(&self, student: &str) -> Result<HashMap<i64, i64>> {
        let db = self.open(student).await?;
        let rows = db
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT assignment, score FROM grades WHERE student = ?",
                [student.into()],
            ))
            .await
            .context("Failed to query scores")?;

        rows.iter()
            .map(|row| -> Result<(i64, i64)> {
                Ok((row.try_get::<i64>("", "assignment")?, score_from(row, "score")?))
            })
            .collect()
    }
}
