//! Store boundary traits and the assignment cache.
//!
//! The grading pipeline consumes three external stores: the assignment
//! catalog, the per-student grade store the executed harness writes to,
//! and the append-only audit log. The pipeline itself never writes
//! scores — it reads them back after execution.

mod sqlite;

pub use sqlite::{GradingDb, StudentGradeDb};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// One assignment in the course catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub starting_code: String,
    pub due: String,
    pub open: bool,
}

/// One grading attempt, as recorded in the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRecord {
    pub assignment_id: i64,
    pub student_id: String,
    pub code: String,
    pub score: i64,
    pub time: DateTime<Utc>,
}

/// Assignment catalog lookups.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn fetch(&self, id: i64) -> Result<Option<Assignment>>;
    async fn list(&self) -> Result<Vec<Assignment>>;
}

/// Read-only view of a student's grade store.
///
/// The executed harness script writes scores as a side effect; this
/// trait only reads the authoritative result back.
#[async_trait]
pub trait GradeStore: Send + Sync {
    /// Score for one assignment, 0 if absent.
    async fn read_score(&self, student: &str, assignment_id: i64) -> Result<i64>;

    /// All scores for a student, keyed by assignment id.
    async fn read_all_scores(&self, student: &str) -> Result<HashMap<i64, i64>>;
}

/// Append-only audit log of grading attempts.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &SubmissionRecord) -> Result<()>;
}

/// Read-through cache over the assignment catalog.
///
/// Explicitly scoped with an invalidation hook — edit paths call
/// `invalidate` so stale entries never outlive an assignment change.
pub struct AssignmentCache {
    store: Arc<dyn AssignmentStore>,
    entries: RwLock<HashMap<i64, Arc<Assignment>>>,
}

impl AssignmentCache {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch an assignment, serving from cache when possible.
    pub async fn get(&self, id: i64) -> Result<Option<Arc<Assignment>>> {
        {
            let entries = self.entries.read().await;
            if let Some(assignment) = entries.get(&id) {
                return Ok(Some(Arc::clone(assignment)));
            }
        }

        let Some(assignment) = self.store.fetch(id).await? else {
            return Ok(None);
        };

        let assignment = Arc::new(assignment);
        self.entries
            .write()
            .await
            .insert(id, Arc::clone(&assignment));
        debug!(assignment = id, "Cached assignment");
        Ok(Some(assignment))
    }

    /// Drop one cached assignment (call after editing it).
    pub async fn invalidate(&self, id: i64) {
        self.entries.write().await.remove(&id);
    }

    /// Drop the whole cache.
    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        fetches: AtomicUsize,
        open: bool,
    }

    #[async_trait]
    impl AssignmentStore for CountingStore {
        async fn fetch(&self, id: i64) -> Result<Option<Assignment>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if id == 4 {
                Ok(Some(Assignment {
                    id: 4,
                    title: "Calculate max".to_string(),
                    description: String::new(),
                    starting_code: String::new(),
                    due: "September 7".to_string(),
                    open: self.open,
                }))
            } else {
                Ok(None)
            }
        }

        async fn list(&self) -> Result<Vec<Assignment>> {
            Ok(Vec::new())
        }
    }

    fn counting_cache() -> (Arc<CountingStore>, AssignmentCache) {
        let store = Arc::new(CountingStore {
            fetches: AtomicUsize::new(0),
            open: true,
        });
        let cache = AssignmentCache::new(Arc::clone(&store) as Arc<dyn AssignmentStore>);
        (store, cache)
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let (store, cache) = counting_cache();

        assert!(cache.get(4).await.unwrap().is_some());
        assert!(cache.get(4).await.unwrap().is_some());
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_reload() {
        let (store, cache) = counting_cache();

        cache.get(4).await.unwrap();
        cache.invalidate(4).await;
        cache.get(4).await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn misses_are_not_cached() {
        let (store, cache) = counting_cache();

        assert!(cache.get(99).await.unwrap().is_none());
        assert!(cache.get(99).await.unwrap().is_none());
        // A later seed of assignment 99 must be visible immediately
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_all_clears_every_entry() {
        let (store, cache) = counting_cache();

        cache.get(4).await.unwrap();
        cache.invalidate_all().await;
        cache.get(4).await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }
}
