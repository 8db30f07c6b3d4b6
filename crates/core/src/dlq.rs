//! Dead-letter queue operations.

use crate::error::Result;
use crate::job::{Job, JobState};
use crate::store::Store;

/// Thin layer over the store for inspecting and re-enqueueing
/// dead-lettered jobs.
pub struct DlqManager {
    store: Store,
}

impl DlqManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Quarantined jobs, newest first, with their last diagnostic.
    pub async fn list(&self, limit: i64) -> Result<Vec<Job>> {
        self.store.list(Some(JobState::Dlq), limit).await
    }

    /// Re-enqueue a dead job. Fails with `NotInDlq` for any other row.
    pub async fn retry(&self, job_id: i64) -> Result<()> {
        self.store.dlq_retry(job_id).await
    }
}
