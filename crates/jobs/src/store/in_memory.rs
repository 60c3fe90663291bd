use std::sync::Arc;

use chrono::{DateTime, Utc};

use csvforge_core::{ClientId, JobId};

use super::{JobCounts, JobIndex, JobStore, JobStoreError, JobTable, Mutator};
use crate::types::{JobFilter, JobRecord};

/// In-memory job store.
///
/// Intended for tests/dev: nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: JobTable,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn volatile(_: &JobIndex) -> Result<(), JobStoreError> {
    Ok(())
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        self.table.create(job, volatile)
    }

    fn get(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.table.get(job_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.table.list(filter))
    }

    fn update(&self, job_id: JobId, mutator: Mutator<'_>) -> Result<JobRecord, JobStoreError> {
        self.table.update(job_id, mutator, volatile)
    }

    fn delete(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.table.delete(job_id, volatile)
    }

    fn latest_trained(&self, client_id: ClientId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.table.latest_trained(client_id))
    }

    fn purge_finished(
        &self,
        cutoff: DateTime<Utc>,
        retain: &dyn Fn(&JobRecord) -> bool,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.table.purge_finished(cutoff, retain, volatile)
    }

    fn clients(&self) -> Result<Vec<ClientId>, JobStoreError> {
        Ok(self.table.clients())
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        Ok(self.table.counts())
    }
}
