//! Job record storage.
//!
//! A store is a map from job id to [`JobRecord`] guarded by one store-wide
//! reader/writer lock: any number of `get`/`list` calls run in parallel and
//! only wait for the exclusive section of an in-flight write. `update` is the
//! single mutation path once a record exists.
//!
//! Ids are never handed out twice: the ids of deleted and purged records are
//! kept as tombstones and `create` refuses them like live ones.

pub mod file;
pub mod in_memory;

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use csvforge_core::{ClientId, JobId};

use crate::types::{JobFilter, JobMode, JobRecord, JobStatus, TransitionError};

pub use file::FileJobStore;
pub use in_memory::InMemoryJobStore;

/// Mutator applied by [`JobStore::update`].
///
/// It receives a working copy; returning an error discards the copy.
pub type Mutator<'a> = &'a mut dyn FnMut(&mut JobRecord) -> Result<(), JobStoreError>;

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert a new record; its id must not be present.
    fn create(&self, job: JobRecord) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<JobRecord, JobStoreError>;

    /// List jobs matching the filter, oldest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Atomic read-modify-write of one record.
    ///
    /// The committed record is returned once it is durable.
    fn update(&self, job_id: JobId, mutator: Mutator<'_>) -> Result<JobRecord, JobStoreError>;

    /// Remove a record that is neither queued nor running.
    fn delete(&self, job_id: JobId) -> Result<JobRecord, JobStoreError>;

    /// Newest succeeded training job of a client that produced a script.
    fn latest_trained(&self, client_id: ClientId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Drop finished jobs completed before `cutoff`, except those `retain`
    /// keeps; returns what was removed.
    ///
    /// `retain` is evaluated under the write lock, together with the removal.
    fn purge_finished(
        &self,
        cutoff: DateTime<Utc>,
        retain: &dyn Fn(&JobRecord) -> bool,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Distinct clients that own at least one record.
    fn clients(&self) -> Result<Vec<ClientId>, JobStoreError>;

    /// Number of records per status.
    fn counts(&self) -> Result<JobCounts, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<TransitionError> for JobStoreError {
    fn from(err: TransitionError) -> Self {
        JobStoreError::Conflict(err.to_string())
    }
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.succeeded + self.failed
    }
}

pub(crate) type Jobs = HashMap<JobId, JobRecord>;

/// Everything a store keeps: live records and the tombstones of removed ones.
#[derive(Debug, Default)]
pub(crate) struct JobIndex {
    pub(crate) jobs: Jobs,
    pub(crate) retired: BTreeSet<JobId>,
}

/// Lock-guarded job index shared by the store implementations.
///
/// Every write runs `commit` on the would-be state while still holding the
/// write lock and rolls back when it fails, so neither readers nor later
/// writers ever see a change that was not committed.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    index: RwLock<JobIndex>,
}

impl JobTable {
    pub(crate) fn from_index(index: JobIndex) -> Self {
        Self {
            index: RwLock::new(index),
        }
    }

    // A writer that panicked never left a half-applied record behind (changes
    // are rolled back or complete), so a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, JobIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn create<C>(&self, job: JobRecord, commit: C) -> Result<JobId, JobStoreError>
    where
        C: FnOnce(&JobIndex) -> Result<(), JobStoreError>,
    {
        job.check_new()?;
        let mut index = self.write();
        if index.jobs.contains_key(&job.id) || index.retired.contains(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        index.jobs.insert(id, job);
        if let Err(e) = commit(&index) {
            index.jobs.remove(&id);
            return Err(e);
        }
        debug!(job_id = %id, "job created");
        Ok(id)
    }

    pub(crate) fn get(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.read()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(JobStoreError::NotFound(job_id))
    }

    pub(crate) fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let index = self.read();
        let mut result: Vec<_> = index
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();

        // Sort by created_at to ensure FIFO
        result.sort_by_key(|j| (j.created_at, j.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        result
    }

    pub(crate) fn update<C>(
        &self,
        job_id: JobId,
        mutator: Mutator<'_>,
        commit: C,
    ) -> Result<JobRecord, JobStoreError>
    where
        C: FnOnce(&JobIndex) -> Result<(), JobStoreError>,
    {
        let mut index = self.write();
        let current = index.jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut next = current.clone();
        mutator(&mut next)?;

        if next.id != current.id || next.created_at != current.created_at || next.mode != current.mode {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id}: id, mode and created_at are immutable"
            )));
        }
        if !current.allows_transition_to(next.status) {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id}: illegal transition {} -> {}",
                current.status, next.status
            )));
        }
        if next.attempt_count < current.attempt_count
            || next.feedback_history.len() < current.feedback_history.len()
        {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id}: attempts and feedback are append-only"
            )));
        }
        next.check_invariants()?;
        next.updated_at = current.updated_at.max(Utc::now());

        let previous = index.jobs.insert(job_id, next.clone());
        if let Err(e) = commit(&index) {
            if let Some(previous) = previous {
                index.jobs.insert(job_id, previous);
            }
            return Err(e);
        }
        Ok(next)
    }

    pub(crate) fn delete<C>(&self, job_id: JobId, commit: C) -> Result<JobRecord, JobStoreError>
    where
        C: FnOnce(&JobIndex) -> Result<(), JobStoreError>,
    {
        let mut index = self.write();
        let current = index.jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if current.status.is_active() {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id} is {}; delete it once it finishes",
                current.status
            )));
        }
        let removed = index
            .jobs
            .remove(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        index.retired.insert(job_id);
        if let Err(e) = commit(&index) {
            index.retired.remove(&job_id);
            index.jobs.insert(job_id, removed);
            return Err(e);
        }
        debug!(job_id = %job_id, "job deleted");
        Ok(removed)
    }

    pub(crate) fn latest_trained(&self, client_id: ClientId) -> Option<JobRecord> {
        self.read()
            .jobs
            .values()
            .filter(|j| {
                j.client_id == client_id
                    && j.mode == JobMode::Training
                    && j.status == JobStatus::Succeeded
                    && j.script_ref.is_some()
            })
            .max_by_key(|j| (j.completed_at, j.created_at))
            .cloned()
    }

    pub(crate) fn purge_finished<C>(
        &self,
        cutoff: DateTime<Utc>,
        retain: &dyn Fn(&JobRecord) -> bool,
        commit: C,
    ) -> Result<Vec<JobRecord>, JobStoreError>
    where
        C: FnOnce(&JobIndex) -> Result<(), JobStoreError>,
    {
        let mut index = self.write();
        let expired: Vec<JobId> = index
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
            .filter(|j| !retain(j))
            .map(|j| j.id)
            .collect();
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let removed: Vec<JobRecord> = expired
            .iter()
            .filter_map(|id| index.jobs.remove(id))
            .collect();
        index.retired.extend(expired.iter().copied());
        if let Err(e) = commit(&index) {
            for job in removed {
                index.retired.remove(&job.id);
                index.jobs.insert(job.id, job);
            }
            return Err(e);
        }
        debug!(count = removed.len(), "purged finished jobs");
        Ok(removed)
    }

    pub(crate) fn clients(&self) -> Vec<ClientId> {
        let clients: BTreeSet<ClientId> = self.read().jobs.values().map(|j| j.client_id).collect();
        clients.into_iter().collect()
    }

    pub(crate) fn counts(&self) -> JobCounts {
        let index = self.read();
        let mut counts = JobCounts::default();
        for job in index.jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

impl<S: JobStore + ?Sized> JobStore for std::sync::Arc<S> {
    fn create(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        (**self).create(job)
    }

    fn get(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        (**self).get(job_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list(filter)
    }

    fn update(&self, job_id: JobId, mutator: Mutator<'_>) -> Result<JobRecord, JobStoreError> {
        (**self).update(job_id, mutator)
    }

    fn delete(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        (**self).delete(job_id)
    }

    fn latest_trained(&self, client_id: ClientId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).latest_trained(client_id)
    }

    fn purge_finished(
        &self,
        cutoff: DateTime<Utc>,
        retain: &dyn Fn(&JobRecord) -> bool,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).purge_finished(cutoff, retain)
    }

    fn clients(&self) -> Result<Vec<ClientId>, JobStoreError> {
        (**self).clients()
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        (**self).counts()
    }
}
