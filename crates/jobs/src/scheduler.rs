//! Scheduler facade: the entry point for a request-handling layer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use csvforge_core::{ArtifactRef, ClientId, JobId};
use csvforge_engine::{ArtifactStore, EngineFactory, Instructions};

use crate::config::SchedulerConfig;
use crate::pool::{Admission, PoolError, RejectReason, WorkerPool};
use crate::status::QueueStatus;
use crate::store::{FileJobStore, JobCounts, JobStore, JobStoreError};
use crate::types::{JobFilter, JobRecord, JobStatus};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("job rejected: {0}")]
    Rejected(RejectReason),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Request to train a script for a client.
#[derive(Debug, Clone)]
pub struct NewTrainingJob {
    pub client_id: ClientId,
    pub input_ref: ArtifactRef,
    pub expected_output_ref: ArtifactRef,
    pub instructions: Instructions,
    /// Overrides the configured refinement budget.
    pub max_attempts: Option<u32>,
}

impl NewTrainingJob {
    pub fn new(client_id: ClientId, input_ref: ArtifactRef, expected_output_ref: ArtifactRef) -> Self {
        Self {
            client_id,
            input_ref,
            expected_output_ref,
            instructions: Instructions::default(),
            max_attempts: None,
        }
    }

    pub fn with_instructions(mut self, instructions: Instructions) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Request to run a trained script on new input.
#[derive(Debug, Clone)]
pub struct NewInferenceJob {
    pub client_id: ClientId,
    pub input_ref: ArtifactRef,
    /// `None` uses the client's latest trained script.
    pub script_ref: Option<ArtifactRef>,
    pub instructions: Instructions,
}

impl NewInferenceJob {
    pub fn new(client_id: ClientId, input_ref: ArtifactRef) -> Self {
        Self {
            client_id,
            input_ref,
            script_ref: None,
            instructions: Instructions::default(),
        }
    }

    pub fn with_script(mut self, script_ref: ArtifactRef) -> Self {
        self.script_ref = Some(script_ref);
        self
    }

    pub fn with_instructions(mut self, instructions: Instructions) -> Self {
        self.instructions = instructions;
        self
    }
}

/// Job store, worker pool and artifact store behind one API.
pub struct JobScheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    pool: WorkerPool,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

impl JobScheduler {
    /// Start the worker pool on top of `store`.
    ///
    /// Records left `queued` by a previous process are not picked up until
    /// [`JobScheduler::recover_queued`] is called.
    pub fn start(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        factory: Arc<dyn EngineFactory>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self, SchedulerError> {
        let pool = WorkerPool::spawn(&config, Arc::clone(&store), factory)?;
        info!(scheduler = %config.name, max_workers = pool.max_workers(), "scheduler started");
        Ok(Self {
            config,
            store,
            artifacts,
            pool,
        })
    }

    /// Open the file store at `config.store_path`, start, and re-admit
    /// queued jobs.
    pub fn open(
        config: SchedulerConfig,
        factory: Arc<dyn EngineFactory>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self, SchedulerError> {
        let store = FileJobStore::open(&config.store_path)?;
        let scheduler = Self::start(config, Arc::new(store), factory, artifacts)?;
        scheduler.recover_queued()?;
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn submit_training(&self, job: NewTrainingJob) -> Result<JobId, SchedulerError> {
        let record = JobRecord::training(job.client_id, job.input_ref, job.expected_output_ref)
            .with_instructions(job.instructions)
            .with_max_attempts(job.max_attempts.unwrap_or(self.config.max_attempts));
        self.create_and_admit(record)
    }

    pub fn submit_inference(&self, job: NewInferenceJob) -> Result<JobId, SchedulerError> {
        let record = JobRecord::inference(job.client_id, job.input_ref, job.script_ref)
            .with_instructions(job.instructions);
        self.create_and_admit(record)
    }

    fn create_and_admit(&self, record: JobRecord) -> Result<JobId, SchedulerError> {
        let job_id = self.store.create(record)?;
        self.admit(job_id)?;
        Ok(job_id)
    }

    fn admit(&self, job_id: JobId) -> Result<(), SchedulerError> {
        match self.pool.submit(job_id) {
            Admission::Accepted => Ok(()),
            Admission::Rejected(reason) => Err(SchedulerError::Rejected(reason)),
        }
    }

    /// Admit an existing record again, typically one that was interrupted
    /// with attempts left.
    pub fn resubmit(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.admit(job_id)
    }

    pub fn get(&self, job_id: JobId) -> Result<JobRecord, SchedulerError> {
        Ok(self.store.get(job_id)?)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, SchedulerError> {
        Ok(self.store.list(filter)?)
    }

    pub fn counts(&self) -> Result<JobCounts, SchedulerError> {
        Ok(self.store.counts()?)
    }

    /// Clients with at least one job on record.
    pub fn clients(&self) -> Result<Vec<ClientId>, SchedulerError> {
        Ok(self.store.clients()?)
    }

    /// Delete a finished job and its artifacts.
    ///
    /// A job queued or running in the pool is refused even when its record is
    /// still `failed` from an earlier run. Artifact removal is best-effort:
    /// once the record is gone a failed removal is only logged.
    pub fn delete(&self, job_id: JobId) -> Result<JobRecord, SchedulerError> {
        let removed = self.pool.with_tracked(|tracked| {
            if tracked(job_id) {
                return Err(JobStoreError::Conflict(format!(
                    "job {job_id} is scheduled; delete it once it finishes"
                )));
            }
            self.store.delete(job_id)
        })?;
        self.remove_artifacts(&removed);
        info!(job_id = %job_id, "job deleted");
        Ok(removed)
    }

    fn remove_artifacts(&self, job: &JobRecord) {
        for artifact in job.artifacts() {
            if let Err(e) = self.artifacts.remove(artifact) {
                warn!(job_id = %job.id, artifact = %artifact, error = %e, "failed to remove artifact");
            }
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.pool.status()
    }

    /// Re-admit records left `queued`, oldest first. Returns the admitted ids.
    pub fn recover_queued(&self) -> Result<Vec<JobId>, SchedulerError> {
        let queued = self.store.list(&JobFilter::all().with_status(JobStatus::Queued))?;
        let mut admitted = Vec::with_capacity(queued.len());
        for job in queued {
            match self.pool.submit(job.id) {
                Admission::Accepted => admitted.push(job.id),
                Admission::Rejected(reason) => {
                    warn!(job_id = %job.id, %reason, "queued job not recovered");
                }
            }
        }
        if !admitted.is_empty() {
            info!(count = admitted.len(), "re-admitted queued jobs");
        }
        Ok(admitted)
    }

    /// Delete finished jobs completed more than `max_age` ago, with their
    /// artifacts. Returns the removed ids.
    ///
    /// Jobs admitted again after they finished are kept until they are done.
    pub fn purge_finished(&self, max_age: Duration) -> Result<Vec<JobId>, SchedulerError> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };
        let removed = self
            .pool
            .with_tracked(|tracked| self.store.purge_finished(cutoff, &|job| tracked(job.id)))?;
        for job in &removed {
            self.remove_artifacts(job);
        }
        Ok(removed.into_iter().map(|j| j.id).collect())
    }

    /// Block until nothing is queued or running, or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    /// Stop dispatching, let running jobs finish and join the workers.
    pub fn shutdown(self) {
        info!(scheduler = %self.config.name, "scheduler shutting down");
        self.pool.shutdown();
    }
}
