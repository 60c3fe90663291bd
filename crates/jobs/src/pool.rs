//! Worker pool and admission control.
//!
//! A fixed set of worker threads, each owning its own engine instance. Jobs
//! are admitted into an unbounded FIFO queue and dispatched while fewer than
//! `max_workers` are active. Dispatch happens under the pool lock as part of
//! `submit` and of every job completion, so the counters reported by
//! [`WorkerPool::status`] are exact the moment `submit` returns.

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use csvforge_core::JobId;
use csvforge_engine::EngineFactory;

use crate::config::SchedulerConfig;
use crate::refinement::{panic_message, EngineSlot, RefinementController};
use crate::status::{PoolStats, QueueStatus};
use crate::store::{JobStore, JobStoreError};
use crate::types::JobStatus;

/// Result of [`WorkerPool::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("job {0} is already queued")]
    AlreadyQueued(JobId),
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
    #[error("job {0} does not exist")]
    NotFound(JobId),
    #[error("job {job_id} is {status} and cannot run")]
    NotRunnable { job_id: JobId, status: JobStatus },
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("store unavailable: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// An admitted job waiting for a worker.
#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    job_id: JobId,
    submitted_at: Instant,
}

#[derive(Debug, Default)]
struct Dispatch {
    /// Admitted, waiting for a free worker.
    queue: VecDeque<QueueEntry>,
    /// Dispatched, not yet picked up by a worker.
    ready: VecDeque<QueueEntry>,
    /// Dispatched jobs, picked up or not.
    active: HashSet<JobId>,
    stats: PoolStats,
    closed: bool,
}

impl Dispatch {
    /// Move queued jobs to workers while capacity allows.
    fn promote(&mut self, max_workers: usize) -> usize {
        let mut moved = 0;
        while !self.closed && self.active.len() < max_workers {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            self.active.insert(entry.job_id);
            self.ready.push_back(entry);
            moved += 1;
        }
        moved
    }

    fn is_queued(&self, job_id: JobId) -> bool {
        self.queue.iter().any(|e| e.job_id == job_id)
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }
}

struct Shared {
    name: String,
    max_workers: usize,
    attempt_timeout: Duration,
    store: Arc<dyn JobStore>,
    factory: Arc<dyn EngineFactory>,
    state: Mutex<Dispatch>,
    work: Condvar,
    idle: Condvar,
}

impl Shared {
    // Every critical section leaves `Dispatch` consistent, so a poisoned lock
    // is still usable.
    fn lock(&self) -> MutexGuard<'_, Dispatch> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_job(&self) -> Option<QueueEntry> {
        let mut state = self.lock();
        loop {
            if let Some(entry) = state.ready.pop_front() {
                return Some(entry);
            }
            if state.closed {
                return None;
            }
            state = self.work.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self, job_id: JobId, status: Option<JobStatus>, elapsed: Duration) {
        let mut state = self.lock();
        state.active.remove(&job_id);
        state.stats.record(status, elapsed);
        if state.promote(self.max_workers) > 0 {
            self.work.notify_all();
        }
        if state.is_idle() {
            self.idle.notify_all();
        }
    }

    fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        self.work.notify_all();
        self.idle.notify_all();
        state.queue.len()
    }
}

/// Fixed-size pool of job workers.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("max_workers", &self.shared.max_workers)
            .finish()
    }
}

impl WorkerPool {
    /// Start `config.max_workers` worker threads.
    pub fn spawn(
        config: &SchedulerConfig,
        store: Arc<dyn JobStore>,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, PoolError> {
        let max_workers = config.max_workers.max(1);
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            max_workers,
            attempt_timeout: config.attempt_timeout,
            store,
            factory,
            state: Mutex::new(Dispatch::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(max_workers),
        };
        for i in 0..max_workers {
            let shared = Arc::clone(&pool.shared);
            let name = format!("{}-worker-{i}", config.name);
            let worker = name.clone();
            // On error `pool` is dropped, which stops the workers already started.
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(shared, worker))?;
            pool.workers.push(handle);
        }

        info!(pool = %config.name, max_workers, "worker pool started");
        Ok(pool)
    }

    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// Admit a job for execution.
    ///
    /// The record must exist and be runnable, and the job must not already be
    /// queued or running in this pool.
    pub fn submit(&self, job_id: JobId) -> Admission {
        // The record is read under the pool lock so a removal made through
        // `with_tracked` cannot slip between the check and the enqueue.
        let mut state = self.shared.lock();
        let reason = if state.closed {
            Some(RejectReason::ShutDown)
        } else if state.active.contains(&job_id) {
            Some(RejectReason::AlreadyRunning(job_id))
        } else if state.is_queued(job_id) {
            Some(RejectReason::AlreadyQueued(job_id))
        } else {
            match self.shared.store.get(job_id) {
                Ok(job) if job.is_runnable() => None,
                Ok(job) => Some(RejectReason::NotRunnable {
                    job_id,
                    status: job.status,
                }),
                Err(JobStoreError::NotFound(_)) => Some(RejectReason::NotFound(job_id)),
                Err(e) => Some(RejectReason::Storage(e.to_string())),
            }
        };
        if let Some(reason) = reason {
            debug!(pool = %self.shared.name, job_id = %job_id, %reason, "job rejected");
            return Admission::Rejected(reason);
        }

        state.queue.push_back(QueueEntry {
            job_id,
            submitted_at: Instant::now(),
        });
        if state.promote(self.shared.max_workers) > 0 {
            self.shared.work.notify_all();
        }
        debug!(
            pool = %self.shared.name,
            job_id = %job_id,
            active = state.active.len(),
            queued = state.queue.len(),
            "job admitted"
        );
        Admission::Accepted
    }

    /// Whether the job is queued or running in this pool.
    pub fn is_tracked(&self, job_id: JobId) -> bool {
        self.with_tracked(|tracked| tracked(job_id))
    }

    /// Run `f` with admission and dispatch held, handing it a lookup for the
    /// jobs queued or running in this pool.
    ///
    /// Store changes made inside `f` are atomic with that lookup. Lock order
    /// is pool then store; workers never hold the pool lock while they touch
    /// the store.
    pub(crate) fn with_tracked<R>(&self, f: impl FnOnce(&dyn Fn(JobId) -> bool) -> R) -> R {
        let state = self.shared.lock();
        let tracked = |job_id: JobId| state.active.contains(&job_id) || state.is_queued(job_id);
        f(&tracked)
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.lock();
        QueueStatus::compute(
            self.shared.max_workers,
            state.active.iter().copied().collect(),
            state.queue.len(),
            &state.stats,
        )
    }

    /// Block until nothing is queued or running, or `timeout` passes.
    ///
    /// Returns whether the pool is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |s| !s.is_idle() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.is_idle()
    }

    /// Stop admitting and dispatching. Jobs already dispatched run to the end;
    /// queued jobs stay `queued` in the store.
    pub fn close(&self) {
        let left = self.shared.close();
        if left > 0 {
            info!(pool = %self.shared.name, queued = left, "pool closed with jobs still queued");
        }
    }

    /// Close and wait for all workers to exit.
    pub fn shutdown(mut self) {
        self.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        info!(pool = %self.shared.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shared.close();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, worker: String) {
    debug!(worker = %worker, "worker started");
    let mut engine = EngineSlot::new(Arc::clone(&shared.factory), worker.clone());

    while let Some(QueueEntry { job_id, submitted_at }) = shared.next_job() {
        let started = Instant::now();
        debug!(
            worker = %worker,
            job_id = %job_id,
            queued_ms = started.duration_since(submitted_at).as_millis() as u64,
            "job picked up"
        );
        let status = run_job(&shared, &mut engine, &worker, job_id);
        shared.finish(job_id, status, started.elapsed());
    }

    debug!(worker = %worker, "worker stopped");
}

/// Run one job; a panic or store fault never escapes the worker.
fn run_job(shared: &Shared, engine: &mut EngineSlot, worker: &str, job_id: JobId) -> Option<JobStatus> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        RefinementController::new(shared.store.as_ref(), engine, shared.attempt_timeout).run(job_id)
    }));

    let reason = match result {
        Ok(Ok(job)) => return Some(job.status),
        Ok(Err(e)) => {
            error!(worker = %worker, job_id = %job_id, error = %e, "job aborted");
            format!("job aborted: {e}")
        }
        Err(payload) => {
            engine.reset();
            let msg = panic_message(payload.as_ref());
            error!(worker = %worker, job_id = %job_id, panic = %msg, "worker panicked while running job");
            format!("worker panicked: {msg}")
        }
    };
    interrupt(shared.store.as_ref(), job_id, &reason)
}

/// Best-effort: close a record left `running` by an aborted run.
fn interrupt(store: &dyn JobStore, job_id: JobId, reason: &str) -> Option<JobStatus> {
    let result = store.update(job_id, &mut |job| {
        if job.status == JobStatus::Running {
            job.mark_interrupted(reason, Utc::now());
        }
        Ok(())
    });
    match result {
        Ok(job) => Some(job.status),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "could not record interruption");
            None
        }
    }
}
