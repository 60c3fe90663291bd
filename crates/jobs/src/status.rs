//! Queue status snapshot and pool runtime statistics.

use std::time::Duration;

use serde::Serialize;

use csvforge_core::JobId;

use crate::types::JobStatus;

/// Point-in-time view of the worker pool.
///
/// Computed from counters only, so two calls with no scheduling event in
/// between return equal values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub max_workers: usize,
    pub active_jobs: usize,
    pub available_workers: usize,
    pub queue_size: usize,
    pub workers_busy_percent: f64,
    /// The queue is unbounded; admission never rejects for capacity.
    pub can_accept_new_jobs: bool,
    /// `None` until at least one job has finished.
    pub estimated_wait_secs: Option<f64>,
    pub active_job_ids: Vec<JobId>,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
}

impl QueueStatus {
    pub(crate) fn compute(
        max_workers: usize,
        mut active_job_ids: Vec<JobId>,
        queue_size: usize,
        stats: &PoolStats,
    ) -> Self {
        active_job_ids.sort();
        let active_jobs = active_job_ids.len();
        let workers_busy_percent = if max_workers == 0 {
            0.0
        } else {
            active_jobs as f64 / max_workers as f64 * 100.0
        };
        let estimated_wait_secs = stats.average_job_duration().map(|avg| {
            if queue_size == 0 {
                0.0
            } else {
                queue_size as f64 / max_workers.max(1) as f64 * avg.as_secs_f64()
            }
        });

        Self {
            max_workers,
            active_jobs,
            available_workers: max_workers.saturating_sub(active_jobs),
            queue_size,
            workers_busy_percent,
            can_accept_new_jobs: true,
            estimated_wait_secs,
            active_job_ids,
            jobs_processed: stats.jobs_processed,
            jobs_succeeded: stats.jobs_succeeded,
            jobs_failed: stats.jobs_failed,
        }
    }

    pub fn estimated_wait(&self) -> Option<Duration> {
        self.estimated_wait_secs.map(Duration::from_secs_f64)
    }

    pub fn is_idle(&self) -> bool {
        self.active_jobs == 0 && self.queue_size == 0
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default)]
pub(crate) struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    run_time: Duration,
}

impl PoolStats {
    /// Count one finished job; `None` means the worker could not tell.
    pub fn record(&mut self, status: Option<JobStatus>, elapsed: Duration) {
        self.jobs_processed += 1;
        self.run_time += elapsed;
        match status {
            Some(JobStatus::Succeeded) => self.jobs_succeeded += 1,
            _ => self.jobs_failed += 1,
        }
    }

    pub fn average_job_duration(&self) -> Option<Duration> {
        let n = u32::try_from(self.jobs_processed).ok().filter(|n| *n > 0)?;
        Some(self.run_time / n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_has_no_wait_estimate() {
        let status = QueueStatus::compute(4, Vec::new(), 0, &PoolStats::default());
        assert_eq!(status.available_workers, 4);
        assert_eq!(status.workers_busy_percent, 0.0);
        assert!(status.estimated_wait().is_none());
        assert!(status.is_idle());
        assert!(status.can_accept_new_jobs);
    }

    #[test]
    fn wait_scales_with_queue_per_worker() {
        let mut stats = PoolStats::default();
        stats.record(Some(JobStatus::Succeeded), Duration::from_secs(10));
        stats.record(Some(JobStatus::Failed), Duration::from_secs(30));
        assert_eq!(stats.average_job_duration(), Some(Duration::from_secs(20)));

        let ids = vec![JobId::new(), JobId::new()];
        let status = QueueStatus::compute(2, ids, 4, &stats);
        assert_eq!(status.active_jobs, 2);
        assert_eq!(status.available_workers, 0);
        assert_eq!(status.workers_busy_percent, 100.0);
        assert_eq!(status.estimated_wait(), Some(Duration::from_secs(40)));
        assert_eq!(status.jobs_processed, 2);
        assert_eq!(status.jobs_succeeded, 1);
        assert_eq!(status.jobs_failed, 1);
    }

    #[test]
    fn active_ids_are_sorted() {
        let mut ids = vec![JobId::new(), JobId::new(), JobId::new()];
        ids.reverse();
        let status = QueueStatus::compute(3, ids.clone(), 0, &PoolStats::default());
        ids.sort();
        assert_eq!(status.active_job_ids, ids);
    }
}
