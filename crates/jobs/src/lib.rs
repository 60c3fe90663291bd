//! `csvforge-jobs`
//!
//! Conversion job scheduling: durable job records, a bounded worker pool and
//! the refinement loop that turns an engine's attempts into a finished job.
//!
//! ## Design
//!
//! - Every job is a [`JobRecord`] owned by a [`JobStore`]; the store's
//!   `update` is the only way a record changes after creation
//! - Admission never blocks and never rejects for capacity; the queue is
//!   unbounded and strictly FIFO
//! - At most `max_workers` jobs run at once, each on its own worker thread
//!   with its own engine instance
//! - Training jobs retry with accumulated feedback until the engine accepts a
//!   script or the attempt budget is spent; inference runs once
//!
//! ## Components
//!
//! - `JobStore`: in-memory or file-backed record storage
//! - `WorkerPool`: admission, dispatch and queue status
//! - `RefinementController`: runs one job to a terminal state
//! - `JobScheduler`: facade over the three

pub mod config;
pub mod pool;
pub mod refinement;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod types;

pub use config::{ConfigError, SchedulerConfig};
pub use pool::{Admission, PoolError, RejectReason, WorkerPool};
pub use refinement::{ControllerError, EngineSlot, RefinementController};
pub use scheduler::{JobScheduler, NewInferenceJob, NewTrainingJob, SchedulerError};
pub use status::QueueStatus;
pub use store::{FileJobStore, InMemoryJobStore, JobCounts, JobStore, JobStoreError, Mutator};
pub use types::{JobError, JobFilter, JobMode, JobRecord, JobStatus, TransitionError, DEFAULT_MAX_ATTEMPTS};
