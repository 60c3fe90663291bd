//! Job record types and the state transitions a controller may apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use csvforge_core::{ArtifactRef, ClientId, JobId};
use csvforge_engine::{AttemptFeedback, FailureKind, FeedbackRecord, Instructions};

/// Default refinement budget for training jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Whether a job trains a new script or runs an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Training,
    Inference,
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for a worker
    Queued,
    /// Owned by a refinement controller
    Running,
    /// Produced an accepted script and result
    Succeeded,
    /// Attempts exhausted or execution interrupted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Queued or running: a worker holds or will hold the record.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

/// A transition was attempted from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id}: {reason}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub reason: String,
}

/// Durable state of one conversion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub client_id: ClientId,
    pub mode: JobMode,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Instructions::is_empty")]
    pub instructions: Instructions,
    pub input_ref: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackRecord>,
}

impl JobRecord {
    fn new(client_id: ClientId, mode: JobMode, input_ref: ArtifactRef, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            client_id,
            mode,
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts,
            instructions: Instructions::default(),
            input_ref,
            expected_output_ref: None,
            script_ref: None,
            result_ref: None,
            last_error: None,
            current_step: Some("queued".to_string()),
            created_at: now,
            updated_at: now,
            completed_at: None,
            feedback_history: Vec::new(),
        }
    }

    /// New training job with the default refinement budget.
    pub fn training(client_id: ClientId, input_ref: ArtifactRef, expected_output_ref: ArtifactRef) -> Self {
        let mut job = Self::new(client_id, JobMode::Training, input_ref, DEFAULT_MAX_ATTEMPTS);
        job.expected_output_ref = Some(expected_output_ref);
        job
    }

    /// New inference job. Inference never retries.
    ///
    /// Without a `script_ref` the controller falls back to the client's latest
    /// trained script.
    pub fn inference(client_id: ClientId, input_ref: ArtifactRef, script_ref: Option<ArtifactRef>) -> Self {
        let mut job = Self::new(client_id, JobMode::Inference, input_ref, 1);
        job.script_ref = script_ref;
        job
    }

    pub fn with_instructions(mut self, instructions: Instructions) -> Self {
        self.instructions = instructions;
        self
    }

    /// Override the refinement budget (training only; clamped to at least 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        if self.mode == JobMode::Training {
            self.max_attempts = max_attempts.max(1);
        }
        self
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Whether a worker may (re)start this record.
    pub fn is_runnable(&self) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Failed => self.attempts_remaining() > 0,
            JobStatus::Running | JobStatus::Succeeded => false,
        }
    }

    /// Script produced by the most recent attempt that produced one.
    pub fn previous_script(&self) -> Option<&ArtifactRef> {
        self.feedback_history.iter().rev().find_map(|f| f.script_ref.as_ref())
    }

    fn reject(&self, reason: impl Into<String>) -> TransitionError {
        TransitionError {
            job_id: self.id,
            reason: reason.into(),
        }
    }

    /// `Queued -> Running`, or `Failed -> Running` while attempts remain.
    pub fn start_run(&mut self) -> Result<(), TransitionError> {
        if !self.is_runnable() {
            return Err(self.reject(format!(
                "cannot start from {} with {}/{} attempts used",
                self.status, self.attempt_count, self.max_attempts
            )));
        }
        self.status = JobStatus::Running;
        self.last_error = None;
        self.completed_at = None;
        self.current_step = Some("running".to_string());
        Ok(())
    }

    /// Open the next attempt; returns its 1-based number.
    pub fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.reject(format!("cannot begin an attempt while {}", self.status)));
        }
        if self.attempt_count >= self.max_attempts {
            return Err(self.reject(format!("attempt budget of {} exhausted", self.max_attempts)));
        }
        self.attempt_count += 1;
        self.current_step = Some(format!("attempt {} of {}", self.attempt_count, self.max_attempts));
        Ok(self.attempt_count)
    }

    pub fn record_success(
        &mut self,
        script_ref: ArtifactRef,
        result_ref: ArtifactRef,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.reject(format!("cannot succeed while {}", self.status)));
        }
        self.status = JobStatus::Succeeded;
        self.script_ref = Some(script_ref);
        self.result_ref = Some(result_ref);
        self.last_error = None;
        self.completed_at = Some(now);
        self.current_step = Some(format!("succeeded on attempt {}", self.attempt_count));
        Ok(())
    }

    /// Append the attempt's feedback; returns `true` when another attempt may follow.
    pub fn record_failure(
        &mut self,
        feedback: AttemptFeedback,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.reject(format!("cannot record a failure while {}", self.status)));
        }
        if self.feedback_history.len() as u32 >= self.attempt_count {
            return Err(self.reject(format!(
                "attempt {} already has feedback",
                self.attempt_count
            )));
        }
        let record = FeedbackRecord::from_feedback(self.attempt_count, feedback, now);
        let error = JobError {
            kind: record.kind,
            message: record.diagnostic.clone(),
        };
        self.feedback_history.push(record);

        if self.attempt_count < self.max_attempts {
            self.current_step = Some(format!(
                "attempt {} failed ({}), refining",
                self.attempt_count, error.kind
            ));
            return Ok(true);
        }

        self.status = JobStatus::Failed;
        self.current_step = Some(format!("failed after {} attempt(s)", self.attempt_count));
        self.last_error = Some(error);
        self.completed_at = Some(now);
        Ok(false)
    }

    /// Close the record after its execution was cut short.
    ///
    /// An attempt in flight gets an `Interrupted` feedback entry so the history
    /// still lines up with `attempt_count`.
    pub fn mark_interrupted(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        if (self.feedback_history.len() as u32) < self.attempt_count {
            self.feedback_history.push(FeedbackRecord::from_feedback(
                self.attempt_count,
                AttemptFeedback::new(FailureKind::Interrupted, reason.clone()),
                now,
            ));
        }
        self.status = JobStatus::Failed;
        self.current_step = Some("interrupted".to_string());
        self.last_error = Some(JobError {
            kind: FailureKind::Interrupted,
            message: reason,
        });
        self.completed_at = Some(now);
    }

    /// Structural invariants every committed record satisfies.
    pub fn check_invariants(&self) -> Result<(), TransitionError> {
        if self.attempt_count > self.max_attempts {
            return Err(self.reject(format!(
                "attempt_count {} exceeds max_attempts {}",
                self.attempt_count, self.max_attempts
            )));
        }
        let history = self.feedback_history.len() as u32;
        if history > self.attempt_count {
            return Err(self.reject(format!(
                "{history} feedback records for {} attempts",
                self.attempt_count
            )));
        }
        match self.status {
            JobStatus::Succeeded => {
                if self.script_ref.is_none() || self.result_ref.is_none() {
                    return Err(self.reject("succeeded without script_ref and result_ref"));
                }
            }
            JobStatus::Failed => {
                let Some(error) = &self.last_error else {
                    return Err(self.reject("failed without last_error"));
                };
                if error.kind != FailureKind::Interrupted && self.attempt_count != self.max_attempts {
                    return Err(self.reject(format!(
                        "failed with {} after {}/{} attempts",
                        error.kind, self.attempt_count, self.max_attempts
                    )));
                }
                if history != self.attempt_count {
                    return Err(self.reject("feedback history does not match attempt_count"));
                }
            }
            JobStatus::Queued | JobStatus::Running => {
                if self.last_error.is_some() {
                    return Err(self.reject(format!("last_error set while {}", self.status)));
                }
            }
        }
        Ok(())
    }

    /// Shape a record must have when it enters a store: queued and untouched.
    ///
    /// Inference may name its script up front; training produces one.
    pub fn check_new(&self) -> Result<(), TransitionError> {
        self.check_invariants()?;
        if self.status != JobStatus::Queued {
            return Err(self.reject(format!("new job must be queued, not {}", self.status)));
        }
        if self.attempt_count != 0 || !self.feedback_history.is_empty() {
            return Err(self.reject(format!(
                "new job already has {} attempt(s) and {} feedback record(s)",
                self.attempt_count,
                self.feedback_history.len()
            )));
        }
        let script_preset = self.mode == JobMode::Training && self.script_ref.is_some();
        if script_preset || self.result_ref.is_some() || self.completed_at.is_some() {
            return Err(self.reject("new job carries outputs of a previous run"));
        }
        Ok(())
    }

    /// Whether `self -> next` is a legal status move.
    pub fn allows_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self.status, next) {
            (a, b) if a == b => true,
            (Queued, Running) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            (Failed, Running) => self.attempts_remaining() > 0,
            _ => false,
        }
    }

    /// Artifacts owned by this job (removed with it).
    pub fn artifacts(&self) -> Vec<&ArtifactRef> {
        let mut refs: Vec<&ArtifactRef> = Vec::new();
        refs.push(&self.input_ref);
        refs.extend(self.expected_output_ref.iter());
        if self.mode == JobMode::Training {
            refs.extend(self.script_ref.iter());
        }
        refs.extend(self.result_ref.iter());
        for f in &self.feedback_history {
            if let Some(s) = &f.script_ref {
                if !refs.contains(&s) {
                    refs.push(s);
                }
            }
        }
        refs
    }
}

/// Selection for [`crate::JobStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub mode: Option<JobMode>,
    pub client_id: Option<ClientId>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_mode(mut self, mode: JobMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn for_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.mode.is_none_or(|m| job.mode == m)
            && self.client_id.is_none_or(|c| job.client_id == c)
    }
}
