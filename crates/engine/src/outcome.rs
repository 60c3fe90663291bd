use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use csvforge_core::ArtifactRef;

/// Why an attempt did not produce an accepted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The script ran but its output did not match the expected output.
    Mismatch,
    /// The script could not be executed to completion.
    Execution,
    /// The engine client itself failed (error or panic).
    Engine,
    /// The attempt exceeded the execution cap.
    Timeout,
    /// Inference found no trained script to run.
    MissingScript,
    /// Execution was cut short (process restart, aborted controller).
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Mismatch => "mismatch",
            FailureKind::Execution => "execution",
            FailureKind::Engine => "engine",
            FailureKind::Timeout => "timeout",
            FailureKind::MissingScript => "missing_script",
            FailureKind::Interrupted => "interrupted",
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured feedback returned by a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFeedback {
    pub kind: FailureKind,
    /// Free-text diagnostic meant for the next attempt.
    pub diagnostic: String,
    /// Script the failed attempt produced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_ref: Option<ArtifactRef>,
}

impl AttemptFeedback {
    pub fn new(kind: FailureKind, diagnostic: impl Into<String>) -> Self {
        Self {
            kind,
            diagnostic: diagnostic.into(),
            script_ref: None,
        }
    }

    pub fn with_script(mut self, script_ref: ArtifactRef) -> Self {
        self.script_ref = Some(script_ref);
        self
    }
}

/// Feedback as recorded on the job, one per finished attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub kind: FailureKind,
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_ref: Option<ArtifactRef>,
    pub recorded_at: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn from_feedback(attempt: u32, feedback: AttemptFeedback, recorded_at: DateTime<Utc>) -> Self {
        Self {
            attempt,
            kind: feedback.kind,
            diagnostic: feedback.diagnostic,
            script_ref: feedback.script_ref,
            recorded_at,
        }
    }
}

/// Verdict of one engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    Success {
        script_ref: ArtifactRef,
        result_ref: ArtifactRef,
    },
    Failure(AttemptFeedback),
}

impl AttemptOutcome {
    pub fn success(script_ref: ArtifactRef, result_ref: ArtifactRef) -> Self {
        Self::Success {
            script_ref,
            result_ref,
        }
    }

    pub fn failure(kind: FailureKind, diagnostic: impl Into<String>) -> Self {
        Self::Failure(AttemptFeedback::new(kind, diagnostic))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success { .. })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine request: {0}")]
    InvalidRequest(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine call failed: {0}")]
    Failed(String),

    #[error("engine call exceeded its execution cap of {0:?}")]
    Timeout(std::time::Duration),
}

impl EngineError {
    /// Failure kind recorded on the job when an attempt ends with this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Engine,
        }
    }
}
