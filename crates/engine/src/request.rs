use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use csvforge_core::{ArtifactRef, JobId};

use crate::outcome::FeedbackRecord;

/// Free-text guidance handed to the engine with every attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions {
    /// What the conversion is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rules applying to the whole dataset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general: Option<String>,
    /// Per-column rules, keyed by output column name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, String>,
}

impl Instructions {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_general(mut self, general: impl Into<String>) -> Self {
        self.general = Some(general.into());
        self
    }

    pub fn with_column(mut self, column: impl Into<String>, rule: impl Into<String>) -> Self {
        self.columns.insert(column.into(), rule.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.general.is_none() && self.columns.is_empty()
    }
}

/// One refinement attempt of a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineRequest {
    pub job_id: JobId,
    /// 1-based attempt number this request belongs to.
    pub attempt: u32,
    pub input_ref: ArtifactRef,
    pub expected_output_ref: Option<ArtifactRef>,
    pub instructions: Instructions,
    /// Feedback from every earlier attempt, oldest first.
    pub feedback_history: Vec<FeedbackRecord>,
    /// Script produced by the previous attempt, if it produced one.
    pub previous_script: Option<ArtifactRef>,
}

/// Single execution of an already trained script (inference).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub job_id: JobId,
    pub input_ref: ArtifactRef,
    pub script_ref: ArtifactRef,
    pub instructions: Instructions,
}

/// Unit of work handed to an engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EngineRequest {
    Refine(RefineRequest),
    Execute(ExecuteRequest),
}

impl EngineRequest {
    pub fn job_id(&self) -> JobId {
        match self {
            EngineRequest::Refine(r) => r.job_id,
            EngineRequest::Execute(r) => r.job_id,
        }
    }

    pub fn input_ref(&self) -> &ArtifactRef {
        match self {
            EngineRequest::Refine(r) => &r.input_ref,
            EngineRequest::Execute(r) => &r.input_ref,
        }
    }
}
