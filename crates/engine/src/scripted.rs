//! Scripted engine for tests: plays back per-input outcomes, no model calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use csvforge_core::{ArtifactRef, JobId};

use crate::engine::{EngineFactory, TransformationEngine};
use crate::outcome::{AttemptFeedback, AttemptOutcome, EngineError, FailureKind};
use crate::request::{ExecuteRequest, RefineRequest};

/// What the engine does for one call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(FailureKind, String),
    /// The client returns an error instead of a verdict.
    Error(String),
    Panic(String),
    /// Sleep, then behave like the inner step.
    After(Duration, Box<Step>),
}

impl Step {
    pub fn fail(kind: FailureKind, diagnostic: impl Into<String>) -> Self {
        Self::Fail(kind, diagnostic.into())
    }

    pub fn after(delay: Duration, step: Step) -> Self {
        Self::After(delay, Box::new(step))
    }
}

/// One observed engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub job_id: JobId,
    pub input_ref: String,
    /// `None` for inference executions.
    pub attempt: Option<u32>,
    pub feedback_len: usize,
    pub previous_script: Option<ArtifactRef>,
    pub script_ref: Option<ArtifactRef>,
    /// Which engine instance served the call (creation order, from 0).
    pub instance: usize,
}

#[derive(Debug, Default)]
struct PlanState {
    steps: HashMap<String, VecDeque<Step>>,
    calls: Vec<EngineCall>,
    instances: usize,
}

/// Shared playbook for every engine the factory hands out.
///
/// Inputs without a script (or whose script ran out) succeed.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlan {
    state: Arc<Mutex<PlanState>>,
}

impl ScriptedPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, input_ref: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.lock()
            .steps
            .entry(input_ref.to_string())
            .or_default()
            .extend(steps);
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, input_ref: &str) -> Vec<EngineCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.input_ref == input_ref)
            .cloned()
            .collect()
    }

    pub fn instances_created(&self) -> usize {
        self.lock().instances
    }

    pub fn factory(&self) -> impl EngineFactory + use<> {
        let plan = self.clone();
        move || -> Result<Box<dyn TransformationEngine>, EngineError> {
            Ok(Box::new(plan.engine()))
        }
    }

    pub fn engine(&self) -> ScriptedEngine {
        let mut state = self.lock();
        let instance = state.instances;
        state.instances += 1;
        ScriptedEngine {
            plan: self.clone(),
            instance,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, call: EngineCall) -> Step {
        let mut state = self.lock();
        let step = state
            .steps
            .get_mut(&call.input_ref)
            .and_then(|q| q.pop_front())
            .unwrap_or(Step::Succeed);
        state.calls.push(call);
        step
    }
}

/// Engine instance backed by a [`ScriptedPlan`].
#[derive(Debug)]
pub struct ScriptedEngine {
    plan: ScriptedPlan,
    instance: usize,
}

impl ScriptedEngine {
    fn play(
        &self,
        step: Step,
        success: impl FnOnce() -> Result<AttemptOutcome, EngineError>,
        produced_script: Option<ArtifactRef>,
    ) -> Result<AttemptOutcome, EngineError> {
        match step {
            Step::Succeed => success(),
            Step::Fail(kind, diagnostic) => {
                let mut feedback = AttemptFeedback::new(kind, diagnostic);
                if let Some(script) = produced_script {
                    feedback = feedback.with_script(script);
                }
                Ok(AttemptOutcome::Failure(feedback))
            }
            Step::Error(msg) => Err(EngineError::Failed(msg)),
            Step::Panic(msg) => panic!("{msg}"),
            Step::After(delay, inner) => {
                thread::sleep(delay);
                self.play(*inner, success, produced_script)
            }
        }
    }
}

fn derived(input: &ArtifactRef, suffix: &str) -> Result<ArtifactRef, EngineError> {
    ArtifactRef::new(format!("{input}#{suffix}")).map_err(|e| EngineError::Failed(e.to_string()))
}

impl TransformationEngine for ScriptedEngine {
    fn refine(&mut self, request: &RefineRequest) -> Result<AttemptOutcome, EngineError> {
        let step = self.plan.next_step(EngineCall {
            job_id: request.job_id,
            input_ref: request.input_ref.to_string(),
            attempt: Some(request.attempt),
            feedback_len: request.feedback_history.len(),
            previous_script: request.previous_script.clone(),
            script_ref: None,
            instance: self.instance,
        });
        let script = derived(&request.input_ref, &format!("script-{}", request.attempt))?;
        let result = derived(&request.input_ref, &format!("result-{}", request.attempt))?;
        self.play(
            step,
            || Ok(AttemptOutcome::success(script.clone(), result)),
            Some(script.clone()),
        )
    }

    fn execute(&mut self, request: &ExecuteRequest) -> Result<AttemptOutcome, EngineError> {
        let step = self.plan.next_step(EngineCall {
            job_id: request.job_id,
            input_ref: request.input_ref.to_string(),
            attempt: None,
            feedback_len: 0,
            previous_script: None,
            script_ref: Some(request.script_ref.clone()),
            instance: self.instance,
        });
        let result = derived(&request.input_ref, "inference")?;
        self.play(
            step,
            || Ok(AttemptOutcome::success(request.script_ref.clone(), result)),
            None,
        )
    }
}
