//! Refinement controller: drives one job from `running` to a terminal state.
//!
//! Training jobs loop `attempt -> evaluate -> retry` until the engine accepts
//! a script or the attempt budget is spent. Inference jobs get exactly one
//! attempt with an existing script. The job record is the only state that
//! crosses attempts: every attempt reads the committed record, and its result
//! is committed before the next attempt starts.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use csvforge_core::JobId;
use csvforge_engine::{
    AttemptOutcome, EngineError, EngineFactory, EngineRequest, ExecuteRequest, FailureKind,
    RefineRequest, TransformationEngine,
};

use crate::store::{JobStore, JobStoreError};
use crate::types::{JobMode, JobRecord};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Engine instance owned by one worker.
///
/// The instance is built lazily from the factory and rebuilt whenever a call
/// panicked or was abandoned on timeout, so no instance is ever used by two
/// calls at once.
pub struct EngineSlot {
    factory: Arc<dyn EngineFactory>,
    engine: Option<Box<dyn TransformationEngine>>,
    worker: String,
}

type CallResult = Result<Result<AttemptOutcome, EngineError>, Box<dyn Any + Send>>;

impl EngineSlot {
    pub fn new(factory: Arc<dyn EngineFactory>, worker: impl Into<String>) -> Self {
        Self {
            factory,
            engine: None,
            worker: worker.into(),
        }
    }

    /// Drop the current instance; the next call builds a fresh one.
    pub fn reset(&mut self) {
        self.engine = None;
    }

    /// Run one engine call under `timeout`.
    ///
    /// Every fault (engine error, panic, timeout) comes back as a failed
    /// attempt rather than an error.
    pub fn call(&mut self, request: EngineRequest, timeout: Duration) -> AttemptOutcome {
        let job_id = request.job_id();
        let input = request.input_ref().clone();
        let mut engine = match self.engine.take() {
            Some(engine) => engine,
            None => match self.factory.create() {
                Ok(engine) => engine,
                Err(e) => {
                    warn!(worker = %self.worker, job_id = %job_id, error = %e, "failed to create engine");
                    return engine_failure(&e);
                }
            },
        };

        let (tx, rx) = mpsc::channel::<(Box<dyn TransformationEngine>, CallResult)>();
        let spawned = thread::Builder::new()
            .name(format!("{}-attempt", self.worker))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| engine.handle(&request)));
                // The receiver is gone when the call overran its timeout.
                let _ = tx.send((engine, result));
            });
        if let Err(e) = spawned {
            warn!(worker = %self.worker, job_id = %job_id, error = %e, "failed to spawn attempt thread");
            return AttemptOutcome::failure(FailureKind::Engine, format!("could not start engine call: {e}"));
        }

        match rx.recv_timeout(timeout) {
            Ok((engine, Ok(Ok(outcome)))) => {
                self.engine = Some(engine);
                debug!(
                    worker = %self.worker,
                    job_id = %job_id,
                    input = %input,
                    success = outcome.is_success(),
                    "engine call returned"
                );
                outcome
            }
            Ok((engine, Ok(Err(e)))) => {
                self.engine = Some(engine);
                warn!(worker = %self.worker, job_id = %job_id, error = %e, "engine call failed");
                engine_failure(&e)
            }
            Ok((_, Err(payload))) => {
                let msg = panic_message(payload.as_ref());
                warn!(worker = %self.worker, job_id = %job_id, input = %input, panic = %msg, "engine panicked");
                AttemptOutcome::failure(FailureKind::Engine, format!("engine panicked: {msg}"))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    worker = %self.worker,
                    job_id = %job_id,
                    input = %input,
                    ?timeout,
                    "engine call timed out; abandoning instance"
                );
                engine_failure(&EngineError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => AttemptOutcome::failure(
                FailureKind::Engine,
                "engine call ended without a result",
            ),
        }
    }
}

fn engine_failure(err: &EngineError) -> AttemptOutcome {
    AttemptOutcome::failure(err.failure_kind(), err.to_string())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one job to a terminal state inside a worker.
pub struct RefinementController<'a> {
    store: &'a dyn JobStore,
    engine: &'a mut EngineSlot,
    attempt_timeout: Duration,
}

impl<'a> RefinementController<'a> {
    pub fn new(store: &'a dyn JobStore, engine: &'a mut EngineSlot, attempt_timeout: Duration) -> Self {
        Self {
            store,
            engine,
            attempt_timeout,
        }
    }

    /// Take ownership of the job and run it to `succeeded` or `failed`.
    ///
    /// Store errors end the run early and are returned as they are; the
    /// record then still holds its last committed state.
    pub fn run(&mut self, job_id: JobId) -> Result<JobRecord, ControllerError> {
        let job = self.store.update(job_id, &mut |job| {
            job.start_run()?;
            Ok(())
        })?;
        info!(job_id = %job_id, mode = ?job.mode, attempts_used = job.attempt_count, "job started");

        let started = Instant::now();
        let done = match job.mode {
            JobMode::Training => self.refine(job_id)?,
            JobMode::Inference => self.infer(job_id)?,
        };
        info!(
            job_id = %job_id,
            status = %done.status,
            attempts = done.attempt_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        Ok(done)
    }

    fn refine(&mut self, job_id: JobId) -> Result<JobRecord, ControllerError> {
        loop {
            let job = self.store.update(job_id, &mut |job| {
                job.begin_attempt()?;
                Ok(())
            })?;
            let attempt = job.attempt_count;
            debug!(job_id = %job_id, attempt, feedback = job.feedback_history.len(), "attempt started");

            let Some(expected_output_ref) = job.expected_output_ref.clone() else {
                let outcome = AttemptOutcome::failure(
                    FailureKind::Execution,
                    "training job has no expected output to evaluate against",
                );
                return self.settle(job_id, attempt, outcome);
            };

            let request = EngineRequest::Refine(RefineRequest {
                job_id,
                attempt,
                input_ref: job.input_ref.clone(),
                expected_output_ref: Some(expected_output_ref),
                instructions: job.instructions.clone(),
                previous_script: job.previous_script().cloned(),
                feedback_history: job.feedback_history,
            });
            let outcome = self.engine.call(request, self.attempt_timeout);
            let job = self.settle(job_id, attempt, outcome)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
        }
    }

    fn infer(&mut self, job_id: JobId) -> Result<JobRecord, ControllerError> {
        let job = self.store.update(job_id, &mut |job| {
            job.begin_attempt()?;
            Ok(())
        })?;
        let attempt = job.attempt_count;

        let script_ref = match job.script_ref.clone() {
            Some(script) => Some(script),
            None => self
                .store
                .latest_trained(job.client_id)?
                .and_then(|trained| trained.script_ref),
        };

        let outcome = match script_ref {
            None => AttemptOutcome::failure(
                FailureKind::MissingScript,
                format!("client {} has no trained script", job.client_id),
            ),
            Some(script_ref) => self.engine.call(
                EngineRequest::Execute(ExecuteRequest {
                    job_id,
                    input_ref: job.input_ref.clone(),
                    script_ref,
                    instructions: job.instructions.clone(),
                }),
                self.attempt_timeout,
            ),
        };
        self.settle(job_id, attempt, outcome)
    }

    /// Commit the verdict of `attempt`.
    fn settle(
        &mut self,
        job_id: JobId,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> Result<JobRecord, ControllerError> {
        let job = match outcome {
            AttemptOutcome::Success {
                script_ref,
                result_ref,
            } => self.store.update(job_id, &mut |job| {
                job.record_success(script_ref.clone(), result_ref.clone(), Utc::now())?;
                Ok(())
            })?,
            AttemptOutcome::Failure(feedback) => {
                debug!(job_id = %job_id, attempt, kind = %feedback.kind, diagnostic = %feedback.diagnostic, "attempt failed");
                self.store.update(job_id, &mut |job| {
                    job.record_failure(feedback.clone(), Utc::now())?;
                    Ok(())
                })?
            }
        };
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::types::JobStatus;
    use csvforge_core::{ArtifactRef, ClientId};
    use csvforge_engine::{ScriptedPlan, Step};

    fn artifact(s: &str) -> ArtifactRef {
        ArtifactRef::new(s).unwrap()
    }

    fn slot(plan: &ScriptedPlan) -> EngineSlot {
        EngineSlot::new(Arc::new(plan.factory()), "test-worker")
    }

    fn training(store: &InMemoryJobStore, input: &str) -> JobId {
        store
            .create(JobRecord::training(ClientId::new(), artifact(input), artifact("expected.csv")))
            .unwrap()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn succeeds_on_first_attempt() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new();
        let mut engine = slot(&plan);
        let id = training(&store, "a.csv");

        let job = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt_count, 1);
        assert!(job.feedback_history.is_empty());
        assert_eq!(job.script_ref, Some(artifact("a.csv#script-1")));
        assert_eq!(job.result_ref, Some(artifact("a.csv#result-1")));
    }

    #[test]
    fn succeeds_on_fifth_attempt_after_four_failures() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new().script(
            "a.csv",
            (1..=4).map(|n| Step::fail(FailureKind::Mismatch, format!("diff {n}"))),
        );
        let mut engine = slot(&plan);
        let id = training(&store, "a.csv");

        let job = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt_count, 5);
        assert_eq!(job.feedback_history.len(), 4);
        assert!(job.last_error.is_none());

        // Each attempt saw the feedback of all earlier ones.
        let seen: Vec<usize> = plan.calls().iter().map(|c| c.feedback_len).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        // and the script the previous attempt produced
        let calls = plan.calls();
        assert_eq!(calls[0].previous_script, None);
        assert_eq!(calls[1].previous_script, Some(artifact("a.csv#script-1")));
    }

    #[test]
    fn exhausts_attempts_and_records_last_error() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new().script(
            "a.csv",
            (0..5).map(|n| {
                let kind = if n == 4 { FailureKind::Execution } else { FailureKind::Mismatch };
                Step::fail(kind, format!("bad {n}"))
            }),
        );
        let mut engine = slot(&plan);
        let id = training(&store, "a.csv");

        let job = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 5);
        assert_eq!(job.feedback_history.len(), 5);
        let error = job.last_error.unwrap();
        assert_eq!(error.kind, FailureKind::Execution);
        assert_eq!(error.message, "bad 4");
        assert_eq!(plan.calls().len(), 5);
    }

    #[test]
    fn engine_errors_and_panics_are_attempt_failures() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new().script(
            "a.csv",
            [Step::Error("rate limited".into()), Step::Panic("boom".into())],
        );
        let mut engine = slot(&plan);
        let id = training(&store, "a.csv");

        let job = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt_count, 3);
        let kinds: Vec<_> = job.feedback_history.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FailureKind::Engine, FailureKind::Engine]);
        assert!(job.feedback_history[1].diagnostic.contains("boom"));
        // The panicked instance was replaced.
        assert_eq!(plan.instances_created(), 2);
    }

    #[test]
    fn timed_out_attempt_is_retried_on_a_fresh_engine() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new().script(
            "a.csv",
            [Step::after(Duration::from_millis(500), Step::Succeed)],
        );
        let mut engine = slot(&plan);
        let id = training(&store, "a.csv");

        let job = RefinementController::new(&store, &mut engine, Duration::from_millis(50))
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.feedback_history[0].kind, FailureKind::Timeout);
        let instances: Vec<_> = plan.calls().iter().map(|c| c.instance).collect();
        assert_eq!(instances, vec![0, 1]);
    }

    #[test]
    fn inference_failure_is_terminal_after_one_attempt() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new().script(
            "batch.csv",
            [Step::fail(FailureKind::Execution, "KeyError: 'amount'")],
        );
        let mut engine = slot(&plan);
        let id = store
            .create(JobRecord::inference(
                ClientId::new(),
                artifact("batch.csv"),
                Some(artifact("trained.py")),
            ))
            .unwrap();

        let job = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.feedback_history.len(), 1);
        assert_eq!(job.last_error.unwrap().kind, FailureKind::Execution);
        assert_eq!(plan.calls().len(), 1);
    }

    #[test]
    fn inference_without_trained_script_fails_without_engine_call() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new();
        let mut engine = slot(&plan);
        let id = store
            .create(JobRecord::inference(ClientId::new(), artifact("batch.csv"), None))
            .unwrap();

        let job = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.unwrap().kind, FailureKind::MissingScript);
        assert!(plan.calls().is_empty());
    }

    #[test]
    fn inference_uses_latest_trained_script_of_client() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new();
        let mut engine = slot(&plan);
        let client = ClientId::new();

        let trained = store
            .create(JobRecord::training(client, artifact("train.csv"), artifact("expected.csv")))
            .unwrap();
        RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(trained)
            .unwrap();

        let id = store
            .create(JobRecord::inference(client, artifact("batch.csv"), None))
            .unwrap();
        let job = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.script_ref, Some(artifact("train.csv#script-1")));
        assert_eq!(job.result_ref, Some(artifact("batch.csv#inference")));
        let last = plan.calls().pop().unwrap();
        assert_eq!(last.script_ref, Some(artifact("train.csv#script-1")));
    }

    #[test]
    fn finished_job_cannot_be_run_again() {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new();
        let mut engine = slot(&plan);
        let id = training(&store, "a.csv");
        RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap();

        let err = RefinementController::new(&store, &mut engine, TIMEOUT)
            .run(id)
            .unwrap_err();
        assert!(matches!(err, ControllerError::Store(JobStoreError::Conflict(_))));
        assert_eq!(plan.calls().len(), 1);
    }
}
