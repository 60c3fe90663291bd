//! Property tests over job records driven through the controller and pool.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use csvforge_core::{ArtifactRef, ClientId, JobId};
use csvforge_engine::{FailureKind, ScriptedPlan, Step};
use csvforge_jobs::{
    EngineSlot, InMemoryJobStore, JobRecord, JobStatus, JobStore, RefinementController,
    SchedulerConfig, WorkerPool,
};

fn artifact(s: &str) -> ArtifactRef {
    ArtifactRef::new(s).unwrap()
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Succeed),
        3 => Just(Step::fail(FailureKind::Mismatch, "output differs")),
        2 => Just(Step::fail(FailureKind::Execution, "script raised")),
        1 => Just(Step::Error("engine unavailable".into())),
        1 => Just(Step::Panic("engine bug".into())),
    ]
}

fn assert_record_invariants(job: &JobRecord) {
    assert!(job.check_invariants().is_ok(), "{:?}", job.check_invariants());
    assert!(job.attempt_count >= 1);
    assert!(job.attempt_count <= job.max_attempts);
    assert_eq!(
        job.feedback_history.len() as u32 + u32::from(job.status == JobStatus::Succeeded),
        job.attempt_count
    );
    match job.status {
        JobStatus::Succeeded => {
            assert!(job.script_ref.is_some());
            assert!(job.result_ref.is_some());
            assert!(job.last_error.is_none());
        }
        JobStatus::Failed => {
            let error = job.last_error.as_ref().unwrap();
            assert!(
                job.attempt_count == job.max_attempts || error.kind == FailureKind::Interrupted
            );
        }
        other => panic!("run ended in non-terminal status {other}"),
    }
    assert!(job.updated_at >= job.created_at);
    let attempts: Vec<u32> = job.feedback_history.iter().map(|f| f.attempt).collect();
    let expected: Vec<u32> = (1..=job.feedback_history.len() as u32).collect();
    assert_eq!(attempts, expected);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Property: whatever the engine does, a training run ends terminal with
    /// a record that satisfies every invariant, and the engine is called once
    /// per attempt.
    #[test]
    fn training_runs_end_in_a_consistent_terminal_state(
        steps in prop::collection::vec(step_strategy(), 0..8),
        max_attempts in 1u32..7,
    ) {
        let store = InMemoryJobStore::new();
        let plan = ScriptedPlan::new().script("in.csv", steps.clone());
        let mut engine = EngineSlot::new(Arc::new(plan.factory()), "prop");
        let id = store
            .create(
                JobRecord::training(ClientId::new(), artifact("in.csv"), artifact("out.csv"))
                    .with_max_attempts(max_attempts),
            )
            .unwrap();

        let job = RefinementController::new(&store, &mut engine, Duration::from_secs(5))
            .run(id)
            .unwrap();
        assert_record_invariants(&job);
        prop_assert_eq!(plan.calls().len() as u32, job.attempt_count);

        // The first success within budget decides the outcome.
        let first_success = steps
            .iter()
            .take(max_attempts as usize)
            .position(|s| matches!(s, Step::Succeed));
        let expect_success = first_success.is_some() || steps.len() < max_attempts as usize;
        prop_assert_eq!(job.status == JobStatus::Succeeded, expect_success);
        prop_assert_eq!(store.get(id).unwrap(), job);
    }

    /// Property: with one worker, jobs reach the engine in submission order.
    #[test]
    fn single_worker_dispatch_is_fifo(count in 1usize..8) {
        let store = InMemoryJobStore::arc();
        let plan = ScriptedPlan::new();
        let pool = WorkerPool::spawn(
            &SchedulerConfig::default().with_name("fifo").with_max_workers(1),
            store.clone(),
            Arc::new(plan.factory()),
        )
        .unwrap();

        let inputs: Vec<String> = (0..count).map(|i| format!("job-{i}.csv")).collect();
        let ids: Vec<JobId> = inputs
            .iter()
            .map(|input| {
                store
                    .create(JobRecord::training(ClientId::new(), artifact(input), artifact("out.csv")))
                    .unwrap()
            })
            .collect();
        for id in &ids {
            prop_assert!(pool.submit(*id).is_accepted());
        }
        prop_assert!(pool.wait_idle(Duration::from_secs(10)));

        let order: Vec<String> = plan.calls().into_iter().map(|c| c.input_ref).collect();
        prop_assert_eq!(order, inputs);
        let status = pool.status();
        prop_assert_eq!(status.jobs_processed, count as u64);
        prop_assert_eq!(status.clone(), pool.status());
        pool.shutdown();
    }
}
