mod common;

use async_trait::async_trait;
use common::{device_step, fast_config, job, Behaviour, Engine, TENANT};
use devmgmt_server::command::{OperationRepository, OperationStatus};
use devmgmt_server::job::{
    CoordinatorConfig, ExecutionStatus, JobEngineError, JobExecutionRepository, JobStartOptions, JobStepDefinition, JobTarget,
    JobTargetRepository, RequestTemplate, StartOutcome, StepContext, TargetOutcome, TargetProcessingError, TargetProcessor,
};
use devmgmt_shared::state_machine::{TargetProgress, TargetStatus};
use devmgmt_shared::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

fn step_with(name: &str, processor: &str) -> JobStepDefinition {
    JobStepDefinition {
        name: name.to_string(),
        processor: processor.to_string(),
        template: RequestTemplate::new("LOCAL", Method::Execute),
        timeout_ms: None,
    }
}

async fn targets_by_id(engine: &Engine, job_id: &str) -> HashMap<String, JobTarget> {
    engine
        .targets
        .list(TENANT, job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.target_id.clone(), t))
        .collect()
}

async fn wait_until_idle(engine: &Engine, execution_id: Uuid) {
    let wait = async {
        while engine.coordinator.is_local(&execution_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("execution task did not wind down");
}

/// Panics on one target, succeeds on the rest
struct Panicky {
    victim: &'static str,
}

#[async_trait]
impl TargetProcessor for Panicky {
    async fn process_target(
        &self,
        _ctx: &StepContext,
        target: &JobTarget,
    ) -> Result<TargetOutcome, TargetProcessingError> {
        if target.target_id == self.victim {
            panic!("processor bug on {}", target.target_id);
        }
        Ok(TargetOutcome::ok(None))
    }
}

/// Blocks its first call until the gate opens and asks for another pass;
/// later calls succeed straight away
struct Gated {
    gate: Arc<Semaphore>,
    calls: AtomicUsize,
}

impl Gated {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(0)),
            calls: AtomicUsize::new(0),
        })
    }

    fn open(&self) {
        self.gate.add_permits(64);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn entered(&self) {
        let wait = async {
            while self.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("gated step was never reached");
    }
}

#[async_trait]
impl TargetProcessor for Gated {
    async fn process_target(
        &self,
        _ctx: &StepContext,
        _target: &JobTarget,
    ) -> Result<TargetOutcome, TargetProcessingError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(TargetOutcome::ok(None));
        }
        let _permit = self.gate.acquire().await;
        Ok(TargetOutcome::again(None))
    }
}

#[tokio::test]
async fn test_failed_target_does_not_stop_siblings() {
    let engine = Engine::new();
    engine.devices.set("gw-b", Behaviour::Reply(500));
    let steps = vec![
        device_step("list bundles", "BUN-V1", Method::Read),
        device_step("rotate keys", "KEYS-V1", Method::Execute),
    ];
    engine
        .coordinator
        .define_job(job("rollout", steps, &["gw-a", "gw-b", "gw-c"]))
        .await
        .unwrap();

    assert!(matches!(
        engine.coordinator.start_job(TENANT, "rollout").await.unwrap(),
        StartOutcome::Started(_)
    ));
    let executions = engine.settle("rollout").await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);

    let targets = targets_by_id(&engine, "rollout").await;
    let done = TargetProgress {
        step_index: 1,
        status: TargetStatus::ProcessOk,
    };
    assert_eq!(targets["gw-a"].progress, done);
    assert_eq!(targets["gw-c"].progress, done);

    let failed = &targets["gw-b"];
    assert_eq!(failed.progress.step_index, 0);
    assert_eq!(failed.progress.status, TargetStatus::ProcessFailed);
    assert!(failed.last_exception.is_some());
    assert!(failed.operation_id.is_some());

    // The failed target never reached the second step
    assert_eq!(engine.devices.published_to("gw-b"), 1);
    assert_eq!(engine.devices.published_to("gw-a"), 2);
}

#[tokio::test]
async fn test_panicking_processor_fails_only_its_target() {
    let engine = Engine::with(
        fast_config(),
        vec![("panicky", Arc::new(Panicky { victim: "gw-2" }) as Arc<dyn TargetProcessor>)],
    );
    engine
        .coordinator
        .define_job(job("audit", vec![step_with("inspect", "panicky")], &["gw-1", "gw-2", "gw-3"]))
        .await
        .unwrap();

    engine.coordinator.start_job(TENANT, "audit").await.unwrap();
    let executions = engine.settle("audit").await;
    assert_eq!(executions[0].status, ExecutionStatus::Completed);

    let targets = targets_by_id(&engine, "audit").await;
    assert_eq!(targets["gw-1"].progress.status, TargetStatus::ProcessOk);
    assert_eq!(targets["gw-3"].progress.status, TargetStatus::ProcessOk);
    assert_eq!(targets["gw-2"].progress.status, TargetStatus::ProcessFailed);
    assert!(targets["gw-2"].last_exception.as_deref().is_some_and(|e| e.contains("gw-2")));
}

#[tokio::test]
async fn test_second_start_while_running_is_ignored() {
    let gated = Gated::new();
    let engine = Engine::with(fast_config(), vec![("gated", gated.clone() as Arc<dyn TargetProcessor>)]);
    engine
        .coordinator
        .define_job(job("sync", vec![step_with("wait", "gated")], &["gw-1"]))
        .await
        .unwrap();

    let StartOutcome::Started(first) = engine.coordinator.start_job(TENANT, "sync").await.unwrap() else {
        panic!("first start should run");
    };
    gated.entered().await;
    assert_eq!(
        engine.coordinator.start_job(TENANT, "sync").await.unwrap(),
        StartOutcome::AlreadyRunning(first)
    );
    assert!(engine.coordinator.is_running(TENANT, "sync").await.unwrap());

    gated.open();
    let executions = engine.settle("sync").await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].execution_id, first);
    assert!(!engine.coordinator.is_running(TENANT, "sync").await.unwrap());
}

#[tokio::test]
async fn test_concurrent_starts_run_once() {
    let gated = Gated::new();
    let engine = Engine::with(fast_config(), vec![("gated", gated.clone() as Arc<dyn TargetProcessor>)]);
    engine
        .coordinator
        .define_job(job("race", vec![step_with("wait", "gated")], &["gw-1"]))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        engine.coordinator.start_job(TENANT, "race"),
        engine.coordinator.start_job(TENANT, "race")
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let started: Vec<Uuid> = outcomes
        .iter()
        .filter_map(|o| match o {
            StartOutcome::Started(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 1, "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&StartOutcome::AlreadyRunning(started[0])));

    let running = engine
        .executions
        .list(TENANT, "race")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.status == ExecutionStatus::Running)
        .count();
    assert_eq!(running, 1);

    gated.entered().await;
    gated.open();
    let executions = engine.settle("race").await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_enqueued_start_runs_after_current() {
    let gated = Gated::new();
    let engine = Engine::with(fast_config(), vec![("gated", gated.clone() as Arc<dyn TargetProcessor>)]);
    engine
        .coordinator
        .define_job(job("sync", vec![step_with("wait", "gated")], &["gw-1"]))
        .await
        .unwrap();

    let StartOutcome::Started(first) = engine.coordinator.start_job(TENANT, "sync").await.unwrap() else {
        panic!("first start should run");
    };
    gated.entered().await;

    let options = JobStartOptions {
        enqueue: true,
        reset_step_index: true,
        ..Default::default()
    };
    let StartOutcome::Queued(second) = engine
        .coordinator
        .start_job_with_options(TENANT, "sync", options)
        .await
        .unwrap()
    else {
        panic!("second start should queue");
    };

    gated.open();
    let executions = engine.settle("sync").await;
    assert_eq!(executions.len(), 2);
    let by_id: HashMap<Uuid, _> = executions.into_iter().map(|e| (e.execution_id, e)).collect();
    assert_eq!(by_id[&first].status, ExecutionStatus::Completed);
    assert_eq!(by_id[&second].status, ExecutionStatus::Completed);
    assert!(by_id[&second].started_on.unwrap() >= by_id[&first].ended_on.unwrap());

    // The queued run reset the target, so it was presented again
    assert_eq!(gated.calls(), 3);
}

#[tokio::test]
async fn test_start_from_step_skips_earlier_steps() {
    let engine = Engine::new();
    let steps = vec![
        device_step("bundles", "BUN-V1", Method::Read),
        device_step("keys", "KEYS-V1", Method::Read),
        device_step("assets", "ASSET-V1", Method::Read),
    ];
    engine
        .coordinator
        .define_job(job("partial", steps, &["gw-1"]))
        .await
        .unwrap();

    let options = JobStartOptions {
        reset_step_index: true,
        from_step_index: Some(1),
        ..Default::default()
    };
    engine
        .coordinator
        .start_job_with_options(TENANT, "partial", options)
        .await
        .unwrap();
    engine.settle("partial").await;

    let apps: Vec<String> = engine
        .devices
        .published()
        .iter()
        .filter_map(|e| e.channel.as_ref().map(|c| c.app_name.clone()))
        .collect();
    assert_eq!(apps, vec!["KEYS-V1".to_string(), "ASSET-V1".to_string()]);
}

#[tokio::test]
async fn test_invalid_start_options_are_rejected() {
    let engine = Engine::new();
    engine
        .coordinator
        .define_job(job("partial", vec![device_step("bundles", "BUN-V1", Method::Read)], &["gw-1"]))
        .await
        .unwrap();

    let beyond = JobStartOptions {
        reset_step_index: true,
        from_step_index: Some(1),
        ..Default::default()
    };
    let err = engine
        .coordinator
        .start_job_with_options(TENANT, "partial", beyond)
        .await
        .unwrap_err();
    assert!(matches!(err, JobEngineError::InvalidStartOptions { .. }));

    let stranger = JobStartOptions {
        target_id_sublist: vec!["gw-9".into()],
        ..Default::default()
    };
    let err = engine
        .coordinator
        .start_job_with_options(TENANT, "partial", stranger)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "JOB_INVALID_START_OPTIONS");

    let err = engine.coordinator.start_job(TENANT, "missing").await.unwrap_err();
    assert!(matches!(err, JobEngineError::JobNotFound { .. }));
    assert!(engine.executions.list(TENANT, "partial").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_continues_at_first_open_step() {
    let gated = Gated::new();
    let engine = Engine::with(fast_config(), vec![("gated", gated.clone() as Arc<dyn TargetProcessor>)]);
    let steps = vec![
        device_step("bundles", "BUN-V1", Method::Read),
        step_with("wait", "gated"),
    ];
    engine
        .coordinator
        .define_job(job("staged", steps, &["gw-1"]))
        .await
        .unwrap();

    let StartOutcome::Started(execution_id) = engine.coordinator.start_job(TENANT, "staged").await.unwrap() else {
        panic!("start should run");
    };
    gated.entered().await;

    engine.coordinator.stop_job(TENANT, "staged").await.unwrap();
    assert!(!engine.coordinator.is_running(TENANT, "staged").await.unwrap());
    gated.open();
    wait_until_idle(&engine, execution_id).await;

    let stopped = engine.executions.find(TENANT, "staged", execution_id).await.unwrap().unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Stopped);
    let target = &targets_by_id(&engine, "staged").await["gw-1"];
    assert_eq!(target.progress.step_index, 1);
    assert_eq!(target.progress.status, TargetStatus::ProcessAgain);

    engine
        .coordinator
        .resume_job_execution(TENANT, "staged", execution_id)
        .await
        .unwrap();
    let executions = engine.settle("staged").await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);

    // The device step finished before the stop and was not sent again
    assert_eq!(engine.devices.published_to("gw-1"), 1);
    assert_eq!(gated.calls(), 2);

    wait_until_idle(&engine, execution_id).await;
    let err = engine
        .coordinator
        .resume_job_execution(TENANT, "staged", execution_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JobEngineError::ExecutionNotResumable {
            status: ExecutionStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_silent_device_fails_after_bounded_passes() {
    let engine = Engine::new();
    engine.devices.set("gw-quiet", Behaviour::Silent);
    let step = JobStepDefinition {
        timeout_ms: Some(50),
        ..device_step("bundles", "BUN-V1", Method::Read)
    };
    engine
        .coordinator
        .define_job(job("quiet", vec![step], &["gw-quiet", "gw-loud"]))
        .await
        .unwrap();

    engine.coordinator.start_job(TENANT, "quiet").await.unwrap();
    let executions = engine.settle("quiet").await;
    assert_eq!(executions[0].status, ExecutionStatus::Completed);

    let targets = targets_by_id(&engine, "quiet").await;
    assert_eq!(targets["gw-loud"].progress.status, TargetStatus::ProcessOk);
    let quiet = &targets["gw-quiet"];
    assert_eq!(quiet.progress.status, TargetStatus::ProcessFailed);
    assert!(quiet.last_exception.as_deref().is_some_and(|e| e.contains("passes")));

    // Later passes observed the first operation instead of sending again
    assert_eq!(engine.devices.published_to("gw-quiet"), 1);
}

#[tokio::test]
async fn test_clean_data_refused_while_running() {
    let gated = Gated::new();
    let engine = Engine::with(fast_config(), vec![("gated", gated.clone() as Arc<dyn TargetProcessor>)]);
    engine
        .coordinator
        .define_job(job("sync", vec![step_with("wait", "gated")], &["gw-1"]))
        .await
        .unwrap();
    engine.coordinator.start_job(TENANT, "sync").await.unwrap();
    gated.entered().await;

    let err = engine.coordinator.clean_job_data(TENANT, "sync").await.unwrap_err();
    assert!(matches!(err, JobEngineError::JobRunning { .. }));

    gated.open();
    engine.settle("sync").await;
    engine.coordinator.clean_job_data(TENANT, "sync").await.unwrap();
    assert!(engine.targets.list(TENANT, "sync").await.unwrap().is_empty());
    assert!(engine.executions.list(TENANT, "sync").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_device_offline_on_first_pass_is_sent_again() {
    let config = CoordinatorConfig {
        again_delay: Duration::from_millis(200),
        ..fast_config()
    };
    let engine = Engine::with(config, Vec::new());
    engine.devices.set("gw-late", Behaviour::Unreachable);
    engine
        .coordinator
        .define_job(job("late", vec![device_step("bundles", "BUN-V1", Method::Read)], &["gw-late"]))
        .await
        .unwrap();
    engine.coordinator.start_job(TENANT, "late").await.unwrap();

    let wait = async {
        loop {
            let targets = targets_by_id(&engine, "late").await;
            if targets.get("gw-late").is_some_and(|t| t.progress.status == TargetStatus::ProcessAgain) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("target never asked for another pass");
    engine.devices.set("gw-late", Behaviour::Reply(200));

    let executions = engine.settle("late").await;
    assert_eq!(executions[0].status, ExecutionStatus::Completed);

    let target = &targets_by_id(&engine, "late").await["gw-late"];
    assert_eq!(target.progress.status, TargetStatus::ProcessOk);
    assert_eq!(engine.devices.published_to("gw-late"), 1);
    assert_eq!(engine.operations.count().await, 2);

    let operation = engine
        .operations
        .find(target.operation_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(operation.published);
    assert_eq!(operation.status, OperationStatus::Completed);
}
