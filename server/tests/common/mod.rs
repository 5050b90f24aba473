#![allow(dead_code)]

use async_trait::async_trait;
use devmgmt_server::command::{CommandDispatcher, DispatcherConfig, ResponseCorrelator};
use devmgmt_server::events::EventRecorder;
use devmgmt_server::job::{
    CoordinatorConfig, DeviceCommandProcessor, ExecutionStatus, Job, JobCoordinator, JobExecutionRepository,
    JobStepDefinition, ProcessorRegistry, RequestTemplate, TargetProcessor, DEVICE_COMMAND_PROCESSOR,
};
use devmgmt_server::store::{
    InMemoryEventStore, InMemoryJobExecutionStore, InMemoryJobStore, InMemoryJobTargetStore,
    InMemoryOperationStore,
};
use devmgmt_server::translator::TranslatorRegistry;
use devmgmt_server::transport::{DeviceTransport, TransportError};
use devmgmt_shared::{now_ms, DeviceChannel, DeviceEnvelope, DevicePayload, DeviceTopic, Method};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

pub const TENANT: &str = "1";

/// How a simulated device answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Reply right away with this result code
    Reply(u32),
    /// Never reply
    Silent,
    /// The device is not connected
    Unreachable,
}

/// Transport whose devices answer according to a script
pub struct ScriptedDevices {
    dispatcher: OnceLock<Weak<CommandDispatcher>>,
    behaviours: Mutex<HashMap<String, Behaviour>>,
    published: Mutex<Vec<DeviceEnvelope>>,
}

impl ScriptedDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatcher: OnceLock::new(),
            behaviours: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, dispatcher: &Arc<CommandDispatcher>) {
        let _ = self.dispatcher.set(Arc::downgrade(dispatcher));
    }

    pub fn set(&self, client_id: &str, behaviour: Behaviour) {
        self.behaviours.lock().unwrap().insert(client_id.to_string(), behaviour);
    }

    pub fn published(&self) -> Vec<DeviceEnvelope> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, client_id: &str) -> usize {
        self.published()
            .iter()
            .filter(|e| e.channel.as_ref().is_some_and(|c| c.client_id == client_id))
            .count()
    }

    fn behaviour(&self, client_id: &str) -> Behaviour {
        self.behaviours
            .lock()
            .unwrap()
            .get(client_id)
            .copied()
            .unwrap_or(Behaviour::Reply(200))
    }
}

/// Reply a device would send for `request`
pub fn reply_to(request: &DeviceEnvelope, result_code: u32) -> DeviceEnvelope {
    let channel = request.channel.as_ref().expect("request has a channel");
    DeviceEnvelope {
        channel: Some(DeviceChannel::reply_to(channel, result_code)),
        payload: Some(DevicePayload {
            timestamp_ms: now_ms() as i64,
            ..Default::default()
        }),
    }
}

#[async_trait]
impl DeviceTransport for ScriptedDevices {
    async fn publish(&self, topic: &DeviceTopic, envelope: &DeviceEnvelope) -> Result<(), TransportError> {
        match self.behaviour(&topic.client_id) {
            Behaviour::Unreachable => return Err(TransportError::NotConnected(topic.to_string())),
            Behaviour::Silent => {}
            Behaviour::Reply(code) => {
                let reply = reply_to(envelope, code);
                if let Some(dispatcher) = self.dispatcher.get().and_then(Weak::upgrade) {
                    tokio::spawn(async move { dispatcher.handle_reply(reply).await });
                }
            }
        }
        self.published.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Every component wired over in-memory stores and scripted devices
pub struct Engine {
    pub devices: Arc<ScriptedDevices>,
    pub correlator: Arc<ResponseCorrelator>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub operations: Arc<InMemoryOperationStore>,
    pub event_store: Arc<InMemoryEventStore>,
    pub recorder: Arc<EventRecorder>,
    pub targets: Arc<InMemoryJobTargetStore>,
    pub executions: Arc<InMemoryJobExecutionStore>,
    pub coordinator: JobCoordinator,
}

impl Engine {
    pub fn new() -> Self {
        Self::with(fast_config(), Vec::new())
    }

    pub fn with(config: CoordinatorConfig, extra: Vec<(&str, Arc<dyn TargetProcessor>)>) -> Self {
        let translators = Arc::new(TranslatorRegistry::with_defaults());
        let devices = ScriptedDevices::new();
        let correlator = Arc::new(ResponseCorrelator::new(translators.clone()));
        let operations = Arc::new(InMemoryOperationStore::new());
        let event_store = Arc::new(InMemoryEventStore::new());
        let recorder = Arc::new(EventRecorder::new(event_store.clone(), config.node_id.clone()));

        let dispatcher = Arc::new(CommandDispatcher::new(
            devices.clone(),
            correlator.clone(),
            operations.clone(),
            recorder.clone(),
            translators,
            DispatcherConfig {
                default_timeout: Duration::from_millis(300),
                ..Default::default()
            },
        ));
        devices.attach(&dispatcher);

        let mut processors = ProcessorRegistry::new().with(
            DEVICE_COMMAND_PROCESSOR,
            Arc::new(DeviceCommandProcessor::new(dispatcher.clone(), operations.clone())),
        );
        for (name, processor) in extra {
            processors = processors.with(name, processor);
        }

        let targets = Arc::new(InMemoryJobTargetStore::new());
        let executions = Arc::new(InMemoryJobExecutionStore::new());
        let coordinator = JobCoordinator::new(
            Arc::new(InMemoryJobStore::new()),
            targets.clone(),
            executions.clone(),
            processors,
            recorder.clone(),
            config,
        );

        Self {
            devices,
            correlator,
            dispatcher,
            operations,
            event_store,
            recorder,
            targets,
            executions,
            coordinator,
        }
    }

    /// Wait until no execution of the job is RUNNING or QUEUED
    pub async fn settle(&self, job_id: &str) -> Vec<devmgmt_server::job::QueuedJobExecution> {
        let wait = async {
            loop {
                let executions = self.executions.list(TENANT, job_id).await.unwrap();
                let busy = executions
                    .iter()
                    .any(|e| matches!(e.status, ExecutionStatus::Running | ExecutionStatus::Queued));
                if !busy && !executions.is_empty() {
                    return executions;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("job did not settle")
    }
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        node_id: "node-test".to_string(),
        max_concurrent_targets: 4,
        again_delay: Duration::from_millis(20),
        max_again_passes: 3,
    }
}

pub fn device_step(name: &str, app: &str, method: Method) -> JobStepDefinition {
    JobStepDefinition {
        name: name.to_string(),
        processor: DEVICE_COMMAND_PROCESSOR.to_string(),
        template: RequestTemplate::new(app, method),
        timeout_ms: Some(200),
    }
}

pub fn job(job_id: &str, steps: Vec<JobStepDefinition>, targets: &[&str]) -> Job {
    Job {
        job_id: job_id.to_string(),
        tenant_id: TENANT.to_string(),
        name: format!("{job_id} job"),
        steps,
        target_ids: targets.iter().map(|t| t.to_string()).collect(),
    }
}
