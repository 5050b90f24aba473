use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobCoordinator, JobEngineError, JobStartOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsRunningResponse {
    pub job_id: String,
    pub is_running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsRunningManyRequest {
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsRunningManyResponse {
    pub results: Vec<IsRunningResponse>,
}

/// Typed handlers behind the control routes
#[derive(Clone)]
pub struct JobEngineControl {
    coordinator: JobCoordinator,
}

impl JobEngineControl {
    pub fn new(coordinator: JobCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn clean_data(&self, scope_id: &str, job_id: &str) -> Result<(), JobEngineError> {
        self.coordinator.clean_job_data(scope_id, job_id).await
    }

    pub async fn is_running(&self, scope_id: &str, job_id: &str) -> Result<IsRunningResponse, JobEngineError> {
        Ok(IsRunningResponse {
            job_id: job_id.to_string(),
            is_running: self.coordinator.is_running(scope_id, job_id).await?,
        })
    }

    pub async fn is_running_many(
        &self,
        scope_id: &str,
        request: IsRunningManyRequest,
    ) -> Result<IsRunningManyResponse, JobEngineError> {
        let results = self
            .coordinator
            .is_running_many(scope_id, &request.job_ids)
            .await?
            .into_iter()
            .map(|(job_id, is_running)| IsRunningResponse { job_id, is_running })
            .collect();
        Ok(IsRunningManyResponse { results })
    }

    pub async fn resume_execution(
        &self,
        scope_id: &str,
        job_id: &str,
        execution_id: Uuid,
    ) -> Result<(), JobEngineError> {
        self.coordinator
            .resume_job_execution(scope_id, job_id, execution_id)
            .await
    }

    pub async fn start(&self, scope_id: &str, job_id: &str) -> Result<(), JobEngineError> {
        self.coordinator.start_job(scope_id, job_id).await.map(drop)
    }

    pub async fn start_with_options(
        &self,
        scope_id: &str,
        job_id: &str,
        options: JobStartOptions,
    ) -> Result<(), JobEngineError> {
        self.coordinator
            .start_job_with_options(scope_id, job_id, options)
            .await
            .map(drop)
    }

    pub async fn stop(&self, scope_id: &str, job_id: &str) -> Result<(), JobEngineError> {
        self.coordinator.stop_job(scope_id, job_id).await
    }

    pub async fn stop_execution(&self, scope_id: &str, job_id: &str, execution_id: Uuid) -> Result<(), JobEngineError> {
        self.coordinator
            .stop_job_execution(scope_id, job_id, execution_id)
            .await
    }
}
