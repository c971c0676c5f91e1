use std::sync::Arc;

use meshline_task::ServiceKind;

use crate::client::ProviderClient;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::progress::ProgressRegistry;
use crate::repository::{TaskRepository, validate_entity};
use crate::services::SubmissionService;
use crate::webhook::WebhookHandler;

/// Wires one client and one repository into the services that share them.
#[derive(Debug, Clone)]
pub struct ServiceFactory {
    client: Arc<ProviderClient>,
    repository: Arc<TaskRepository>,
    webhook_base_url: String,
    download_artifacts: bool,
}

impl ServiceFactory {
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let client = Arc::new(ProviderClient::new(config.client.clone())?);
        let repository = Arc::new(TaskRepository::open(&config.data_root).await?);
        tracing::info!(
            data_root = %config.data_root.display(),
            api = %config.client.base_url,
            webhooks = %config.webhook_base_url,
            has_api_key = config.client.api_key.is_some(),
            "service factory ready"
        );
        Ok(Self::new(
            client,
            repository,
            config.webhook_base_url.clone(),
            config.download_artifacts,
        ))
    }

    pub fn new(
        client: Arc<ProviderClient>,
        repository: Arc<TaskRepository>,
        webhook_base_url: impl Into<String>,
        download_artifacts: bool,
    ) -> Self {
        Self {
            client,
            repository,
            webhook_base_url: webhook_base_url.into().trim_end_matches('/').to_string(),
            download_artifacts,
        }
    }

    /// `{base}/{entity}/{endpoint}`; the callback path carries the entity
    /// so the receiver can narrow its lookup.
    pub fn webhook_url(&self, entity: &str, service: ServiceKind) -> Result<String> {
        validate_entity(entity)?;
        Ok(format!(
            "{}/{}/{}",
            self.webhook_base_url,
            entity,
            service.webhook_endpoint()
        ))
    }

    pub fn submissions(&self) -> SubmissionService {
        SubmissionService::new(self.client.clone(), self.repository.clone())
    }

    pub fn webhook_handler(&self, progress: Arc<ProgressRegistry>) -> WebhookHandler {
        WebhookHandler::new(
            self.repository.clone(),
            self.client.clone(),
            progress,
            self.download_artifacts,
        )
    }

    pub fn client(&self) -> &Arc<ProviderClient> {
        &self.client
    }

    pub fn repository(&self) -> &Arc<TaskRepository> {
        &self.repository
    }
}
