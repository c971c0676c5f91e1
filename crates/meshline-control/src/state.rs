use std::sync::Arc;

use meshline_agent::{ProgressRegistry, ServiceFactory, TaskRepository, WebhookHandler};

#[derive(Debug, Clone)]
pub struct AppState {
    pub handler: WebhookHandler,
    pub repository: Arc<TaskRepository>,
    pub progress: Arc<ProgressRegistry>,
    pub webhook_secret: Option<Arc<[u8]>>,
}

impl AppState {
    pub fn new(factory: &ServiceFactory, webhook_secret: Option<&str>) -> Self {
        let progress = Arc::new(ProgressRegistry::new());
        Self {
            handler: factory.webhook_handler(progress.clone()),
            repository: factory.repository().clone(),
            progress,
            webhook_secret: webhook_secret.map(|s| Arc::from(s.as_bytes())),
        }
    }
}
