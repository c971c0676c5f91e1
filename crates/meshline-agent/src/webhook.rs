use std::sync::Arc;

use chrono::Utc;
use meshline_task::{
    ArtifactRecord, ServiceKind, StatusSource, StatusUpdate, TaskId, TaskStatus,
    UpdateDisposition, WebhookPayload,
};

use crate::client::ProviderClient;
use crate::error::{Error, Result};
use crate::progress::ProgressRegistry;
use crate::repository::{TaskLocation, TaskRepository};

/// Result of one callback, shaped for logging and for the HTTP response.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed {
        entity: String,
        spec_hash: String,
        service: ServiceKind,
        task_id: TaskId,
        task_status: TaskStatus,
        artifacts_downloaded: usize,
        disposition: UpdateDisposition,
    },
    NotFound {
        task_id: TaskId,
    },
}

#[derive(Debug, Clone)]
pub struct WebhookHandler {
    repository: Arc<TaskRepository>,
    client: Arc<ProviderClient>,
    progress: Arc<ProgressRegistry>,
    download_artifacts: bool,
}

impl WebhookHandler {
    pub fn new(
        repository: Arc<TaskRepository>,
        client: Arc<ProviderClient>,
        progress: Arc<ProgressRegistry>,
        download_artifacts: bool,
    ) -> Self {
        Self {
            repository,
            client,
            progress,
            download_artifacts,
        }
    }

    pub fn repository(&self) -> &Arc<TaskRepository> {
        &self.repository
    }

    pub fn progress(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    async fn resolve(
        &self,
        task_id: &TaskId,
        entity_hint: Option<&str>,
    ) -> Result<Option<TaskLocation>> {
        if let Some(hint) = entity_hint {
            if let Some(loc) = self.repository.find_by_task_id(task_id, Some(hint)).await? {
                return Ok(Some(loc));
            }
            tracing::debug!(%task_id, entity = %hint, "task not under hinted entity, scanning all");
        }
        self.repository.find_by_task_id(task_id, None).await
    }

    /// Applies a provider callback. The owning entity is resolved from the
    /// task id; `entity_hint`, usually taken from the callback path, only
    /// narrows the first lookup.
    pub async fn handle(
        &self,
        payload: WebhookPayload,
        entity_hint: Option<&str>,
    ) -> Result<WebhookOutcome> {
        let task_id = payload.id.clone();
        let status = payload.status;
        self.progress
            .record(&task_id, status, payload.progress_percent());

        let Some(TaskLocation {
            entity,
            spec_hash,
            asset,
        }) = self.resolve(&task_id, entity_hint).await?
        else {
            tracing::warn!(%task_id, %status, "webhook for unknown task");
            return Ok(WebhookOutcome::NotFound { task_id });
        };

        let Some(entry) = asset.entry(&task_id) else {
            tracing::error!(%entity, %spec_hash, %task_id, "task resolved but missing from task graph");
            return Err(Error::Inconsistent(format!(
                "task {task_id} resolved to {entity}/{spec_hash} but has no graph entry"
            )));
        };
        let service = entry.service;
        let already_terminal = entry.status.is_terminal();

        let error = match status {
            TaskStatus::Failed => Some(
                payload
                    .error_message()
                    .unwrap_or("task failed without an error message")
                    .to_string(),
            ),
            TaskStatus::Canceled | TaskStatus::Expired => {
                payload.error_message().map(str::to_string)
            }
            _ => None,
        };
        let mut result_paths = payload.all_urls();

        let mut artifacts = Vec::new();
        if status == TaskStatus::Succeeded && self.download_artifacts && !already_terminal {
            if let Some(url) = payload.primary_model_url() {
                if let Some(artifact) = self.download_model(&entity, &spec_hash, service, url).await {
                    result_paths.insert("local_glb".to_string(), artifact.relative_path.clone());
                    artifacts.push(artifact);
                }
            }
        }
        let artifacts_downloaded = artifacts.len();

        let update = StatusUpdate::new(task_id.clone(), status, StatusSource::Webhook)
            .with_service(service)
            .with_result_paths(result_paths)
            .with_artifacts(artifacts)
            .with_error(error);
        let disposition = self
            .repository
            .record_status_update(&entity, &spec_hash, update)
            .await?;

        tracing::info!(
            %entity,
            %spec_hash,
            %service,
            %task_id,
            %status,
            disposition = disposition.as_str(),
            artifacts_downloaded,
            "webhook processed"
        );
        Ok(WebhookOutcome::Processed {
            entity,
            spec_hash,
            service,
            task_id,
            task_status: status,
            artifacts_downloaded,
            disposition,
        })
    }

    // Download failures are logged and leave the artifact ledger untouched;
    // the status update still goes through.
    async fn download_model(
        &self,
        entity: &str,
        spec_hash: &str,
        service: ServiceKind,
        url: &str,
    ) -> Option<ArtifactRecord> {
        let file_name = format!("{spec_hash}_{}.glb", service.as_str());
        let path = self.repository.entity_dir(entity).join(&file_name);

        match self.client.download_file(url, &path).await {
            Ok(download) => Some(ArtifactRecord {
                relative_path: file_name,
                sha256_hash: download.sha256,
                file_size_bytes: download.bytes,
                downloaded_at: Utc::now(),
                source_url: Some(url.to_string()),
            }),
            Err(e) => {
                tracing::warn!(%entity, %spec_hash, %service, %url, error = %e, "artifact download failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{SubmissionService, Text3dRequest};
    use crate::test_support::{fast_client_config, serve};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use meshline_task::TaskSubmission;
    use serde_json::json;

    const GLB: &[u8] = b"glTF\x02\x00\x00\x00 otter mesh bytes";

    struct Harness {
        _dir: tempfile::TempDir,
        base: String,
        repo: Arc<TaskRepository>,
        submissions: SubmissionService,
        handler: WebhookHandler,
    }

    async fn harness() -> Harness {
        let router = Router::new()
            .route(
                "/openapi/v2/text-to-3d",
                post(|| async { Json(json!({"result": "018f-otter"})) }),
            )
            .route("/cdn/otter.glb", get(|| async { GLB }))
            .route(
                "/cdn/broken.glb",
                get(|| async { axum::http::StatusCode::FORBIDDEN }),
            );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(TaskRepository::open(dir.path()).await.unwrap());
        let client = Arc::new(ProviderClient::new(fast_client_config(&base)).unwrap());
        let progress = Arc::new(ProgressRegistry::new());
        Harness {
            _dir: dir,
            base,
            repo: repo.clone(),
            submissions: SubmissionService::new(client.clone(), repo.clone()),
            handler: WebhookHandler::new(repo, client, progress, true),
        }
    }

    async fn submit_otter(h: &Harness) -> TaskSubmission {
        h.submissions
            .submit_task(
                "otter",
                Text3dRequest::new("realistic river otter"),
                "http://localhost:8000/webhooks/meshy/otter/text3d",
            )
            .await
            .unwrap()
    }

    fn callback(status: &str, glb: Option<String>) -> WebhookPayload {
        let mut v = json!({
            "id": "018f-otter",
            "status": status,
            "progress": if status == "SUCCEEDED" { 100 } else { 0 },
            "created_at": 1_717_000_000_000_i64,
            "thumbnail_url": "https://cdn.example/otter.png",
        });
        if let Some(url) = glb {
            v["model_urls"] = json!({"glb": url, "fbx": "https://cdn.example/otter.fbx"});
        }
        if status == "FAILED" {
            v["task_error"] = json!({"message": "prompt rejected"});
        }
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn otter_end_to_end() {
        let h = harness().await;
        let sub = submit_otter(&h).await;

        let pending = h.repo.list_pending("otter").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_graph.len(), 1);
        assert_eq!(pending[0].task_graph[0].status, TaskStatus::Pending);

        let glb_url = format!("{}/cdn/otter.glb", h.base);
        let outcome = h
            .handler
            .handle(callback("SUCCEEDED", Some(glb_url.clone())), Some("otter"))
            .await
            .unwrap();
        match &outcome {
            WebhookOutcome::Processed {
                entity,
                spec_hash,
                service,
                task_status,
                artifacts_downloaded,
                disposition,
                ..
            } => {
                assert_eq!(entity, "otter");
                assert_eq!(spec_hash, &sub.spec_hash);
                assert_eq!(*service, ServiceKind::Text3d);
                assert_eq!(*task_status, TaskStatus::Succeeded);
                assert_eq!(*artifacts_downloaded, 1);
                assert!(matches!(disposition, UpdateDisposition::Applied { .. }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let asset = h.repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        let entry = &asset.task_graph[0];
        assert_eq!(entry.status, TaskStatus::Succeeded);
        assert_eq!(entry.result_paths["glb"], glb_url);
        assert_eq!(entry.result_paths["thumbnail"], "https://cdn.example/otter.png");
        assert_eq!(asset.artifacts.len(), 1);
        let artifact = &asset.artifacts[0];
        assert_eq!(artifact.relative_path, format!("{}_text3d.glb", sub.spec_hash));
        assert_eq!(artifact.sha256_hash, meshline_core::sha256_hex(GLB));
        assert_eq!(artifact.file_size_bytes, GLB.len() as u64);
        let on_disk = std::fs::read(h.repo.entity_dir("otter").join(&artifact.relative_path)).unwrap();
        assert_eq!(on_disk, GLB);
        assert_eq!(asset.history.len(), 2);
        assert!(h.repo.list_pending("otter").await.unwrap().is_empty());

        // Redelivery changes nothing.
        let before = h.repo.load("otter").await.unwrap();
        let again = h
            .handler
            .handle(callback("SUCCEEDED", Some(glb_url)), None)
            .await
            .unwrap();
        assert!(matches!(
            again,
            WebhookOutcome::Processed {
                artifacts_downloaded: 0,
                disposition: UpdateDisposition::Duplicate { .. },
                ..
            }
        ));
        let after = h.repo.load("otter").await.unwrap();
        assert_eq!(before, after);

        let snap = h.handler.progress().get(&sub.task_id).unwrap();
        assert!(snap.done);
        assert_eq!(snap.progress, 100);
    }

    #[tokio::test]
    async fn late_success_after_failure_is_ignored() {
        let h = harness().await;
        let sub = submit_otter(&h).await;

        h.handler.handle(callback("FAILED", None), None).await.unwrap();
        let asset = h.repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        assert_eq!(asset.task_graph[0].status, TaskStatus::Failed);
        assert_eq!(asset.task_graph[0].error.as_deref(), Some("prompt rejected"));

        let glb_url = format!("{}/cdn/otter.glb", h.base);
        let outcome = h
            .handler
            .handle(callback("SUCCEEDED", Some(glb_url)), None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Processed {
                artifacts_downloaded: 0,
                disposition: UpdateDisposition::RejectedTerminal { .. },
                ..
            }
        ));
        let asset = h.repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        assert_eq!(asset.task_graph[0].status, TaskStatus::Failed);
        assert!(asset.artifacts.is_empty());
        assert!(!h.repo.entity_dir("otter").join(format!("{}_text3d.glb", sub.spec_hash)).exists());
    }

    #[tokio::test]
    async fn canceled_callback_is_terminal() {
        let h = harness().await;
        let sub = submit_otter(&h).await;

        let canceled: WebhookPayload = serde_json::from_value(json!({
            "id": "018f-otter",
            "status": "CANCELED",
            "progress": 20,
            "task_error": {"message": "canceled by user"}
        }))
        .unwrap();
        let outcome = h.handler.handle(canceled, Some("otter")).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Processed {
                task_status: TaskStatus::Canceled,
                disposition: UpdateDisposition::Applied { .. },
                ..
            }
        ));
        let asset = h.repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        assert_eq!(asset.task_graph[0].status, TaskStatus::Canceled);
        assert_eq!(asset.task_graph[0].error.as_deref(), Some("canceled by user"));
        assert!(h.repo.list_pending("otter").await.unwrap().is_empty());

        let glb_url = format!("{}/cdn/otter.glb", h.base);
        let late = h
            .handler
            .handle(callback("SUCCEEDED", Some(glb_url)), None)
            .await
            .unwrap();
        assert!(matches!(
            late,
            WebhookOutcome::Processed {
                artifacts_downloaded: 0,
                disposition: UpdateDisposition::RejectedTerminal { .. },
                ..
            }
        ));
        assert!(h.handler.progress().get(&sub.task_id).unwrap().done);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let h = harness().await;
        let outcome = h.handler.handle(callback("SUCCEEDED", None), Some("otter")).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::NotFound {
                task_id: TaskId::from("018f-otter")
            }
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "not_found");
    }

    #[tokio::test]
    async fn wrong_entity_hint_falls_back_to_scan() {
        let h = harness().await;
        let sub = submit_otter(&h).await;
        h.repo.load("beaver").await.unwrap();
        let outcome = h
            .handler
            .handle(callback("IN_PROGRESS", None), Some("beaver"))
            .await
            .unwrap();
        match outcome {
            WebhookOutcome::Processed { entity, spec_hash, .. } => {
                assert_eq!(entity, "otter");
                assert_eq!(spec_hash, sub.spec_hash);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_download_still_records_success() {
        let h = harness().await;
        let sub = submit_otter(&h).await;
        let broken = format!("{}/cdn/broken.glb", h.base);
        let outcome = h
            .handler
            .handle(callback("SUCCEEDED", Some(broken.clone())), None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Processed {
                artifacts_downloaded: 0,
                ..
            }
        ));
        let asset = h.repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        assert_eq!(asset.task_graph[0].status, TaskStatus::Succeeded);
        assert_eq!(asset.task_graph[0].result_paths["glb"], broken);
        assert!(asset.artifacts.is_empty());
    }
}
