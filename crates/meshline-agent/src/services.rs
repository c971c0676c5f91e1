use std::sync::Arc;

use chrono::Utc;
use meshline_core::{DEFAULT_SPEC_HASH_LEN, spec_hash_with_len};
use meshline_task::{
    AnimationPayload, RefinePayload, RetexturePayload, RiggingPayload, StagePayload, TaskId,
    TaskSubmission, Text3dPayload,
};
use serde_json::{Map, Value};

use crate::client::ProviderClient;
use crate::error::{Error, Result};
use crate::repository::{TaskRepository, validate_entity};

const AI_MODEL: &str = "meshy-4";

/// Stage-specific parameters that turn into a provider request once the
/// callback URL is known.
pub trait StageRequest {
    fn into_payload(self, callback_url: String) -> StagePayload;
}

#[derive(Debug, Clone)]
pub struct Text3dRequest {
    pub prompt: String,
    pub art_style: String,
    pub model_version: String,
    pub negative_prompt: String,
    pub enable_pbr: bool,
    /// Remesh so the result can be retextured later.
    pub enable_retexture: bool,
    pub seed: Option<i64>,
}

impl Text3dRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            art_style: "sculpture".to_string(),
            model_version: "latest".to_string(),
            negative_prompt: String::new(),
            enable_pbr: true,
            enable_retexture: true,
            seed: None,
        }
    }
}

impl StageRequest for Text3dRequest {
    fn into_payload(self, callback_url: String) -> StagePayload {
        StagePayload::Text3d(Text3dPayload {
            mode: "preview".to_string(),
            prompt: self.prompt,
            art_style: self.art_style,
            model_version: self.model_version,
            negative_prompt: self.negative_prompt,
            enable_pbr: self.enable_pbr,
            ai_model: AI_MODEL.to_string(),
            topology: "quad".to_string(),
            callback_url,
            should_remesh: self.enable_retexture.then_some(true),
            seed: self.seed,
            extra: Map::new(),
        })
    }
}

/// Full-quality pass over a finished preview task.
#[derive(Debug, Clone)]
pub struct RefineRequest {
    pub preview_task_id: TaskId,
}

impl StageRequest for RefineRequest {
    fn into_payload(self, callback_url: String) -> StagePayload {
        StagePayload::Refine(RefinePayload {
            parent_task_id: self.preview_task_id.0,
            callback_url,
            extra: Map::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RiggingRequest {
    pub model_id: String,
}

impl StageRequest for RiggingRequest {
    fn into_payload(self, callback_url: String) -> StagePayload {
        StagePayload::Rigging(RiggingPayload {
            model_id: self.model_id,
            callback_url,
            extra: Map::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AnimationRequest {
    /// Task id of a rigged model.
    pub model_id: String,
    pub animation_id: String,
}

impl StageRequest for AnimationRequest {
    fn into_payload(self, callback_url: String) -> StagePayload {
        StagePayload::Animation(AnimationPayload {
            model_id: self.model_id,
            animation_id: self.animation_id,
            callback_url,
            extra: Map::new(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RetextureRequest {
    pub model_id: String,
    pub prompt: String,
    pub art_style: String,
    pub negative_prompt: String,
    pub enable_pbr: bool,
    pub resolution: String,
    pub seed: Option<i64>,
}

impl RetextureRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            art_style: "realistic".to_string(),
            negative_prompt: String::new(),
            enable_pbr: true,
            resolution: "1024".to_string(),
            seed: None,
        }
    }
}

impl StageRequest for RetextureRequest {
    fn into_payload(self, callback_url: String) -> StagePayload {
        StagePayload::Retexture(RetexturePayload {
            model_id: self.model_id,
            prompt: self.prompt,
            art_style: self.art_style,
            negative_prompt: self.negative_prompt,
            enable_pbr: self.enable_pbr,
            resolution: self.resolution,
            ai_model: AI_MODEL.to_string(),
            callback_url,
            seed: self.seed,
            extra: Map::new(),
        })
    }
}

fn extract_task_id(response: &Value) -> Result<TaskId> {
    match response.get("result").and_then(Value::as_str).map(str::trim) {
        Some(id) if !id.is_empty() => Ok(TaskId::from(id)),
        _ => Err(Error::EmptyTaskId),
    }
}

/// Submits any stage and records the result. Stages differ only in
/// payload shape and endpoint.
#[derive(Debug, Clone)]
pub struct SubmissionService {
    client: Arc<ProviderClient>,
    repository: Arc<TaskRepository>,
}

impl SubmissionService {
    pub fn new(client: Arc<ProviderClient>, repository: Arc<TaskRepository>) -> Self {
        Self { client, repository }
    }

    pub async fn submit_task<R: StageRequest>(
        &self,
        entity: &str,
        request: R,
        callback_url: &str,
    ) -> Result<TaskSubmission> {
        self.submit_payload(entity, request.into_payload(callback_url.to_string()))
            .await
    }

    pub async fn submit_payload(
        &self,
        entity: &str,
        payload: StagePayload,
    ) -> Result<TaskSubmission> {
        // Checked before the request: a task the provider accepted but we
        // cannot record would be orphaned.
        validate_entity(entity)?;
        if payload.callback_url().trim().is_empty() {
            return Err(Error::Validation("callback_url cannot be empty".to_string()));
        }
        let service = payload.service();
        let (version, endpoint) = payload.endpoint();
        let body = payload.request_body()?;

        let response = match self.client.post(version, &endpoint, &body).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(%entity, %service, %endpoint, error = %e, "submission failed");
                return Err(e.into());
            }
        };
        let task_id = extract_task_id(&response)?;

        let (spec_hash, fingerprint) =
            spec_hash_with_len(&payload.hash_input()?, DEFAULT_SPEC_HASH_LEN)?;
        let submission = TaskSubmission::pending(task_id, spec_hash, entity, payload, Utc::now())
            .with_fingerprint(fingerprint);
        self.repository.record_submission(&submission).await?;

        tracing::info!(
            %entity,
            %service,
            task_id = %submission.task_id,
            spec_hash = %submission.spec_hash,
            "task submitted"
        );
        Ok(submission)
    }
}
