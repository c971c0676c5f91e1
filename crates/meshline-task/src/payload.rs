use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::ServiceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

/// text-to-3d preview request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text3dPayload {
    pub mode: String,
    pub prompt: String,
    pub art_style: String,
    pub model_version: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub enable_pbr: bool,
    pub ai_model: String,
    pub topology: String,
    pub callback_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_remesh: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Refinement of a finished preview. Only `callback_url` goes over the wire;
/// the parent id is part of the endpoint path and of the spec hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinePayload {
    pub parent_task_id: String,
    pub callback_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiggingPayload {
    pub model_id: String,
    pub callback_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationPayload {
    pub model_id: String,
    pub animation_id: String,
    pub callback_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetexturePayload {
    pub model_id: String,
    pub prompt: String,
    pub art_style: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub enable_pbr: bool,
    pub resolution: String,
    pub ai_model: String,
    pub callback_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Exact request sent for one stage invocation. Unknown fields survive a
/// load/save cycle through each variant's `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    Text3d(Text3dPayload),
    Refine(RefinePayload),
    Rigging(RiggingPayload),
    Animation(AnimationPayload),
    Retexture(RetexturePayload),
}

impl StagePayload {
    pub fn service(&self) -> ServiceKind {
        match self {
            Self::Text3d(_) => ServiceKind::Text3d,
            Self::Refine(_) => ServiceKind::Refine,
            Self::Rigging(_) => ServiceKind::Rigging,
            Self::Animation(_) => ServiceKind::Animation,
            Self::Retexture(_) => ServiceKind::Retexture,
        }
    }

    pub fn callback_url(&self) -> &str {
        match self {
            Self::Text3d(p) => &p.callback_url,
            Self::Refine(p) => &p.callback_url,
            Self::Rigging(p) => &p.callback_url,
            Self::Animation(p) => &p.callback_url,
            Self::Retexture(p) => &p.callback_url,
        }
    }

    /// Free-text prompt, for stages that take one.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::Text3d(p) => Some(&p.prompt),
            Self::Retexture(p) => Some(&p.prompt),
            _ => None,
        }
    }

    /// Provider API version and path relative to `/openapi/{version}/`.
    pub fn endpoint(&self) -> (ApiVersion, String) {
        match self {
            Self::Text3d(_) => (ApiVersion::V2, "text-to-3d".to_string()),
            Self::Refine(p) => (
                ApiVersion::V2,
                format!("text-to-3d/{}/refine", p.parent_task_id),
            ),
            Self::Rigging(_) => (ApiVersion::V1, "rigging".to_string()),
            Self::Animation(_) => (ApiVersion::V1, "animations".to_string()),
            Self::Retexture(_) => (ApiVersion::V1, "retexture".to_string()),
        }
    }

    /// JSON body POSTed to the provider.
    pub fn request_body(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Text3d(p) => serde_json::to_value(p),
            Self::Refine(p) => {
                let mut body = p.extra.clone();
                body.insert(
                    "callback_url".to_string(),
                    Value::String(p.callback_url.clone()),
                );
                Ok(Value::Object(body))
            }
            Self::Rigging(p) => serde_json::to_value(p),
            Self::Animation(p) => serde_json::to_value(p),
            Self::Retexture(p) => serde_json::to_value(p),
        }
    }

    /// Value the spec hash is computed over. Identical to the request body
    /// except for refine, which hashes the parent id alongside the callback.
    pub fn hash_input(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Refine(p) => serde_json::to_value(p),
            other => other.request_body(),
        }
    }
}

/// Payload as stored on a task graph entry. Manifests written before stage
/// payloads were typed hold free-form objects; those are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryPayload {
    Stage(StagePayload),
    Opaque(Map<String, Value>),
}

impl EntryPayload {
    pub fn stage(&self) -> Option<&StagePayload> {
        match self {
            Self::Stage(p) => Some(p),
            Self::Opaque(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Opaque(map) if map.is_empty())
    }
}

impl Default for EntryPayload {
    fn default() -> Self {
        Self::Opaque(Map::new())
    }
}

impl From<StagePayload> for EntryPayload {
    fn from(value: StagePayload) -> Self {
        Self::Stage(value)
    }
}
