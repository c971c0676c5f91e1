use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::{TaskId, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookModelUrls {
    pub glb: Option<String>,
    pub fbx: Option<String>,
    pub usdz: Option<String>,
    pub obj: Option<String>,
    pub mtl: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookTextureUrls {
    pub base_color: Option<String>,
    pub metallic: Option<String>,
    pub roughness: Option<String>,
    pub normal: Option<String>,
    pub ao: Option<String>,
}

impl WebhookTextureUrls {
    fn maps(&self) -> [(&'static str, Option<&String>); 5] {
        [
            ("base_color", self.base_color.as_ref()),
            ("metallic", self.metallic.as_ref()),
            ("roughness", self.roughness.as_ref()),
            ("normal", self.normal.as_ref()),
            ("ao", self.ao.as_ref()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookBasicAnimations {
    pub walking_glb_url: Option<String>,
    pub walking_fbx_url: Option<String>,
    pub walking_armature_glb_url: Option<String>,
    pub running_glb_url: Option<String>,
    pub running_fbx_url: Option<String>,
    pub running_armature_glb_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookRiggingResult {
    pub rigged_character_fbx_url: Option<String>,
    pub rigged_character_glb_url: Option<String>,
    pub basic_animations: Option<WebhookBasicAnimations>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookTaskError {
    pub message: Option<String>,
    pub code: Option<String>,
}

/// Body of a provider completion callback. Each stage fills a different
/// subset of the optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub model_urls: Option<WebhookModelUrls>,
    #[serde(default)]
    pub texture_urls: Option<Vec<WebhookTextureUrls>>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub result: Option<WebhookRiggingResult>,
    #[serde(default)]
    pub animation_glb_url: Option<String>,
    #[serde(default)]
    pub animation_fbx_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub task_error: Option<WebhookTaskError>,
    #[serde(default)]
    pub preceding_tasks: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn non_empty(v: Option<&String>) -> Option<&str> {
    v.map(String::as_str).filter(|s| !s.trim().is_empty())
}

impl WebhookPayload {
    pub fn progress_percent(&self) -> u8 {
        self.progress.min(100) as u8
    }

    pub fn error_message(&self) -> Option<&str> {
        self.task_error
            .as_ref()
            .and_then(|e| non_empty(e.message.as_ref()))
    }

    /// Primary model file: generated mesh, then rigged character, then animation.
    pub fn primary_model_url(&self) -> Option<&str> {
        self.model_urls
            .as_ref()
            .and_then(|m| non_empty(m.glb.as_ref()))
            .or_else(|| {
                self.result
                    .as_ref()
                    .and_then(|r| non_empty(r.rigged_character_glb_url.as_ref()))
            })
            .or_else(|| non_empty(self.animation_glb_url.as_ref()))
    }

    // In the flattened map the most derived stage wins: animation over
    // rigged character over the plain mesh.
    fn derived_model_urls(&self) -> (Option<&str>, Option<&str>) {
        let rigged = self.result.as_ref();
        let glb = non_empty(self.animation_glb_url.as_ref())
            .or_else(|| rigged.and_then(|r| non_empty(r.rigged_character_glb_url.as_ref())))
            .or_else(|| self.model_urls.as_ref().and_then(|m| non_empty(m.glb.as_ref())));
        let fbx = non_empty(self.animation_fbx_url.as_ref())
            .or_else(|| rigged.and_then(|r| non_empty(r.rigged_character_fbx_url.as_ref())))
            .or_else(|| self.model_urls.as_ref().and_then(|m| non_empty(m.fbx.as_ref())));
        (glb, fbx)
    }

    /// Every URL the callback carries, flattened into one map keyed by
    /// artifact type regardless of which stage produced it.
    pub fn all_urls(&self) -> BTreeMap<String, String> {
        let mut urls = BTreeMap::new();
        let mut put = |key: String, value: Option<&str>| {
            if let Some(v) = value {
                urls.insert(key, v.to_string());
            }
        };

        let (glb, fbx) = self.derived_model_urls();
        put("glb".to_string(), glb);
        put("fbx".to_string(), fbx);
        if let Some(m) = &self.model_urls {
            put("usdz".to_string(), non_empty(m.usdz.as_ref()));
            put("obj".to_string(), non_empty(m.obj.as_ref()));
            put("mtl".to_string(), non_empty(m.mtl.as_ref()));
        }

        if let Some(anims) = self.result.as_ref().and_then(|r| r.basic_animations.as_ref()) {
            put("walking_glb".to_string(), non_empty(anims.walking_glb_url.as_ref()));
            put("walking_fbx".to_string(), non_empty(anims.walking_fbx_url.as_ref()));
            put(
                "walking_armature_glb".to_string(),
                non_empty(anims.walking_armature_glb_url.as_ref()),
            );
            put("running_glb".to_string(), non_empty(anims.running_glb_url.as_ref()));
            put("running_fbx".to_string(), non_empty(anims.running_fbx_url.as_ref()));
            put(
                "running_armature_glb".to_string(),
                non_empty(anims.running_armature_glb_url.as_ref()),
            );
        }

        for (i, set) in self.texture_urls.iter().flatten().enumerate() {
            for (map, url) in set.maps() {
                let key = if i == 0 {
                    format!("texture_{map}")
                } else {
                    format!("texture_{i}_{map}")
                };
                put(key, non_empty(url));
            }
        }

        put("video".to_string(), non_empty(self.video_url.as_ref()));
        put("thumbnail".to_string(), non_empty(self.thumbnail_url.as_ref()));
        urls
    }
}
