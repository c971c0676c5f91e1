use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::payload::{EntryPayload, StagePayload};
use crate::status::{ServiceKind, StatusSource, TaskId, TaskStatus};

pub const MANIFEST_VERSION: &str = "1.0";
pub const ASSET_INTENT_CREATURE: &str = "creature";

fn default_version() -> String {
    MANIFEST_VERSION.to_string()
}

fn default_intent() -> String {
    ASSET_INTENT_CREATURE.to_string()
}

/// One file per entity: `<entity>/manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityManifest {
    #[serde(rename = "species", alias = "entity")]
    pub entity: String,
    #[serde(default)]
    pub asset_specs: BTreeMap<String, AssetRecord>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(with = "crate::time")]
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EntityManifest {
    pub fn new(entity: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            entity: entity.into(),
            asset_specs: BTreeMap::new(),
            version: default_version(),
            last_updated: now,
            extra: Map::new(),
        }
    }

    pub fn find_task(&self, task_id: &TaskId) -> Option<(&AssetRecord, &TaskGraphEntry)> {
        self.asset_specs
            .values()
            .find_map(|asset| asset.entry(task_id).map(|entry| (asset, entry)))
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.asset_specs
            .values()
            .flat_map(|asset| asset.task_graph.iter().map(|e| &e.task_id))
    }

    pub fn pending(&self) -> Vec<&AssetRecord> {
        self.asset_specs.values().filter(|a| a.has_pending()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    #[serde(rename = "asset_spec_hash", alias = "spec_hash")]
    pub spec_hash: String,
    pub spec_fingerprint: String,
    #[serde(rename = "species", alias = "entity")]
    pub entity: String,
    #[serde(default = "default_intent")]
    pub asset_intent: String,
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
    #[serde(default)]
    pub task_graph: Vec<TaskGraphEntry>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub history: Vec<StatusHistoryEntry>,
    #[serde(default)]
    pub resume_tokens: Map<String, Value>,
    #[serde(with = "crate::time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::time")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssetRecord {
    pub fn new(
        spec_hash: impl Into<String>,
        spec_fingerprint: impl Into<String>,
        entity: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            spec_hash: spec_hash.into(),
            spec_fingerprint: spec_fingerprint.into(),
            entity: entity.into(),
            asset_intent: default_intent(),
            prompts: BTreeMap::new(),
            task_graph: Vec::new(),
            artifacts: Vec::new(),
            history: Vec::new(),
            resume_tokens: Map::new(),
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    pub fn entry(&self, task_id: &TaskId) -> Option<&TaskGraphEntry> {
        self.task_graph.iter().find(|e| &e.task_id == task_id)
    }

    pub fn entry_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskGraphEntry> {
        self.task_graph.iter_mut().find(|e| &e.task_id == task_id)
    }

    pub fn has_pending(&self) -> bool {
        self.task_graph.iter().any(|e| !e.status.is_terminal())
    }

    /// Latest task graph entry for a stage, if any.
    pub fn latest(&self, service: ServiceKind) -> Option<&TaskGraphEntry> {
        self.task_graph.iter().rev().find(|e| e.service == service)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraphEntry {
    pub task_id: TaskId,
    pub service: ServiceKind,
    pub status: TaskStatus,
    #[serde(with = "crate::time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::time")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: EntryPayload,
    #[serde(default)]
    pub result_paths: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Audit trail only; control flow never reads it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    #[serde(with = "crate::time")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "initial_status")]
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub source: StatusSource,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Relative to the entity directory.
    pub relative_path: String,
    pub sha256_hash: String,
    pub file_size_bytes: u64,
    #[serde(with = "crate::time")]
    pub downloaded_at: DateTime<Utc>,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Handed from a submission service to the repository; not persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_id: TaskId,
    pub spec_hash: String,
    #[serde(rename = "species", alias = "entity")]
    pub entity: String,
    pub service: ServiceKind,
    pub status: TaskStatus,
    pub callback_url: String,
    #[serde(with = "crate::time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::time")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_fingerprint: Option<String>,
}

impl TaskSubmission {
    pub fn pending(
        task_id: TaskId,
        spec_hash: impl Into<String>,
        entity: impl Into<String>,
        payload: StagePayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            spec_hash: spec_hash.into(),
            entity: entity.into(),
            service: payload.service(),
            status: TaskStatus::Pending,
            callback_url: payload.callback_url().to_string(),
            created_at: now,
            updated_at: now,
            payload: Some(payload),
            spec_fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.spec_fingerprint = Some(fingerprint.into());
        self
    }
}

// Creation entries record an empty `old_status`.
mod initial_status {
    use super::*;

    pub fn serialize<S: Serializer>(v: &Option<TaskStatus>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(v.map(TaskStatus::as_str).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<TaskStatus>, D::Error> {
        let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
        if raw.trim().is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(serde::de::Error::custom)
    }
}
