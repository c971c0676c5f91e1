use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::manifest::{ArtifactRecord, AssetRecord, StatusHistoryEntry, TaskGraphEntry, TaskSubmission};
use crate::payload::EntryPayload;
use crate::status::{ServiceKind, StatusSource, TaskId, TaskStatus};

/// A status observation for one task, from any source.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub source: StatusSource,
    /// Allows creating the entry when no submission was recorded.
    pub service: Option<ServiceKind>,
    pub payload: Option<EntryPayload>,
    pub result_paths: BTreeMap<String, String>,
    pub artifacts: Vec<ArtifactRecord>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(task_id: TaskId, status: TaskStatus, source: StatusSource) -> Self {
        Self {
            task_id,
            status,
            source,
            service: None,
            payload: None,
            result_paths: BTreeMap::new(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn with_service(mut self, service: ServiceKind) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_payload(mut self, payload: EntryPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_result_paths(mut self, paths: BTreeMap<String, String>) -> Self {
        self.result_paths = paths;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactRecord>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

/// What applying a [`StatusUpdate`] did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum UpdateDisposition {
    /// No entry existed; one was created from the update.
    Created { status: TaskStatus },
    /// Real transition, one history entry appended.
    Applied { from: TaskStatus, to: TaskStatus },
    /// Same non-terminal status again; result paths merged.
    Unchanged { status: TaskStatus },
    /// Terminal status re-delivered.
    Duplicate { status: TaskStatus },
    /// A different status arrived after a terminal one.
    RejectedTerminal { current: TaskStatus, attempted: TaskStatus },
    /// Non-terminal regression, e.g. PENDING after IN_PROGRESS.
    Stale { current: TaskStatus, attempted: TaskStatus },
    /// No entry and no service to create one with.
    Missing,
}

impl UpdateDisposition {
    /// Whether the record was modified and must be persisted.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::Created { .. } | Self::Applied { .. } | Self::Unchanged { .. }
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Applied { .. } => "applied",
            Self::Unchanged { .. } => "unchanged",
            Self::Duplicate { .. } => "duplicate",
            Self::RejectedTerminal { .. } => "rejected_terminal",
            Self::Stale { .. } => "stale",
            Self::Missing => "missing",
        }
    }
}

/// Outcome of folding a submission into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionDisposition {
    Recorded,
    Duplicate,
    Conflict { existing: TaskStatus },
}

impl AssetRecord {
    /// Appends a graph entry for a fresh submission. An existing entry with
    /// the same task id and status makes this a no-op; any other status is
    /// a conflict and leaves the record untouched.
    pub fn accept_submission(
        &mut self,
        submission: &TaskSubmission,
        now: DateTime<Utc>,
    ) -> SubmissionDisposition {
        if let Some(existing) = self.entry(&submission.task_id) {
            return if existing.status == submission.status {
                SubmissionDisposition::Duplicate
            } else {
                SubmissionDisposition::Conflict {
                    existing: existing.status,
                }
            };
        }

        let payload = match &submission.payload {
            Some(stage) => {
                if let Some(prompt) = stage.prompt() {
                    self.prompts
                        .insert(submission.service.as_str().to_string(), prompt.to_string());
                }
                EntryPayload::Stage(stage.clone())
            }
            None => {
                let mut map = serde_json::Map::new();
                map.insert(
                    "callback_url".to_string(),
                    Value::String(submission.callback_url.clone()),
                );
                EntryPayload::Opaque(map)
            }
        };

        self.task_graph.push(TaskGraphEntry {
            task_id: submission.task_id.clone(),
            service: submission.service,
            status: submission.status,
            created_at: submission.created_at,
            updated_at: submission.updated_at,
            payload,
            result_paths: BTreeMap::new(),
            error: None,
            extra: serde_json::Map::new(),
        });
        self.history.push(StatusHistoryEntry {
            timestamp: now,
            old_status: None,
            new_status: submission.status,
            source: StatusSource::Service,
            task_id: Some(submission.task_id.clone()),
        });
        self.updated_at = now;
        SubmissionDisposition::Recorded
    }

    /// Folds a status observation into the task graph. Terminal statuses are
    /// final: a repeat is a no-op and anything else is refused without
    /// touching the entry.
    pub fn apply_update(&mut self, update: StatusUpdate, now: DateTime<Utc>) -> UpdateDisposition {
        let StatusUpdate {
            task_id,
            status,
            source,
            service,
            payload,
            result_paths,
            artifacts,
            error,
        } = update;

        let disposition = match self.entry_mut(&task_id) {
            Some(entry) => {
                let current = entry.status;
                let disposition = if current.is_terminal() {
                    if current == status {
                        UpdateDisposition::Duplicate { status }
                    } else {
                        UpdateDisposition::RejectedTerminal {
                            current,
                            attempted: status,
                        }
                    }
                } else if status.rank() < current.rank() {
                    UpdateDisposition::Stale {
                        current,
                        attempted: status,
                    }
                } else if status == current {
                    UpdateDisposition::Unchanged { status }
                } else {
                    UpdateDisposition::Applied {
                        from: current,
                        to: status,
                    }
                };
                if !disposition.is_write() {
                    return disposition;
                }

                entry.status = status;
                entry.updated_at = now;
                entry.result_paths.extend(result_paths);
                if error.is_some() {
                    entry.error = error;
                }
                if let Some(payload) = payload.filter(|_| entry.payload.is_empty()) {
                    entry.payload = payload;
                }
                disposition
            }
            None => {
                let Some(service) = service else {
                    return UpdateDisposition::Missing;
                };
                self.task_graph.push(TaskGraphEntry {
                    task_id: task_id.clone(),
                    service,
                    status,
                    created_at: now,
                    updated_at: now,
                    payload: payload.unwrap_or_default(),
                    result_paths,
                    error,
                    extra: serde_json::Map::new(),
                });
                UpdateDisposition::Created { status }
            }
        };

        match disposition {
            UpdateDisposition::Created { .. } => self.history.push(StatusHistoryEntry {
                timestamp: now,
                old_status: None,
                new_status: status,
                source,
                task_id: Some(task_id.clone()),
            }),
            UpdateDisposition::Applied { from, to } => self.history.push(StatusHistoryEntry {
                timestamp: now,
                old_status: Some(from),
                new_status: to,
                source,
                task_id: Some(task_id.clone()),
            }),
            _ => {}
        }

        if status == TaskStatus::Succeeded {
            if let Some(service) = self.entry(&task_id).map(|e| e.service) {
                self.resume_tokens.insert(
                    format!("{}_task_id", service.as_str()),
                    Value::String(task_id.0.clone()),
                );
            }
        }

        for artifact in artifacts {
            self.add_artifact(artifact);
        }
        self.updated_at = now;
        disposition
    }

    // A re-downloaded file replaces the record for the same path.
    fn add_artifact(&mut self, artifact: ArtifactRecord) {
        match self
            .artifacts
            .iter_mut()
            .find(|a| a.relative_path == artifact.relative_path)
        {
            Some(existing) if existing.sha256_hash == artifact.sha256_hash => {}
            Some(existing) => *existing = artifact,
            None => self.artifacts.push(artifact),
        }
    }
}
