use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use meshline_task::{
    AssetRecord, EntityManifest, StatusUpdate, SubmissionDisposition, TaskId, TaskSubmission,
    UpdateDisposition,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

const DEFAULT_SAVE_ATTEMPTS: u32 = 5;

/// Where a task id lives.
#[derive(Debug, Clone)]
pub struct TaskLocation {
    pub entity: String,
    pub spec_hash: String,
    pub asset: AssetRecord,
}

#[derive(serde::Deserialize)]
struct DiskStamp {
    #[serde(with = "meshline_task::time")]
    last_updated: DateTime<Utc>,
}

// Written to disk but not yet renamed over the manifest.
#[derive(Debug)]
struct StagedManifest {
    tmp: PathBuf,
    path: PathBuf,
    last_updated: DateTime<Utc>,
}

pub(crate) fn validate_entity(entity: &str) -> Result<()> {
    if entity.trim().is_empty() {
        return Err(Error::Validation("entity cannot be empty".to_string()));
    }
    if entity.trim() != entity
        || entity.starts_with('.')
        || entity.contains(['/', '\\', '\0'])
    {
        return Err(Error::Validation(format!("invalid entity name {entity:?}")));
    }
    Ok(())
}

fn check_replacement(stored: &AssetRecord, incoming: &AssetRecord) -> Result<()> {
    for entry in &stored.task_graph {
        let Some(next) = incoming.entry(&entry.task_id) else {
            return Err(Error::Conflict {
                task_id: entry.task_id.clone(),
                detail: format!("replacement for asset {} drops this task", stored.spec_hash),
            });
        };
        if entry.status.is_terminal() && next.status != entry.status {
            return Err(Error::Conflict {
                task_id: entry.task_id.clone(),
                detail: format!("stored as {}, replacement claims {}", entry.status, next.status),
            });
        }
    }
    Ok(())
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

// last_updated only moves forward, even if the clock does not.
fn next_stamp(prev: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > prev {
        now
    } else {
        prev + TimeDelta::microseconds(1)
    }
}

fn locate(manifest: &EntityManifest, task_id: &TaskId) -> Option<TaskLocation> {
    manifest
        .asset_specs
        .iter()
        .find(|(_, asset)| asset.entry(task_id).is_some())
        .map(|(spec_hash, asset)| TaskLocation {
            entity: manifest.entity.clone(),
            spec_hash: spec_hash.clone(),
            asset: asset.clone(),
        })
}

/// File-backed store with one `<entity>/manifest.json` per entity.
///
/// Writers in this process are serialized per entity. Writers in other
/// processes are detected through `last_updated`: a save whose on-disk stamp
/// no longer matches the loaded one fails with [`Error::StaleManifest`] and
/// mutating operations reload and reapply. A writer that lands between that
/// check and the rename can still be overwritten.
#[derive(Debug)]
pub struct TaskRepository {
    base_path: PathBuf,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    index: std::sync::Mutex<HashMap<TaskId, String>>,
    save_attempts: u32,
}

impl TaskRepository {
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(Error::io(&base_path))?;
        let repo = Self {
            base_path,
            locks: std::sync::Mutex::new(HashMap::new()),
            index: std::sync::Mutex::new(HashMap::new()),
            save_attempts: DEFAULT_SAVE_ATTEMPTS,
        };
        repo.rebuild_index().await?;
        Ok(repo)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn entity_dir(&self, entity: &str) -> PathBuf {
        self.base_path.join(entity)
    }

    fn manifest_path(&self, entity: &str) -> PathBuf {
        self.entity_dir(entity).join(MANIFEST_FILE)
    }

    fn lock_for(&self, entity: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(entity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn index_manifest(&self, manifest: &EntityManifest) {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        for task_id in manifest.task_ids() {
            index.insert(task_id.clone(), manifest.entity.clone());
        }
    }

    fn indexed_entity(&self, task_id: &TaskId) -> Option<String> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.get(task_id).cloned()
    }

    async fn rebuild_index(&self) -> Result<()> {
        for entity in self.entities().await? {
            match self.read_existing(&entity).await {
                Ok(Some(manifest)) => self.index_manifest(&manifest),
                Ok(None) => {}
                Err(e) => tracing::warn!(%entity, error = %e, "skipping unreadable manifest while indexing"),
            }
        }
        Ok(())
    }

    /// Entities that have a manifest on disk, sorted by name.
    pub async fn entities(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(Error::io(&self.base_path))?;
        while let Some(entry) = rd.next_entry().await.map_err(Error::io(&self.base_path))? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_entity(&name).is_err() {
                continue;
            }
            if tokio::fs::metadata(entry.path().join(MANIFEST_FILE))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read_existing(&self, entity: &str) -> Result<Option<EntityManifest>> {
        let path = self.manifest_path(entity);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(&path)(e)),
        };
        let manifest: EntityManifest =
            serde_json::from_slice(&raw).map_err(|source| Error::Parse {
                path: path.clone(),
                source,
            })?;
        if manifest.entity != entity {
            return Err(Error::Inconsistent(format!(
                "{} belongs to entity {:?}",
                path.display(),
                manifest.entity
            )));
        }
        Ok(Some(manifest))
    }

    async fn disk_stamp(&self, path: &Path) -> Result<Option<DateTime<Utc>>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path)(e)),
        };
        let stamp: DiskStamp = serde_json::from_slice(&raw).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(stamp.last_updated))
    }

    /// Reads the manifest for `entity`. A missing manifest is created empty
    /// and persisted; an unreadable one is an error and is left untouched.
    pub async fn load(&self, entity: &str) -> Result<EntityManifest> {
        validate_entity(entity)?;
        let lock = self.lock_for(entity);
        let _guard = lock.lock().await;
        self.load_unlocked(entity).await
    }

    async fn load_unlocked(&self, entity: &str) -> Result<EntityManifest> {
        if let Some(manifest) = self.read_existing(entity).await? {
            self.index_manifest(&manifest);
            return Ok(manifest);
        }

        let mut manifest = EntityManifest::new(entity, Utc::now());
        match self.save_unlocked(&mut manifest).await {
            Ok(()) => {
                tracing::info!(%entity, "created empty manifest");
                Ok(manifest)
            }
            // Another process created it first.
            Err(Error::StaleManifest { .. }) => self
                .read_existing(entity)
                .await?
                .ok_or_else(|| Error::Inconsistent(format!("manifest for {entity} vanished"))),
            Err(e) => Err(e),
        }
    }

    /// Persists `manifest` atomically and advances its `last_updated`.
    pub async fn save(&self, manifest: &mut EntityManifest) -> Result<()> {
        validate_entity(&manifest.entity)?;
        let lock = self.lock_for(&manifest.entity);
        let _guard = lock.lock().await;
        self.save_unlocked(manifest).await
    }

    async fn save_unlocked(&self, manifest: &mut EntityManifest) -> Result<()> {
        let staged = self.stage_write(manifest).await?;
        self.commit_write(staged, manifest).await
    }

    async fn stage_write(&self, manifest: &EntityManifest) -> Result<StagedManifest> {
        let dir = self.entity_dir(&manifest.entity);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(Error::io(&dir))?;
        let path = dir.join(MANIFEST_FILE);

        if let Some(on_disk) = self.disk_stamp(&path).await? {
            if on_disk != manifest.last_updated {
                return Err(Error::StaleManifest {
                    entity: manifest.entity.clone(),
                });
            }
        }

        let last_updated = next_stamp(manifest.last_updated, Utc::now());
        let mut snapshot = manifest.clone();
        snapshot.last_updated = last_updated;
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = dir.join(format!(".{MANIFEST_FILE}.{}.tmp", uuid::Uuid::new_v4()));
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .map_err(Error::io(&tmp))?;
        f.write_all(&data).await.map_err(Error::io(&tmp))?;
        f.flush().await.map_err(Error::io(&tmp))?;
        f.sync_all().await.map_err(Error::io(&tmp))?;

        Ok(StagedManifest {
            tmp,
            path,
            last_updated,
        })
    }

    async fn commit_write(
        &self,
        staged: StagedManifest,
        manifest: &mut EntityManifest,
    ) -> Result<()> {
        if let Err(e) = tokio::fs::rename(&staged.tmp, &staged.path).await {
            let _ = tokio::fs::remove_file(&staged.tmp).await;
            return Err(Error::io(&staged.path)(e));
        }
        manifest.last_updated = staged.last_updated;
        self.index_manifest(manifest);
        Ok(())
    }

    // Load, apply, save under the entity lock; reapplied when another
    // process wrote in between.
    async fn mutate<T>(
        &self,
        entity: &str,
        mut apply: impl FnMut(&mut EntityManifest) -> Result<(T, bool)>,
    ) -> Result<T> {
        validate_entity(entity)?;
        let lock = self.lock_for(entity);
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut manifest = self.load_unlocked(entity).await?;
            let (out, write) = apply(&mut manifest)?;
            if !write {
                return Ok(out);
            }
            match self.save_unlocked(&mut manifest).await {
                Ok(()) => return Ok(out),
                Err(Error::StaleManifest { .. }) if attempt < self.save_attempts => {
                    tracing::warn!(%entity, attempt, "manifest changed on disk, reapplying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_asset(&self, entity: &str, spec_hash: &str) -> Result<Option<AssetRecord>> {
        let manifest = self.load(entity).await?;
        Ok(manifest.asset_specs.get(spec_hash).cloned())
    }

    /// Inserts or replaces the record under its spec hash.
    ///
    /// A replacement may add tasks and advance live ones, but it cannot drop
    /// a stored task or move a task out of a terminal status; either is a
    /// conflict. History is append-only, so a shorter incoming history keeps
    /// the stored one.
    pub async fn upsert_asset(&self, entity: &str, record: AssetRecord) -> Result<()> {
        require(&record.spec_hash, "spec_hash")?;
        if !record.entity.is_empty() && record.entity != entity {
            return Err(Error::Validation(format!(
                "asset {} belongs to {:?}, not {entity:?}",
                record.spec_hash, record.entity
            )));
        }
        self.mutate(entity, |manifest| {
            let mut record = record.clone();
            if let Some(stored) = manifest.asset_specs.get(&record.spec_hash) {
                check_replacement(stored, &record)?;
                if record.history.len() < stored.history.len() {
                    record.history = stored.history.clone();
                }
            }
            record.entity = entity.to_string();
            record.updated_at = Utc::now();
            manifest.asset_specs.insert(record.spec_hash.clone(), record);
            Ok(((), true))
        })
        .await
    }

    /// Records a fresh submission. Replaying the same submission is a no-op;
    /// the same task id with a different status is a conflict.
    pub async fn record_submission(
        &self,
        submission: &TaskSubmission,
    ) -> Result<SubmissionDisposition> {
        require(submission.task_id.as_str(), "task_id")?;
        require(&submission.callback_url, "callback_url")?;
        require(&submission.entity, "entity")?;
        require(&submission.spec_hash, "spec_hash")?;
        validate_entity(&submission.entity)?;

        if let Some(owner) = self.indexed_entity(&submission.task_id) {
            if owner != submission.entity {
                return Err(Error::Conflict {
                    task_id: submission.task_id.clone(),
                    detail: format!("already recorded for entity {owner}"),
                });
            }
        }

        let disposition = self
            .mutate(&submission.entity, |manifest| {
                let now = Utc::now();
                if let Some(loc) = locate(manifest, &submission.task_id) {
                    if loc.spec_hash != submission.spec_hash {
                        return Err(Error::Conflict {
                            task_id: submission.task_id.clone(),
                            detail: format!("already recorded under spec hash {}", loc.spec_hash),
                        });
                    }
                }

                let fingerprint = submission
                    .spec_fingerprint
                    .clone()
                    .unwrap_or_else(|| submission.spec_hash.clone());
                let asset = manifest
                    .asset_specs
                    .entry(submission.spec_hash.clone())
                    .or_insert_with(|| {
                        AssetRecord::new(&submission.spec_hash, fingerprint, &submission.entity, now)
                    });
                match asset.accept_submission(submission, now) {
                    SubmissionDisposition::Recorded => Ok((SubmissionDisposition::Recorded, true)),
                    SubmissionDisposition::Duplicate => {
                        Ok((SubmissionDisposition::Duplicate, false))
                    }
                    SubmissionDisposition::Conflict { existing } => Err(Error::Conflict {
                        task_id: submission.task_id.clone(),
                        detail: format!(
                            "recorded as {existing}, submission claims {}",
                            submission.status
                        ),
                    }),
                }
            })
            .await?;

        match disposition {
            SubmissionDisposition::Recorded => tracing::info!(
                entity = %submission.entity,
                spec_hash = %submission.spec_hash,
                task_id = %submission.task_id,
                service = %submission.service,
                status = %submission.status,
                "submission recorded"
            ),
            _ => tracing::debug!(
                entity = %submission.entity,
                task_id = %submission.task_id,
                "duplicate submission ignored"
            ),
        }
        Ok(disposition)
    }

    /// Folds a status observation into the owning task graph entry.
    ///
    /// When neither the asset nor the entry exists and `update.service` is
    /// set, both are created; this covers callbacks whose submission record
    /// was never persisted.
    pub async fn record_status_update(
        &self,
        entity: &str,
        spec_hash: &str,
        update: StatusUpdate,
    ) -> Result<UpdateDisposition> {
        require(spec_hash, "spec_hash")?;
        require(update.task_id.as_str(), "task_id")?;
        let task_id = update.task_id.clone();
        let source = update.source;

        let disposition = self
            .mutate(entity, |manifest| {
                let now = Utc::now();
                if let Some(loc) = locate(manifest, &task_id) {
                    if loc.spec_hash != spec_hash {
                        return Err(Error::Conflict {
                            task_id: task_id.clone(),
                            detail: format!("recorded under spec hash {}", loc.spec_hash),
                        });
                    }
                }

                if !manifest.asset_specs.contains_key(spec_hash) {
                    if update.service.is_none() {
                        return Err(Error::NotFound(format!(
                            "asset {spec_hash} for entity {entity}"
                        )));
                    }
                    tracing::warn!(%entity, %spec_hash, %task_id, "no asset recorded for update, creating one");
                    manifest.asset_specs.insert(
                        spec_hash.to_string(),
                        AssetRecord::new(spec_hash, spec_hash, entity, now),
                    );
                }
                let asset = manifest
                    .asset_specs
                    .get_mut(spec_hash)
                    .ok_or_else(|| Error::Inconsistent(format!("asset {spec_hash} vanished")))?;

                let disposition = asset.apply_update(update.clone(), now);
                if disposition == UpdateDisposition::Missing {
                    return Err(Error::NotFound(format!("task {task_id}")));
                }
                Ok((disposition, disposition.is_write()))
            })
            .await?;

        match disposition {
            UpdateDisposition::Applied { from, to } => tracing::info!(
                %entity, %spec_hash, %task_id, %from, %to, ?source, "status applied"
            ),
            UpdateDisposition::Created { status } => tracing::info!(
                %entity, %spec_hash, %task_id, %status, ?source, "task entry created from update"
            ),
            UpdateDisposition::RejectedTerminal { current, attempted } => tracing::warn!(
                %entity, %spec_hash, %task_id, %current, %attempted, "late status after terminal state ignored"
            ),
            UpdateDisposition::Stale { current, attempted } => tracing::warn!(
                %entity, %spec_hash, %task_id, %current, %attempted, "status regression ignored"
            ),
            UpdateDisposition::Duplicate { .. } | UpdateDisposition::Unchanged { .. } => {
                tracing::debug!(%entity, %task_id, disposition = disposition.as_str(), "status unchanged")
            }
            UpdateDisposition::Missing => {}
        }
        Ok(disposition)
    }

    /// Resolves a task id to its entity and asset. Without `entity`, every
    /// manifest is a candidate; the in-memory index is consulted first.
    pub async fn find_by_task_id(
        &self,
        task_id: &TaskId,
        entity: Option<&str>,
    ) -> Result<Option<TaskLocation>> {
        if let Some(entity) = entity {
            if validate_entity(entity).is_err() {
                return Ok(None);
            }
            return Ok(self
                .read_existing(entity)
                .await?
                .and_then(|m| locate(&m, task_id)));
        }

        if let Some(owner) = self.indexed_entity(task_id) {
            if let Some(manifest) = self.read_existing(&owner).await? {
                if let Some(loc) = locate(&manifest, task_id) {
                    return Ok(Some(loc));
                }
            }
        }

        for entity in self.entities().await? {
            let Some(manifest) = self.read_existing(&entity).await? else {
                continue;
            };
            self.index_manifest(&manifest);
            if let Some(loc) = locate(&manifest, task_id) {
                return Ok(Some(loc));
            }
        }
        Ok(None)
    }

    /// Assets with at least one non-terminal task.
    pub async fn list_pending(&self, entity: &str) -> Result<Vec<AssetRecord>> {
        let manifest = self.load(entity).await?;
        Ok(manifest.pending().into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshline_task::{
        RiggingPayload, ServiceKind, StagePayload, StatusSource, TaskStatus,
    };
    use serde_json::Value;

    fn submission(entity: &str, task: &str, model: &str) -> TaskSubmission {
        let payload = StagePayload::Rigging(RiggingPayload {
            model_id: model.to_string(),
            callback_url: format!("http://localhost:8000/webhooks/meshy/{entity}/rigging"),
            extra: serde_json::Map::new(),
        });
        let (hash, canonical) =
            meshline_core::spec_hash_with_len(&payload.hash_input().unwrap(), 12).unwrap();
        TaskSubmission::pending(TaskId::from(task), hash, entity, payload, Utc::now())
            .with_fingerprint(canonical)
    }

    async fn repo() -> (tempfile::TempDir, TaskRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = TaskRepository::open(dir.path()).await.unwrap();
        (dir, repo)
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn load_creates_and_persists_empty_manifest() {
        let (dir, repo) = repo().await;
        let m = repo.load("otter").await.unwrap();
        assert_eq!(m.entity, "otter");
        assert!(m.asset_specs.is_empty());
        let on_disk = read_json(&dir.path().join("otter").join(MANIFEST_FILE));
        assert_eq!(on_disk["species"], "otter");
        assert_eq!(on_disk["version"], "1.0");

        let again = repo.load("otter").await.unwrap();
        assert_eq!(again.last_updated, m.last_updated);
    }

    #[tokio::test]
    async fn corrupt_manifest_is_never_reset() {
        let (dir, repo) = repo().await;
        let path = dir.path().join("otter").join(MANIFEST_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{\"species\": \"otter\", \"asset_specs\": ").unwrap();

        assert!(matches!(repo.load("otter").await, Err(Error::Parse { .. })));
        let err = repo
            .record_submission(&submission("otter", "t-1", "m-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"{\"species\": \"otter\", \"asset_specs\": "
        );
    }

    #[tokio::test]
    async fn submission_is_idempotent() {
        let (_dir, repo) = repo().await;
        let sub = submission("otter", "t-1", "m-1");
        assert_eq!(
            repo.record_submission(&sub).await.unwrap(),
            SubmissionDisposition::Recorded
        );
        let stamp = repo.load("otter").await.unwrap().last_updated;
        assert_eq!(
            repo.record_submission(&sub).await.unwrap(),
            SubmissionDisposition::Duplicate
        );

        let m = repo.load("otter").await.unwrap();
        assert_eq!(m.last_updated, stamp);
        let asset = &m.asset_specs[&sub.spec_hash];
        assert_eq!(asset.task_graph.len(), 1);
        assert_eq!(asset.history.len(), 1);
        assert_eq!(asset.spec_fingerprint, sub.spec_fingerprint.clone().unwrap());
        assert_eq!(asset.task_graph[0].status, TaskStatus::Pending);
        assert_eq!(
            asset.task_graph[0].payload.stage().map(|p| p.service()),
            Some(ServiceKind::Rigging)
        );
    }

    #[tokio::test]
    async fn conflicting_submission_is_rejected() {
        let (_dir, repo) = repo().await;
        let sub = submission("otter", "t-1", "m-1");
        repo.record_submission(&sub).await.unwrap();

        let mut other = sub.clone();
        other.status = TaskStatus::InProgress;
        let err = repo.record_submission(&other).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let elsewhere = submission("beaver", "t-1", "m-1");
        let err = repo.record_submission(&elsewhere).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let m = repo.load("otter").await.unwrap();
        assert_eq!(m.asset_specs[&sub.spec_hash].task_graph.len(), 1);
    }

    #[tokio::test]
    async fn submission_fields_are_validated() {
        let (dir, repo) = repo().await;
        let base = submission("otter", "t-1", "m-1");

        let mut s = base.clone();
        s.task_id = TaskId::from("");
        assert!(matches!(repo.record_submission(&s).await, Err(Error::Validation(_))));
        let mut s = base.clone();
        s.callback_url = " ".to_string();
        assert!(matches!(repo.record_submission(&s).await, Err(Error::Validation(_))));
        let mut s = base.clone();
        s.spec_hash.clear();
        assert!(matches!(repo.record_submission(&s).await, Err(Error::Validation(_))));
        let mut s = base.clone();
        s.entity.clear();
        assert!(matches!(repo.record_submission(&s).await, Err(Error::Validation(_))));
        let mut s = base;
        s.entity = "../escape".to_string();
        assert!(matches!(repo.record_submission(&s).await, Err(Error::Validation(_))));

        assert!(repo.entities().await.unwrap().is_empty());
        assert!(!dir.path().join("otter").exists());
    }

    #[tokio::test]
    async fn terminal_status_survives_late_delivery() {
        let (dir, repo) = repo().await;
        let sub = submission("otter", "t-1", "m-1");
        repo.record_submission(&sub).await.unwrap();

        let failed = StatusUpdate::new(sub.task_id.clone(), TaskStatus::Failed, StatusSource::Webhook)
            .with_error(Some("mesh exploded".to_string()));
        let d = repo
            .record_status_update("otter", &sub.spec_hash, failed)
            .await
            .unwrap();
        assert!(matches!(d, UpdateDisposition::Applied { .. }));

        let before = std::fs::read(dir.path().join("otter").join(MANIFEST_FILE)).unwrap();
        let late = StatusUpdate::new(sub.task_id.clone(), TaskStatus::Succeeded, StatusSource::Webhook);
        let d = repo
            .record_status_update("otter", &sub.spec_hash, late)
            .await
            .unwrap();
        assert!(matches!(d, UpdateDisposition::RejectedTerminal { .. }));
        let after = std::fs::read(dir.path().join("otter").join(MANIFEST_FILE)).unwrap();
        assert_eq!(before, after);

        let asset = repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        assert_eq!(asset.task_graph[0].status, TaskStatus::Failed);
        assert_eq!(asset.task_graph[0].error.as_deref(), Some("mesh exploded"));
        assert_eq!(asset.history.len(), 2);
    }

    #[tokio::test]
    async fn upsert_cannot_rewind_or_drop_tasks() {
        let (dir, repo) = repo().await;
        let sub = submission("otter", "t-1", "m-1");
        repo.record_submission(&sub).await.unwrap();
        let stale = repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();

        repo.record_status_update(
            "otter",
            &sub.spec_hash,
            StatusUpdate::new(sub.task_id.clone(), TaskStatus::Succeeded, StatusSource::Webhook),
        )
        .await
        .unwrap();
        let path = dir.path().join("otter").join(MANIFEST_FILE);
        let before = std::fs::read(&path).unwrap();

        let err = repo.upsert_asset("otter", stale.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let mut emptied = repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        emptied.task_graph.clear();
        let err = repo.upsert_asset("otter", emptied).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), before);

        let asset = repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        assert_eq!(asset.task_graph.len(), 1);
        assert_eq!(asset.task_graph[0].status, TaskStatus::Succeeded);

        // Metadata edits still go through and keep the stored history.
        let mut edited = asset.clone();
        edited.asset_intent = "hero".to_string();
        edited.history.clear();
        repo.upsert_asset("otter", edited).await.unwrap();
        let asset = repo.get_asset("otter", &sub.spec_hash).await.unwrap().unwrap();
        assert_eq!(asset.asset_intent, "hero");
        assert_eq!(asset.history.len(), 2);
        assert_eq!(asset.task_graph[0].status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn canceled_entries_load_as_terminal() {
        let (dir, repo) = repo().await;
        let path = dir.path().join("otter").join(MANIFEST_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(&serde_json::json!({
                "species": "otter",
                "version": "1.0",
                "last_updated": "2024-05-01T10:20:30.300000",
                "asset_specs": {
                    "abc": {
                        "asset_spec_hash": "abc",
                        "spec_fingerprint": "abc",
                        "species": "otter",
                        "task_graph": [{
                            "task_id": "t-cancel",
                            "service": "text3d",
                            "status": "CANCELED",
                            "created_at": "2024-05-01T10:20:30",
                            "updated_at": "2024-05-01T10:21:00"
                        }],
                        "created_at": "2024-05-01T10:20:30",
                        "updated_at": "2024-05-01T10:21:00"
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let m = repo.load("otter").await.unwrap();
        assert_eq!(m.asset_specs["abc"].task_graph[0].status, TaskStatus::Canceled);
        assert!(repo.list_pending("otter").await.unwrap().is_empty());

        let late = StatusUpdate::new(TaskId::from("t-cancel"), TaskStatus::Succeeded, StatusSource::Webhook);
        let d = repo.record_status_update("otter", "abc", late).await.unwrap();
        assert!(matches!(d, UpdateDisposition::RejectedTerminal { .. }));
    }

    #[tokio::test]
    async fn update_without_submission_needs_service() {
        let (_dir, repo) = repo().await;
        let update = StatusUpdate::new(TaskId::from("w-1"), TaskStatus::InProgress, StatusSource::Webhook);
        let err = repo
            .record_status_update("otter", "feedfacecafe", update.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let d = repo
            .record_status_update(
                "otter",
                "feedfacecafe",
                update.with_service(ServiceKind::Animation),
            )
            .await
            .unwrap();
        assert_eq!(d, UpdateDisposition::Created {
            status: TaskStatus::InProgress
        });
        let loc = repo
            .find_by_task_id(&TaskId::from("w-1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loc.spec_hash, "feedfacecafe");
        assert_eq!(loc.asset.task_graph[0].service, ServiceKind::Animation);
    }

    #[tokio::test]
    async fn find_by_task_id_scans_all_entities() {
        let (dir, repo) = repo().await;
        let otter = submission("otter", "t-otter", "m-1");
        let beaver = submission("beaver", "t-beaver", "m-2");
        repo.record_submission(&otter).await.unwrap();
        repo.record_submission(&beaver).await.unwrap();

        // Fresh instance: empty index until the scan.
        let cold = TaskRepository::open(dir.path()).await.unwrap();
        let loc = cold
            .find_by_task_id(&TaskId::from("t-beaver"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loc.entity, "beaver");
        assert_eq!(loc.spec_hash, beaver.spec_hash);

        assert!(cold
            .find_by_task_id(&TaskId::from("t-beaver"), Some("otter"))
            .await
            .unwrap()
            .is_none());
        assert!(cold
            .find_by_task_id(&TaskId::from("t-beaver"), Some(".."))
            .await
            .unwrap()
            .is_none());
        assert!(cold
            .find_by_task_id(&TaskId::from("unknown"), None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(cold.entities().await.unwrap(), vec!["beaver", "otter"]);
    }

    #[tokio::test]
    async fn list_pending_skips_finished_assets() {
        let (_dir, repo) = repo().await;
        let a = submission("otter", "t-a", "m-a");
        let b = submission("otter", "t-b", "m-b");
        repo.record_submission(&a).await.unwrap();
        repo.record_submission(&b).await.unwrap();
        repo.record_status_update(
            "otter",
            &a.spec_hash,
            StatusUpdate::new(a.task_id.clone(), TaskStatus::Succeeded, StatusSource::Webhook),
        )
        .await
        .unwrap();

        let pending = repo.list_pending("otter").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].spec_hash, b.spec_hash);
    }

    #[tokio::test]
    async fn crash_before_rename_keeps_previous_manifest() {
        let (dir, repo) = repo().await;
        let sub = submission("otter", "t-1", "m-1");
        repo.record_submission(&sub).await.unwrap();
        let path = dir.path().join("otter").join(MANIFEST_FILE);
        let before = std::fs::read(&path).unwrap();

        let mut m = repo.load("otter").await.unwrap();
        m.asset_specs.clear();
        let staged = repo.stage_write(&m).await.unwrap();
        assert!(staged.tmp.exists());
        // Process dies here: the temp file is written but never renamed.
        drop(staged);

        assert_eq!(std::fs::read(&path).unwrap(), before);
        let reloaded = repo.load("otter").await.unwrap();
        assert_eq!(reloaded.asset_specs.len(), 1);
        assert_eq!(repo.entities().await.unwrap(), vec!["otter"]);
        assert!(repo
            .find_by_task_id(&TaskId::from("t-1"), None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failed_rename_cleans_up_and_keeps_previous_manifest() {
        let (dir, repo) = repo().await;
        let sub = submission("otter", "t-1", "m-1");
        repo.record_submission(&sub).await.unwrap();
        let entity_dir = dir.path().join("otter");
        let path = entity_dir.join(MANIFEST_FILE);
        let before = std::fs::read(&path).unwrap();

        let mut m = repo.load("otter").await.unwrap();
        let loaded_stamp = m.last_updated;
        m.asset_specs.clear();
        let mut staged = repo.stage_write(&m).await.unwrap();
        let tmp = staged.tmp.clone();
        // A non-empty directory cannot be replaced by a file.
        let blocked = entity_dir.join("blocked");
        std::fs::create_dir_all(blocked.join("inner")).unwrap();
        staged.path = blocked.clone();

        assert!(matches!(
            repo.commit_write(staged, &mut m).await,
            Err(Error::Io { .. })
        ));
        assert!(!tmp.exists());
        assert_eq!(m.last_updated, loaded_stamp);
        assert!(blocked.join("inner").is_dir());
        let leftovers: Vec<_> = std::fs::read_dir(&entity_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        assert_eq!(std::fs::read(&path).unwrap(), before);
        let reloaded = repo.load("otter").await.unwrap();
        assert_eq!(reloaded.asset_specs.len(), 1);
    }

    #[tokio::test]
    async fn save_round_trip_preserves_every_field() {
        let (dir, repo) = repo().await;
        repo.record_submission(&submission("otter", "t-1", "m-1"))
            .await
            .unwrap();
        let path = dir.path().join("otter").join(MANIFEST_FILE);

        let mut before = read_json(&path);
        let mut m = repo.load("otter").await.unwrap();
        let loaded_stamp = m.last_updated;
        repo.save(&mut m).await.unwrap();
        assert!(m.last_updated > loaded_stamp);

        let mut after = read_json(&path);
        before.as_object_mut().unwrap().remove("last_updated");
        after.as_object_mut().unwrap().remove("last_updated");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn unknown_fields_survive_rewrite() {
        let (dir, repo) = repo().await;
        let path = dir.path().join("otter").join(MANIFEST_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(&serde_json::json!({
                "species": "otter",
                "version": "1.0",
                "last_updated": "2024-05-01T10:20:30.300000",
                "curator": "field-team",
                "asset_specs": {
                    "abc": {
                        "asset_spec_hash": "abc",
                        "spec_fingerprint": "abc",
                        "species": "otter",
                        "asset_intent": "creature",
                        "lod_hint": 2,
                        "task_graph": [],
                        "created_at": "2024-05-01T10:20:30",
                        "updated_at": "2024-05-01T10:20:30"
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let sub = submission("otter", "t-9", "m-9");
        repo.record_submission(&sub).await.unwrap();
        let v = read_json(&path);
        assert_eq!(v["curator"], "field-team");
        assert_eq!(v["asset_specs"]["abc"]["lod_hint"], 2);
        assert!(v["asset_specs"][&sub.spec_hash].is_object());
    }

    #[tokio::test]
    async fn stale_writer_is_detected_and_reapplied() {
        let (dir, a) = repo().await;
        let b = TaskRepository::open(dir.path()).await.unwrap();

        let mut held = a.load("otter").await.unwrap();
        b.record_submission(&submission("otter", "t-b", "m-b"))
            .await
            .unwrap();

        held.asset_specs.clear();
        assert!(matches!(
            a.save(&mut held).await,
            Err(Error::StaleManifest { .. })
        ));

        a.record_submission(&submission("otter", "t-a", "m-a"))
            .await
            .unwrap();
        let m = b.load("otter").await.unwrap();
        let ids: Vec<_> = m.task_ids().map(|t| t.0.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"t-a".to_string()));
        assert!(ids.contains(&"t-b".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_to_one_entity_are_not_lost() {
        let (_dir, repo) = repo().await;
        let repo = Arc::new(repo);
        let mut handles = Vec::new();
        for i in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.record_submission(&submission("otter", &format!("t-{i}"), &format!("m-{i}")))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let m = repo.load("otter").await.unwrap();
        assert_eq!(m.task_ids().count(), 16);
        assert_eq!(m.asset_specs.len(), 16);
    }

    #[test]
    fn stamps_move_forward() {
        let t = Utc::now();
        assert!(next_stamp(t, t) > t);
        assert!(next_stamp(t, t - TimeDelta::seconds(5)) > t);
        let later = t + TimeDelta::seconds(1);
        assert_eq!(next_stamp(t, later), later);
    }

    #[test]
    fn entity_names_are_single_path_segments() {
        assert!(validate_entity("otter").is_ok());
        assert!(validate_entity("river-otter_2").is_ok());
        for bad in ["", " ", "..", ".hidden", "a/b", "a\\b", " otter"] {
            assert!(validate_entity(bad).is_err(), "{bad:?}");
        }
    }
}
