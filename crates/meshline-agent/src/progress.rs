use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meshline_task::{TaskId, TaskStatus};

const STALE_DONE: Duration = Duration::from_secs(10 * 60);
const STALE_ANY: Duration = Duration::from_secs(60 * 60);

/// Latest progress reported by the provider for one task.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub done: bool,
    pub updated_at_unix_ms: u64,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory view of in-flight tasks, fed by webhook deliveries. Finished
/// entries expire after ten minutes, anything else after an hour.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    entries: Mutex<HashMap<TaskId, ProgressSnapshot>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn cleanup_locked(map: &mut HashMap<TaskId, ProgressSnapshot>, now: u64) {
        map.retain(|_, entry| {
            let age = now.saturating_sub(entry.updated_at_unix_ms);
            if entry.done {
                return age <= STALE_DONE.as_millis() as u64;
            }
            age <= STALE_ANY.as_millis() as u64
        });
    }

    /// Progress never moves backwards for a task and a finished task stays
    /// finished.
    pub fn record(&self, task_id: &TaskId, status: TaskStatus, progress: u8) {
        if task_id.is_blank() {
            return;
        }
        let now = now_unix_ms();
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::cleanup_locked(&mut map, now);

        let entry = map.entry(task_id.clone()).or_insert_with(|| ProgressSnapshot {
            task_id: task_id.clone(),
            status,
            progress: 0,
            done: false,
            updated_at_unix_ms: now,
        });
        if entry.done {
            return;
        }
        if status.rank() >= entry.status.rank() {
            entry.status = status;
        }
        entry.progress = entry.progress.max(progress.min(100));
        if status.is_terminal() {
            entry.done = true;
            if status == TaskStatus::Succeeded {
                entry.progress = 100;
            }
        }
        entry.updated_at_unix_ms = now;
    }

    pub fn get(&self, task_id: &TaskId) -> Option<ProgressSnapshot> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::cleanup_locked(&mut map, now_unix_ms());
        map.get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
