use std::path::PathBuf;

use meshline_core::HashError;
use meshline_task::TaskId;

use crate::client::ClientError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("conflicting record for task {task_id}: {detail}")]
    Conflict { task_id: TaskId, detail: String },

    /// Another writer replaced the manifest after it was loaded. Reload and retry.
    #[error("manifest for {entity} changed on disk since it was loaded")]
    StaleManifest { entity: String },

    /// A manifest exists but cannot be read back. Never repaired automatically.
    #[error("manifest {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("internal inconsistency: {0}")]
    Inconsistent(String),

    #[error("provider returned an empty task id")]
    EmptyTaskId,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Hash(#[from] HashError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StaleManifest { .. } => true,
            Self::Client(e) => e.is_transient(),
            _ => false,
        }
    }
}
