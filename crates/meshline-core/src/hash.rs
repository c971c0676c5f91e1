use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::canonical::canonicalize;

/// 12 hex chars = 48 bits. Widen instead of switching algorithms so hashes
/// already on disk stay valid.
pub const DEFAULT_SPEC_HASH_LEN: usize = 12;

const FILE_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("failed to serialize spec: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Truncated SHA-256 of an already-canonical string.
pub fn hash_canonical(canonical: &str, len: usize) -> String {
    let mut full = sha256_hex(canonical.as_bytes());
    full.truncate(len.clamp(1, 64));
    full
}

/// Dedup key for a request, returned together with the canonical string it
/// was computed from.
pub fn spec_hash_with_len<T: Serialize + ?Sized>(
    spec: &T,
    len: usize,
) -> Result<(String, String), HashError> {
    let canonical = canonicalize(spec)?;
    let hash = hash_canonical(&canonical, len);
    Ok((hash, canonical))
}

pub fn spec_hash<T: Serialize + ?Sized>(spec: &T) -> Result<String, HashError> {
    spec_hash_with_len(spec, DEFAULT_SPEC_HASH_LEN).map(|(hash, _)| hash)
}

/// Stream a file through SHA-256. Returns the hex digest and the byte count.
pub async fn sha256_file(path: &Path) -> Result<(String, u64), HashError> {
    let io_err = |source| HashError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FILE_CHUNK_BYTES];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total = total.saturating_add(n as u64);
    }
    Ok((hex::encode(hasher.finalize()), total))
}
