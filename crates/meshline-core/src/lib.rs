//! Content addressing for job requests.
//!
//! A request is reduced to a canonical JSON string (sorted keys, compact
//! separators, ASCII-only escapes) and hashed with SHA-256. The truncated hex
//! digest is the dedup key under which an asset is stored.

pub mod canonical;
pub mod hash;

pub use canonical::{canonicalize, to_canonical_json};
pub use hash::{
    DEFAULT_SPEC_HASH_LEN, HashError, hash_canonical, sha256_file, sha256_hex, spec_hash,
    spec_hash_with_len,
};
