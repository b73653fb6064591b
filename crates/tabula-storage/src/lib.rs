//! Persistence and network plumbing for tabula: the rate-limited fetch
//! client plus the blob, key-value and relational store contracts with their
//! filesystem, in-memory and PostgreSQL implementations.

use sha2::{Digest, Sha256};
use thiserror::Error;

mod blob;
mod fetch;
mod kv;
mod postgres;
mod records;

pub use blob::{read_json, write_json, BlobMetadata, BlobStore, FsBlobStore, MemoryBlobStore, StoredBlob};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HostPacer, HttpClientConfig, HttpFetcher, RetryDisposition, JSON_ACCEPT, XML_ACCEPT,
};
pub use kv::{
    discovery_key, load_discovery_state, save_discovery_state, KvStore, MemoryKvStore,
    LAST_RUN_KEY, LAST_SUCCESSFUL_RUN_KEY,
};
pub use postgres::PgStore;
pub use records::{MemoryRecordStore, RecordStore};

pub const CRATE_NAME: &str = "tabula-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
