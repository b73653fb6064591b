use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tabula_core::{DiscoveryState, SourceId};

use crate::StoreError;

pub const LAST_RUN_KEY: &str = "pipeline:last_run";
pub const LAST_SUCCESSFUL_RUN_KEY: &str = "pipeline:last_successful_run";

/// Small string key-value store holding cursors and run timestamps.
/// Last writer wins.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

pub fn discovery_key(source: SourceId) -> String {
    format!("discovery:{source}")
}

pub async fn load_discovery_state(
    kv: &dyn KvStore,
    source: SourceId,
) -> Result<Option<DiscoveryState>, StoreError> {
    match kv.get(&discovery_key(source)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn save_discovery_state(
    kv: &dyn KvStore,
    source: SourceId,
    state: &DiscoveryState,
) -> Result<(), StoreError> {
    kv.put(&discovery_key(source), &serde_json::to_string(state)?)
        .await
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn discovery_state_is_stored_per_source() {
        let kv = MemoryKvStore::new();
        assert!(load_discovery_state(&kv, SourceId::CbsMedia)
            .await
            .unwrap()
            .is_none());

        let state = DiscoveryState {
            latest_release: Some("2026/012".into()),
            ..DiscoveryState::new(Utc::now())
        };
        save_discovery_state(&kv, SourceId::CbsMedia, &state)
            .await
            .unwrap();

        let loaded = load_discovery_state(&kv, SourceId::CbsMedia).await.unwrap();
        assert_eq!(loaded, Some(state));
        assert!(kv.get("discovery:cbs-media").await.unwrap().is_some());
        assert!(load_discovery_state(&kv, SourceId::CbsXmlApi)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn corrupt_cursor_surfaces_an_error() {
        let kv = MemoryKvStore::new();
        kv.put("discovery:gov-il-reviews", "not json").await.unwrap();
        assert!(load_discovery_state(&kv, SourceId::GovIlReviews).await.is_err());
    }
}
