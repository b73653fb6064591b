use std::sync::Arc;

use chrono::{DateTime, Utc};
use tabula_adapters::{discoverer_for_source, AdapterError, SourceDiscoverer};
use tabula_core::{ManifestEntry, Phase, PipelineError, SourceId};
use tabula_storage::{load_discovery_state, save_discovery_state, HttpFetcher, KvStore};
use tracing::{info, info_span, warn, Instrument};

use crate::config::SourceRegistry;

/// Union of everything the enabled sources reported in one pass.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub entries: Vec<ManifestEntry>,
    pub errors: Vec<PipelineError>,
    pub sources_checked: u32,
}

/// Runs every registered discoverer concurrently and owns cursor persistence.
pub struct DiscoveryCoordinator {
    discoverers: Vec<Arc<dyn SourceDiscoverer>>,
    http: Arc<HttpFetcher>,
    kv: Arc<dyn KvStore>,
}

impl DiscoveryCoordinator {
    pub fn new(
        discoverers: Vec<Arc<dyn SourceDiscoverer>>,
        http: Arc<HttpFetcher>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            discoverers,
            http,
            kv,
        }
    }

    pub fn from_registry(
        registry: &SourceRegistry,
        http: Arc<HttpFetcher>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let discoverers = registry
            .enabled()
            .map(|source| discoverer_for_source(source.source_id, &source.settings))
            .collect();
        Self::new(discoverers, http, kv)
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.discoverers.iter().map(|d| d.source_id()).collect()
    }

    pub async fn discover_all(&self, now: DateTime<Utc>) -> DiscoveryOutcome {
        let handles: Vec<_> = self
            .discoverers
            .iter()
            .map(|discoverer| {
                let source = discoverer.source_id();
                let task = discover_source(
                    Arc::clone(discoverer),
                    Arc::clone(&self.http),
                    Arc::clone(&self.kv),
                    now,
                )
                .instrument(info_span!("discover", %source));
                (source, tokio::spawn(task))
            })
            .collect();

        let mut outcome = DiscoveryOutcome::default();
        for (source, handle) in handles {
            let message = match handle.await {
                Ok(Ok(entries)) => {
                    info!(%source, found = entries.len(), "source checked");
                    outcome.sources_checked += 1;
                    outcome.entries.extend(entries);
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(join_err) => format!("discovery task aborted: {join_err}"),
            };
            warn!(%source, error = %message, "discovery failed");
            outcome
                .errors
                .push(PipelineError::new(Phase::Discovery, message).with_source(source.as_str()));
        }
        outcome
    }
}

async fn discover_source(
    discoverer: Arc<dyn SourceDiscoverer>,
    http: Arc<HttpFetcher>,
    kv: Arc<dyn KvStore>,
    now: DateTime<Utc>,
) -> Result<Vec<ManifestEntry>, AdapterError> {
    let source = discoverer.source_id();
    let previous = match load_discovery_state(kv.as_ref(), source).await {
        Ok(state) => state,
        Err(err) => {
            warn!(%source, error = %err, "unreadable cursor; starting from empty history");
            None
        }
    };

    let found = discoverer.discover(&http, previous.as_ref(), now).await?;

    if let Some(cursor) = found.cursor {
        let merged = cursor.merged_with(previous.as_ref());
        if let Err(err) = save_discovery_state(kv.as_ref(), source, &merged).await {
            warn!(%source, error = %err, "failed to persist cursor");
        }
    }
    Ok(found.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fetcher, manifest_entry};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tabula_adapters::Discovery;
    use tabula_core::{DiscoveryState, FileFormat};
    use tabula_storage::MemoryKvStore;

    enum Behaviour {
        Finds(&'static str),
        Fails,
        Panics,
    }

    struct FakeDiscoverer {
        source: SourceId,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl SourceDiscoverer for FakeDiscoverer {
        fn source_id(&self) -> SourceId {
            self.source
        }

        async fn discover(
            &self,
            _http: &HttpFetcher,
            cursor: Option<&DiscoveryState>,
            now: DateTime<Utc>,
        ) -> Result<Discovery, AdapterError> {
            match self.behaviour {
                Behaviour::Finds(folder) => {
                    let known = cursor.and_then(|c| c.latest_folder.as_deref());
                    if known.is_some_and(|known| known >= folder) {
                        return Ok(Discovery::default());
                    }
                    let publication = format!("{}{folder}", self.source.publication_prefix());
                    Ok(Discovery {
                        entries: vec![manifest_entry(
                            self.source,
                            &publication,
                            "table.xlsx",
                            FileFormat::Xlsx,
                        )],
                        cursor: Some(DiscoveryState {
                            latest_folder: Some(folder.to_string()),
                            ..DiscoveryState::new(now)
                        }),
                    })
                }
                Behaviour::Fails => Err(AdapterError::Malformed("upstream returned html".into())),
                Behaviour::Panics => panic!("discoverer bug"),
            }
        }
    }

    fn fake(source: SourceId, behaviour: Behaviour) -> Arc<dyn SourceDiscoverer> {
        Arc::new(FakeDiscoverer { source, behaviour })
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn one_failing_source_does_not_affect_the_others() {
        let kv = Arc::new(MemoryKvStore::new());
        let coordinator = DiscoveryCoordinator::new(
            vec![
                fake(SourceId::CbsPublications, Behaviour::Finds("2026/a")),
                fake(SourceId::CbsMedia, Behaviour::Finds("2026/b")),
                fake(SourceId::CbsXmlApi, Behaviour::Fails),
                fake(SourceId::GovIlReviews, Behaviour::Finds("2026/c")),
            ],
            Arc::new(fetcher()),
            kv.clone(),
        );

        let outcome = coordinator.discover_all(now()).await;
        assert_eq!(outcome.sources_checked, 3);
        assert_eq!(outcome.entries.len(), 3);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].phase, Phase::Discovery);
        assert_eq!(outcome.errors[0].source.as_deref(), Some("cbs-xml-api"));
        assert!(outcome.errors[0].error_message.contains("upstream returned html"));
    }

    #[tokio::test]
    async fn panicking_discoverer_is_reported_against_its_source() {
        let coordinator = DiscoveryCoordinator::new(
            vec![
                fake(SourceId::CbsMedia, Behaviour::Panics),
                fake(SourceId::CbsPublications, Behaviour::Finds("2026/a")),
            ],
            Arc::new(fetcher()),
            Arc::new(MemoryKvStore::new()),
        );

        let outcome = coordinator.discover_all(now()).await;
        assert_eq!(outcome.sources_checked, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].source.as_deref(), Some("cbs-media"));
    }

    #[tokio::test]
    async fn cursors_are_persisted_and_never_move_backwards() {
        let kv = Arc::new(MemoryKvStore::new());
        let stored = DiscoveryState {
            latest_folder: Some("2026/m".into()),
            latest_period: Some("2026-ינואר".into()),
            ..DiscoveryState::new(now())
        };
        save_discovery_state(kv.as_ref(), SourceId::CbsPublications, &stored)
            .await
            .unwrap();

        let coordinator = DiscoveryCoordinator::new(
            vec![fake(SourceId::CbsPublications, Behaviour::Finds("2026/z"))],
            Arc::new(fetcher()),
            kv.clone(),
        );
        let first = coordinator.discover_all(now()).await;
        assert_eq!(first.entries.len(), 1);

        let saved = load_discovery_state(kv.as_ref(), SourceId::CbsPublications)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.latest_folder.as_deref(), Some("2026/z"));
        assert_eq!(saved.latest_period.as_deref(), Some("2026-ינואר"));

        let second = coordinator.discover_all(now()).await;
        assert!(second.entries.is_empty());
        assert_eq!(second.sources_checked, 1);
    }

    #[tokio::test]
    async fn corrupt_cursor_is_treated_as_empty_history() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put("discovery:cbs-media", "{not json").await.unwrap();
        let coordinator = DiscoveryCoordinator::new(
            vec![fake(SourceId::CbsMedia, Behaviour::Finds("2026/010"))],
            Arc::new(fetcher()),
            kv.clone(),
        );

        let outcome = coordinator.discover_all(now()).await;
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.entries.len(), 1);
        let saved = load_discovery_state(kv.as_ref(), SourceId::CbsMedia)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.latest_folder.as_deref(), Some("2026/010"));
    }

    #[test]
    fn registry_builds_only_enabled_sources() {
        let mut registry = SourceRegistry::all_enabled();
        registry.sources[1].enabled = false;
        let coordinator = DiscoveryCoordinator::from_registry(
            &registry,
            Arc::new(fetcher()),
            Arc::new(MemoryKvStore::new()),
        );
        assert_eq!(coordinator.sources().len(), SourceId::ALL.len() - 1);
        assert!(!coordinator.sources().contains(&SourceId::CbsMedia));
    }
}
