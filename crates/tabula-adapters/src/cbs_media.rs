use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tabula_core::{DiscoveryState, SourceId};
use tabula_storage::HttpFetcher;
use tracing::info;

use crate::sharepoint::{FolderRef, SharePointSection};
use crate::{trim_base, AdapterError, Discovery, SourceDiscoverer};

const SECTION: &str = "mediarelease";

/// CBS press releases; each DocLib folder is one numbered release.
#[derive(Debug, Clone)]
pub struct CbsMediaDiscoverer {
    base_url: String,
}

impl CbsMediaDiscoverer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: trim_base(base_url),
        }
    }
}

#[async_trait]
impl SourceDiscoverer for CbsMediaDiscoverer {
    fn source_id(&self) -> SourceId {
        SourceId::CbsMedia
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        cursor: Option<&DiscoveryState>,
        now: DateTime<Utc>,
    ) -> Result<Discovery, AdapterError> {
        let site = SharePointSection::new(http, &self.base_url, SECTION, self.source_id());
        let year = now.year().to_string();
        let releases: Vec<FolderRef> = site
            .list_folders(&year)
            .await?
            .into_iter()
            .map(|release| FolderRef::bare(year.clone(), release))
            .collect();

        let known = cursor.and_then(|state| state.latest_release.as_deref());
        let scan = site.scan(releases, known).await;
        info!(
            source = %self.source_id(),
            entries = scan.entries.len(),
            latest_release = ?scan.cursor_key,
            "media releases discovered"
        );

        Ok(Discovery {
            entries: scan.entries,
            cursor: scan.cursor_key.map(|release| DiscoveryState {
                latest_release: Some(release),
                ..DiscoveryState::new(now)
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, fetcher};
    use serde_json::json;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn only_releases_newer_than_the_cursor_are_listed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/he/mediarelease/Madad/_api/web/.*DocLib/2026'\)/Folders$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "d": {"results": [{"Name": "011"}, {"Name": "012"}, {"Name": "Forms"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"DocLib/2026/012'\)/Files$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"Name": "10_26_012b.docx", "ServerRelativeUrl": "/he/mediarelease/Madad/DocLib/2026/012/10_26_012b.docx", "Length": 48211},
                    {"Name": "10_26_012b.pdf", "ServerRelativeUrl": "/he/mediarelease/Madad/DocLib/2026/012/10_26_012b.pdf", "Length": "90112"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut cursor = DiscoveryState::new(at(2026, 1, 5));
        cursor.latest_release = Some("2026/011".into());
        let found = CbsMediaDiscoverer::new(&server.uri())
            .discover(&fetcher(), Some(&cursor), at(2026, 1, 20))
            .await
            .unwrap();

        assert_eq!(found.entries.len(), 2);
        let entry = &found.entries[0];
        assert_eq!(entry.source, SourceId::CbsMedia);
        assert_eq!(entry.publication_id, "cbs-media-2026-012");
        assert_eq!(entry.metadata_text("release_number").as_deref(), Some("012"));
        assert_eq!(entry.metadata_text("year").as_deref(), Some("2026"));
        assert_eq!(entry.metadata_text("size").as_deref(), Some("48211"));
        let cursor = found.cursor.unwrap();
        assert_eq!(cursor.latest_release.as_deref(), Some("2026/012"));
        assert_eq!(cursor.latest_folder, None);
    }

    #[tokio::test]
    async fn nothing_new_leaves_the_cursor_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"Folders$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"Name": "011"}]})))
            .mount(&server)
            .await;

        let mut cursor = DiscoveryState::new(at(2026, 1, 5));
        cursor.latest_release = Some("2026/011".into());
        let found = CbsMediaDiscoverer::new(&server.uri())
            .discover(&fetcher(), Some(&cursor), at(2026, 1, 20))
            .await
            .unwrap();

        assert!(found.entries.is_empty());
        assert!(found.cursor.is_none());
    }
}
