use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tabula_core::{DiscoveryState, SourceId};
use tabula_storage::HttpFetcher;
use tracing::info;

use crate::sharepoint::{FolderRef, SharePointSection};
use crate::{first_success, trim_base, AdapterError, Discovery, SourceDiscoverer};

const SECTION: &str = "publications";

#[derive(Debug, Clone, Copy)]
enum Strategy {
    ListItems,
    DocLibFolders,
}

/// CBS statistical publications, one DocLib folder per publication.
#[derive(Debug, Clone)]
pub struct CbsPublicationsDiscoverer {
    base_url: String,
}

impl CbsPublicationsDiscoverer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: trim_base(base_url),
        }
    }

    async fn folders(
        &self,
        site: &SharePointSection<'_>,
        strategy: Strategy,
        year: i32,
    ) -> Result<Vec<FolderRef>, AdapterError> {
        match strategy {
            Strategy::ListItems => Ok(site
                .list_items(year)
                .await?
                .into_iter()
                .filter_map(|item| item.into_folder())
                .collect()),
            Strategy::DocLibFolders => {
                let year = year.to_string();
                Ok(site
                    .list_folders(&year)
                    .await?
                    .into_iter()
                    .map(|folder| FolderRef::bare(year.clone(), folder))
                    .collect())
            }
        }
    }
}

#[async_trait]
impl SourceDiscoverer for CbsPublicationsDiscoverer {
    fn source_id(&self) -> SourceId {
        SourceId::CbsPublications
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        cursor: Option<&DiscoveryState>,
        now: DateTime<Utc>,
    ) -> Result<Discovery, AdapterError> {
        let site = SharePointSection::new(http, &self.base_url, SECTION, self.source_id());
        let folders = first_success(
            self.source_id(),
            &[Strategy::ListItems, Strategy::DocLibFolders],
            |strategy| self.folders(&site, *strategy, now.year()),
        )
        .await?;

        let known = cursor.and_then(|state| state.latest_folder.as_deref());
        let scan = site.scan(folders, known).await;
        info!(
            source = %self.source_id(),
            entries = scan.entries.len(),
            latest_folder = ?scan.cursor_key,
            "publications discovered"
        );

        Ok(Discovery {
            entries: scan.entries,
            cursor: scan.cursor_key.map(|folder| DiscoveryState {
                latest_folder: Some(folder),
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
    use tabula_core::FileFormat;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn files_json(names: &[&str], folder: &str) -> serde_json::Value {
        let files: Vec<_> = names
            .iter()
            .map(|name| {
                json!({
                    "Name": name,
                    "ServerRelativeUrl": format!("/he/publications/Madad/DocLib/2026/{folder}/{name}"),
                    "Length": "2048",
                    "ListItemAllFields": {"Title": "לוח 1", "CbsEnglishTitle": "Table 1", "CbsOrderField": 3}
                })
            })
            .collect();
        json!({ "value": files })
    }

    #[tokio::test]
    async fn list_items_strategy_skips_known_folders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/he/publications/Madad/_api/Web/Lists/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "d": {"results": [
                    {"Title": "מדדי מחירים 02", "CbsEnglishTitle": "Price indices 02",
                     "CbsPublishingFolderLevel1": "2026", "CbsPublishingFolderLevel2": "price02aa",
                     "Created": "2026-02-15T10:00:00Z"},
                    {"Title": "מדדי מחירים 01", "CbsPublishingFolderLevel1": "2026",
                     "CbsPublishingFolderLevel2": "price01aa", "Created": "2026-01-15T10:00:00Z"}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"DocLib/2026/price02aa'\)/Files$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(files_json(&["aa2_1_h.xlsx", "aa2_1_h.pdf", "readme.txt"], "price02aa")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"DocLib/2026/price01aa'\)/Files$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(files_json(&["old.xlsx"], "price01aa")))
            .expect(0)
            .mount(&server)
            .await;

        let discoverer = CbsPublicationsDiscoverer::new(&server.uri());
        let mut cursor = DiscoveryState::new(at(2026, 1, 20));
        cursor.latest_folder = Some("2026/price01aa".into());
        let found = discoverer
            .discover(&fetcher(), Some(&cursor), at(2026, 2, 20))
            .await
            .unwrap();

        assert_eq!(found.entries.len(), 2);
        let xlsx = &found.entries[0];
        assert_eq!(xlsx.publication_id, "cbs-pub-2026-price02aa");
        assert_eq!(xlsx.format, FileFormat::Xlsx);
        assert_eq!(
            xlsx.url,
            format!("{}/he/publications/Madad/DocLib/2026/price02aa/aa2_1_h.xlsx", server.uri())
        );
        assert_eq!(xlsx.publish_date, "2026-02-15T10:00:00Z");
        assert_eq!(xlsx.metadata_text("folder").as_deref(), Some("price02aa"));
        assert_eq!(xlsx.metadata_text("title_en").as_deref(), Some("Price indices 02"));
        assert_eq!(xlsx.metadata_text("size").as_deref(), Some("2048"));
        assert_eq!(xlsx.metadata_text("order").as_deref(), Some("3"));
        assert_eq!(
            found.cursor.unwrap().latest_folder.as_deref(),
            Some("2026/price02aa")
        );
    }

    #[tokio::test]
    async fn doclib_fallback_does_not_advance_past_a_failed_folder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/he/publications/Madad/_api/Web/Lists/Items"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"DocLib/2026'\)/Folders$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"Name": "price01aa"}, {"Name": "price02aa"}, {"Name": "price03aa"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"DocLib/2026/price01aa'\)/Files$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(files_json(&["a.xlsx"], "price01aa")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"DocLib/2026/price02aa'\)/Files$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"DocLib/2026/price03aa'\)/Files$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(files_json(&["c.pdf"], "price03aa")))
            .mount(&server)
            .await;

        let discoverer = CbsPublicationsDiscoverer::new(&format!("{}/", server.uri()));
        let found = discoverer
            .discover(&fetcher(), None, at(2026, 3, 1))
            .await
            .unwrap();

        let ids: Vec<_> = found.entries.iter().map(|e| e.publication_id.as_str()).collect();
        assert_eq!(ids, vec!["cbs-pub-2026-price01aa", "cbs-pub-2026-price03aa"]);
        assert_eq!(found.entries[0].publish_date, "");
        assert_eq!(
            found.cursor.unwrap().latest_folder.as_deref(),
            Some("2026/price01aa")
        );
    }

    #[tokio::test]
    async fn all_strategies_failing_surfaces_the_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = CbsPublicationsDiscoverer::new(&server.uri())
            .discover(&fetcher(), None, at(2026, 3, 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Folders"), "{err}");
    }
}
