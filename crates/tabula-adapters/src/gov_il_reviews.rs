use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tabula_core::{DiscoveryState, FileFormat, ManifestEntry, SourceId};
use tabula_storage::HttpFetcher;
use tracing::{info, warn};

use crate::{first_success, trim_base, AdapterError, Discovery, SourceDiscoverer};

const COLLECTION_GUID: &str = "3ed26e5e-41c1-4dbb-ac3f-b9b0f7b2c7b2";
const SUBJECT_REAL_ESTATE: &str = "01";
/// URL-encoded `נדל"ן`, the collector's name filter for real-estate reviews.
const REVIEW_NAME_FILTER: &str = "%D7%A0%D7%93%D7%9C%22%D7%9F";

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const DEFAULT_MAX_PAGES: usize = 20;

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Collector,
    WeeklyReview,
}

#[derive(Debug, Default, Deserialize)]
struct CollectorPage {
    #[serde(default)]
    results: Vec<CollectorItem>,
}

#[derive(Debug, Deserialize)]
struct CollectorItem {
    #[serde(rename = "UrlName")]
    url_name: String,
    #[serde(rename = "Data", default)]
    data: ItemData,
}

#[derive(Debug, Default, Deserialize)]
struct ItemData {
    #[serde(default)]
    search_by_name: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    publish_date: String,
    #[serde(default, rename = "file")]
    files: Vec<CollectorFile>,
}

#[derive(Debug, Deserialize)]
struct CollectorFile {
    #[serde(rename = "FileName")]
    file_name: String,
}

/// gov.il publishes dates as `d.M.yyyy`; midnight UTC of that day.
fn parse_publish_date(text: &str) -> Option<DateTime<Utc>> {
    let mut parts = text.trim().split('.');
    let day = parts.next()?.trim().parse().ok()?;
    let month = parts.next()?.trim().parse().ok()?;
    let year = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date.and_time(NaiveTime::MIN).and_utc())
}

/// Periodic real-estate reviews from the gov.il dynamic collector, newest
/// first, paged by `skip`.
#[derive(Debug, Clone)]
pub struct GovIlReviewsDiscoverer {
    base_url: String,
    page_size: usize,
    max_pages: usize,
}

impl GovIlReviewsDiscoverer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: trim_base(base_url),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn page_url(&self, endpoint: Endpoint, skip: usize) -> String {
        match endpoint {
            Endpoint::Collector => format!(
                "{}/he/api/DynamicCollectorResult/{COLLECTION_GUID}?skip={skip}&search_by_name=&subject={SUBJECT_REAL_ESTATE}",
                self.base_url
            ),
            Endpoint::WeeklyReview => format!(
                "{}/he/Departments/DynamicCollectors/weekly-review?skip={skip}&search_by_name={REVIEW_NAME_FILTER}",
                self.base_url
            ),
        }
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        endpoint: Endpoint,
        skip: usize,
    ) -> Result<CollectorPage, AdapterError> {
        Ok(http.fetch_json(&self.page_url(endpoint, skip)).await?)
    }

    fn file_url(&self, url_name: &str, file_name: &str) -> String {
        format!(
            "{}/BlobFolder/dynamiccollectorresultitem/{url_name}/he/{file_name}",
            self.base_url
        )
    }

    fn item_entries(&self, item: &CollectorItem, published: DateTime<Utc>) -> Vec<ManifestEntry> {
        item.data
            .files
            .iter()
            .filter_map(|file| {
                let format = FileFormat::from_filename(&file.file_name);
                if !matches!(format, FileFormat::Pdf | FileFormat::Docx) {
                    return None;
                }
                let mut metadata = Map::new();
                metadata.insert("url_name".into(), Value::from(item.url_name.clone()));
                metadata.insert(
                    "original_date".into(),
                    Value::from(item.data.publish_date.clone()),
                );
                if let Some(name) = &item.data.search_by_name {
                    metadata.insert("name".into(), Value::from(name.clone()));
                }
                if let Some(subject) = &item.data.subject {
                    metadata.insert("subject".into(), Value::from(subject.clone()));
                }
                Some(ManifestEntry {
                    source: SourceId::GovIlReviews,
                    url: self.file_url(&item.url_name, &file.file_name),
                    filename: file.file_name.clone(),
                    format,
                    publication_id: format!(
                        "{}{}",
                        SourceId::GovIlReviews.publication_prefix(),
                        item.url_name
                    ),
                    publish_date: published.to_rfc3339(),
                    metadata,
                    is_new: true,
                    inline_content: None,
                    extracted_from: None,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SourceDiscoverer for GovIlReviewsDiscoverer {
    fn source_id(&self) -> SourceId {
        SourceId::GovIlReviews
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        cursor: Option<&DiscoveryState>,
        now: DateTime<Utc>,
    ) -> Result<Discovery, AdapterError> {
        let known = cursor.and_then(|state| state.latest_publish_date);
        let mut entries = Vec::new();
        let mut newest: Option<DateTime<Utc>> = None;

        for page in 0..self.max_pages {
            let skip = page * self.page_size;
            let response = first_success(
                self.source_id(),
                &[Endpoint::Collector, Endpoint::WeeklyReview],
                |endpoint| self.fetch_page(http, *endpoint, skip),
            )
            .await?;
            if response.results.is_empty() {
                break;
            }

            let mut reached_known = false;
            for item in &response.results {
                let Some(published) = parse_publish_date(&item.data.publish_date) else {
                    warn!(
                        source = %self.source_id(),
                        item = %item.url_name,
                        date = %item.data.publish_date,
                        "unparseable publish date, skipping item"
                    );
                    continue;
                };
                if known.is_some_and(|known| published <= known) {
                    reached_known = true;
                    break;
                }
                let found = self.item_entries(item, published);
                if !found.is_empty() {
                    newest = newest.max(Some(published));
                }
                entries.extend(found);
            }

            if reached_known || response.results.len() < self.page_size {
                break;
            }
        }

        info!(
            source = %self.source_id(),
            entries = entries.len(),
            latest_publish_date = ?newest,
            "reviews discovered"
        );
        Ok(Discovery {
            entries,
            cursor: newest.map(|published| DiscoveryState {
                latest_publish_date: Some(published),
                ..DiscoveryState::new(now)
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, fetcher};
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(url_name: &str, date: &str, files: &[&str]) -> serde_json::Value {
        let files: Vec<_> = files
            .iter()
            .map(|name| json!({"FileName": name, "FileType": "application/octet-stream"}))
            .collect();
        json!({
            "UrlName": url_name,
            "Data": {"search_by_name": "סקירה", "subject": "01", "publish_date": date, "file": files}
        })
    }

    fn collector_path() -> String {
        format!("/he/api/DynamicCollectorResult/{COLLECTION_GUID}")
    }

    #[test]
    fn publish_dates_are_day_month_year() {
        assert_eq!(
            parse_publish_date("3.2.2026"),
            Some(Utc.with_ymd_and_hms(2026, 2, 3, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_publish_date("31.2.2026"), None);
        assert_eq!(parse_publish_date("2026-02-03"), None);
    }

    #[tokio::test]
    async fn pages_until_a_short_page_and_keeps_pdf_and_docx_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(collector_path()))
            .and(query_param("skip", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    item("review-3", "20.2.2026", &["review.pdf", "data.xlsx"]),
                    item("review-2", "10.2.2026", &["review.docx"])
                ],
                "totalResults": 3
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(collector_path()))
            .and(query_param("skip", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [item("review-1", "1.2.2026", &["review.pdf"])],
                "totalResults": 3
            })))
            .mount(&server)
            .await;

        let found = GovIlReviewsDiscoverer::new(&server.uri())
            .with_page_size(2)
            .discover(&fetcher(), None, at(2026, 2, 25))
            .await
            .unwrap();

        let ids: Vec<_> = found.entries.iter().map(|e| e.publication_id.as_str()).collect();
        assert_eq!(ids, vec!["gov-il-review-3", "gov-il-review-2", "gov-il-review-1"]);
        assert_eq!(
            found.entries[0].url,
            format!("{}/BlobFolder/dynamiccollectorresultitem/review-3/he/review.pdf", server.uri())
        );
        assert_eq!(found.entries[0].metadata_text("original_date").as_deref(), Some("20.2.2026"));
        assert_eq!(
            found.cursor.unwrap().latest_publish_date,
            Some(Utc.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn stops_at_the_first_known_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(collector_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    item("review-3", "20.2.2026", &["review.pdf"]),
                    item("review-2", "10.2.2026", &["review.pdf"]),
                    item("review-1", "1.2.2026", &["review.pdf"])
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut cursor = DiscoveryState::new(at(2026, 2, 11));
        cursor.latest_publish_date = Some(Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap());
        let found = GovIlReviewsDiscoverer::new(&server.uri())
            .with_page_size(3)
            .discover(&fetcher(), Some(&cursor), at(2026, 2, 25))
            .await
            .unwrap();

        assert_eq!(found.entries.len(), 1);
        assert_eq!(found.entries[0].publication_id, "gov-il-review-3");
    }

    #[tokio::test]
    async fn falls_back_to_the_weekly_review_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(collector_path()))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/he/Departments/DynamicCollectors/weekly-review"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [item("weekly-9", "5.1.2026", &["weekly.pdf"])]
            })))
            .mount(&server)
            .await;

        let found = GovIlReviewsDiscoverer::new(&server.uri())
            .discover(&fetcher(), None, at(2026, 1, 10))
            .await
            .unwrap();
        assert_eq!(found.entries.len(), 1);
        assert_eq!(found.entries[0].metadata_text("url_name").as_deref(), Some("weekly-9"));
    }

    #[tokio::test]
    async fn empty_first_page_means_no_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;

        let found = GovIlReviewsDiscoverer::new(&server.uri())
            .discover(&fetcher(), None, at(2026, 1, 10))
            .await
            .unwrap();
        assert!(found.entries.is_empty());
        assert!(found.cursor.is_none());
    }

    #[tokio::test]
    async fn page_cap_bounds_the_walk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(collector_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [item("same", "1.1.2026", &["a.pdf"])]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let found = GovIlReviewsDiscoverer::new(&server.uri())
            .with_page_size(1)
            .with_max_pages(2)
            .discover(&fetcher(), None, at(2026, 1, 10))
            .await
            .unwrap();
        assert_eq!(found.entries.len(), 2);
    }
}
