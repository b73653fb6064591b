use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tabula_core::{period_is_newer, DiscoveryState, FileFormat, ManifestEntry, SourceId};
use tabula_storage::HttpFetcher;
use tracing::info;

use crate::extract::cpi_xml::parse_snapshot;
use crate::{trim_base, AdapterError, Discovery, SourceDiscoverer};

const PRICE_SELECTED_PATH: &str = "/index/data/price_selected?format=xml&download=false&lang=he";

/// Monthly consumer price index snapshot. The payload is small, so it is
/// carried inline instead of being downloaded a second time.
#[derive(Debug, Clone)]
pub struct CbsXmlApiDiscoverer {
    base_url: String,
}

impl CbsXmlApiDiscoverer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: trim_base(base_url),
        }
    }

    fn url(&self) -> String {
        format!("{}{PRICE_SELECTED_PATH}", self.base_url)
    }
}

#[async_trait]
impl SourceDiscoverer for CbsXmlApiDiscoverer {
    fn source_id(&self) -> SourceId {
        SourceId::CbsXmlApi
    }

    async fn discover(
        &self,
        http: &HttpFetcher,
        cursor: Option<&DiscoveryState>,
        now: DateTime<Utc>,
    ) -> Result<Discovery, AdapterError> {
        let url = self.url();
        let xml = http.fetch_xml(&url).await?;
        let snapshot =
            parse_snapshot(&xml).map_err(|err| AdapterError::Malformed(err.to_string()))?;

        let Some(period) = snapshot.period else {
            info!(source = %self.source_id(), "price index document carries no period");
            return Ok(Discovery::default());
        };
        let label = period.label();
        let known = cursor.and_then(|state| state.latest_period.as_deref());
        if !period_is_newer(&label, known) {
            info!(source = %self.source_id(), period = %label, "no new price index period");
            return Ok(Discovery::default());
        }

        let mut metadata = Map::new();
        metadata.insert("latest_period".into(), Value::from(label.clone()));
        metadata.insert("year".into(), Value::from(period.year.clone()));
        metadata.insert("month_he".into(), Value::from(period.month.clone()));
        metadata.insert("indices_count".into(), Value::from(snapshot.indices.len()));
        metadata.insert("raw_xml_length".into(), Value::from(xml.len()));

        let entry = ManifestEntry {
            source: self.source_id(),
            url,
            filename: format!("price_selected_{}.xml", now.format("%Y-%m-%d")),
            format: FileFormat::Xml,
            publication_id: format!("{}{label}", self.source_id().publication_prefix()),
            publish_date: now.to_rfc3339(),
            metadata,
            is_new: true,
            inline_content: Some(xml),
            extracted_from: None,
        };
        info!(source = %self.source_id(), period = %label, "new price index period");

        Ok(Discovery {
            entries: vec![entry],
            cursor: Some(DiscoveryState {
                latest_period: Some(label),
                ..DiscoveryState::new(now)
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::cpi_xml::SAMPLE_XML;
    use crate::test_support::{at, fetcher};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(xml: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index/data/price_selected"))
            .and(query_param("format", "xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/xml; charset=utf-8")
                    .set_body_string(xml),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn new_period_emits_one_inline_entry() {
        let server = serve(SAMPLE_XML).await;
        let found = CbsXmlApiDiscoverer::new(&server.uri())
            .discover(&fetcher(), None, at(2026, 2, 15))
            .await
            .unwrap();

        let [entry] = found.entries.as_slice() else {
            panic!("expected one entry");
        };
        assert_eq!(entry.filename, "price_selected_2026-02-15.xml");
        assert_eq!(entry.publication_id, "cbs-xml-api-2026-ינואר");
        assert_eq!(entry.format, FileFormat::Xml);
        assert_eq!(entry.metadata_text("indices_count").as_deref(), Some("3"));
        assert_eq!(entry.metadata_text("month_he").as_deref(), Some("ינואר"));
        assert_eq!(entry.inline_content.as_deref(), Some(SAMPLE_XML));
        assert_eq!(
            found.cursor.unwrap().latest_period.as_deref(),
            Some("2026-ינואר")
        );
    }

    #[tokio::test]
    async fn known_or_older_period_emits_nothing() {
        let server = serve(SAMPLE_XML).await;
        let discoverer = CbsXmlApiDiscoverer::new(&server.uri());

        for known in ["2026-ינואר", "2026-פברואר"] {
            let mut cursor = DiscoveryState::new(at(2026, 2, 1));
            cursor.latest_period = Some(known.to_string());
            let found = discoverer
                .discover(&fetcher(), Some(&cursor), at(2026, 2, 15))
                .await
                .unwrap();
            assert!(found.entries.is_empty(), "known period {known}");
            assert!(found.cursor.is_none());
        }
    }

    #[tokio::test]
    async fn document_without_period_is_not_an_error() {
        let server = serve("<indices></indices>").await;
        let found = CbsXmlApiDiscoverer::new(&server.uri())
            .discover(&fetcher(), None, at(2026, 2, 15))
            .await
            .unwrap();
        assert!(found.entries.is_empty());
    }
}
