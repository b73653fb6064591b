//! Source discoverers and in-process content extractors.
//!
//! A discoverer turns a stored cursor into the list of files an upstream has
//! published since, plus the cursor to store next. Extractors turn archived
//! bytes into structured rows for the formats that can be parsed in process.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tabula_core::{DiscoveryState, ManifestEntry, SourceId};
use tabula_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::warn;

mod cbs_media;
mod cbs_publications;
mod cbs_xml_api;
pub mod extract;
mod gov_il_reviews;
mod sharepoint;

pub use cbs_media::CbsMediaDiscoverer;
pub use cbs_publications::CbsPublicationsDiscoverer;
pub use cbs_xml_api::CbsXmlApiDiscoverer;
pub use extract::{ContentExtractor, ExtractError, ExtractorRegistry};
pub use gov_il_reviews::GovIlReviewsDiscoverer;

pub const CRATE_NAME: &str = "tabula-adapters";

pub const CBS_BASE_URL: &str = "https://www.cbs.gov.il";
pub const CBS_API_BASE_URL: &str = "https://api.cbs.gov.il";
pub const GOV_IL_BASE_URL: &str = "https://www.gov.il";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
    #[error("no discovery strategy available")]
    NoStrategies,
}

/// Per-source knobs loaded from the source registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscovererSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
}

/// What one discovery pass found.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub entries: Vec<ManifestEntry>,
    /// Cursor to persist; `None` leaves the stored cursor untouched.
    pub cursor: Option<DiscoveryState>,
}

#[async_trait]
pub trait SourceDiscoverer: Send + Sync {
    fn source_id(&self) -> SourceId;

    async fn discover(
        &self,
        http: &HttpFetcher,
        cursor: Option<&DiscoveryState>,
        now: DateTime<Utc>,
    ) -> Result<Discovery, AdapterError>;
}

pub fn discoverer_for_source(
    source: SourceId,
    settings: &DiscovererSettings,
) -> Arc<dyn SourceDiscoverer> {
    match source {
        SourceId::CbsPublications => Arc::new(CbsPublicationsDiscoverer::new(
            settings.base_url.as_deref().unwrap_or(CBS_BASE_URL),
        )),
        SourceId::CbsMedia => Arc::new(CbsMediaDiscoverer::new(
            settings.base_url.as_deref().unwrap_or(CBS_BASE_URL),
        )),
        SourceId::CbsXmlApi => Arc::new(CbsXmlApiDiscoverer::new(
            settings.base_url.as_deref().unwrap_or(CBS_API_BASE_URL),
        )),
        SourceId::GovIlReviews => {
            let mut discoverer = GovIlReviewsDiscoverer::new(
                settings.base_url.as_deref().unwrap_or(GOV_IL_BASE_URL),
            );
            if let Some(page_size) = settings.page_size {
                discoverer = discoverer.with_page_size(page_size);
            }
            if let Some(max_pages) = settings.max_pages {
                discoverer = discoverer.with_max_pages(max_pages);
            }
            Arc::new(discoverer)
        }
    }
}

/// Try each strategy in order; the first success wins, otherwise the last
/// failure is returned.
pub(crate) async fn first_success<S, T, F, Fut>(
    source: SourceId,
    strategies: &[S],
    mut attempt: F,
) -> Result<T, AdapterError>
where
    S: std::fmt::Debug,
    F: FnMut(&S) -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut last_error = None;
    for strategy in strategies {
        match attempt(strategy).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(%source, ?strategy, error = %err, "discovery strategy failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or(AdapterError::NoStrategies))
}

pub(crate) fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tabula_storage::{BackoffPolicy, HostPacer, HttpClientConfig, HttpFetcher};

    /// Fetcher without pacing or retries so failing mocks answer immediately.
    pub fn fetcher() -> HttpFetcher {
        HttpFetcher::with_pacer(
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_attempts: 1,
                    ..BackoffPolicy::default()
                },
                ..HttpClientConfig::default()
            },
            Arc::new(HostPacer::new(Duration::ZERO)),
        )
        .unwrap()
    }

    pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 6, 0, 0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_source_has_a_discoverer() {
        for source in SourceId::ALL {
            let discoverer = discoverer_for_source(*source, &DiscovererSettings::default());
            assert_eq!(discoverer.source_id(), *source);
        }
    }

    #[tokio::test]
    async fn fallback_returns_first_success_or_last_error() {
        let ok = first_success(SourceId::GovIlReviews, &["primary", "fallback"], |s| {
            let s = *s;
            async move {
                if s == "primary" {
                    Err(AdapterError::Malformed("primary down".into()))
                } else {
                    Ok(s)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ok, "fallback");

        let err = first_success(SourceId::GovIlReviews, &["a", "b"], |s| {
            let message = format!("{s} down");
            async move { Err::<(), _>(AdapterError::Malformed(message)) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "malformed upstream payload: b down");

        let none: Result<(), _> =
            first_success(SourceId::GovIlReviews, &[] as &[&str], |_| async { Ok(()) }).await;
        assert!(matches!(none, Err(AdapterError::NoStrategies)));
    }
}
