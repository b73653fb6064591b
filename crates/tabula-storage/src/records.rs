use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tabula_core::{
    AvgApartmentPriceRow, ConsumerPriceIndexRow, ExtractionStatus, FileRecord,
    HousingPriceIndexRow, PipelineRun, Publication, ReviewInsightRow, SourceId, TableKind,
    TableRows,
};

use crate::StoreError;

/// Relational ledger: publications, files, structured rows and runs.
///
/// Inserts of publications and files are insert-or-ignore keyed by id and
/// report whether a new row was written.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_publication(&self, publication: &Publication) -> Result<bool, StoreError>;

    async fn insert_file(&self, file: &FileRecord) -> Result<bool, StoreError>;

    async fn file_by_download_url(&self, url: &str) -> Result<Option<FileRecord>, StoreError>;

    async fn files_with_status(
        &self,
        status: ExtractionStatus,
    ) -> Result<Vec<FileRecord>, StoreError>;

    /// Update a file's extraction status. A `None` request id keeps the
    /// existing one.
    async fn set_extraction_status(
        &self,
        file_id: &str,
        status: ExtractionStatus,
        request_id: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Download URLs already archived for the given sources (all when empty).
    async fn known_download_urls(&self, sources: &[SourceId]) -> Result<Vec<String>, StoreError>;

    /// Insert a batch atomically; returns the number of rows written.
    async fn insert_rows(&self, rows: &TableRows) -> Result<usize, StoreError>;

    async fn upsert_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn latest_run(&self) -> Result<Option<PipelineRun>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    publications: BTreeMap<String, Publication>,
    files: BTreeMap<String, FileRecord>,
    housing_price_index: Vec<HousingPriceIndexRow>,
    avg_apartment_prices: Vec<AvgApartmentPriceRow>,
    consumer_price_index: Vec<ConsumerPriceIndexRow>,
    review_insights: Vec<ReviewInsightRow>,
    runs: BTreeMap<String, PipelineRun>,
}

/// In-memory record store used by tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn publications(&self) -> Vec<Publication> {
        self.tables().publications.values().cloned().collect()
    }

    pub fn files(&self) -> Vec<FileRecord> {
        self.tables().files.values().cloned().collect()
    }

    pub fn file(&self, id: &str) -> Option<FileRecord> {
        self.tables().files.get(id).cloned()
    }

    pub fn row_count(&self, kind: TableKind) -> usize {
        let tables = self.tables();
        match kind {
            TableKind::HousingPriceIndex => tables.housing_price_index.len(),
            TableKind::AvgApartmentPrices => tables.avg_apartment_prices.len(),
            TableKind::ConsumerPriceIndex => tables.consumer_price_index.len(),
            TableKind::ReviewInsights => tables.review_insights.len(),
        }
    }

    pub fn review_insights(&self) -> Vec<ReviewInsightRow> {
        self.tables().review_insights.clone()
    }

    pub fn runs(&self) -> Vec<PipelineRun> {
        self.tables().runs.values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_publication(&self, publication: &Publication) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        if tables.publications.contains_key(&publication.id) {
            return Ok(false);
        }
        tables
            .publications
            .insert(publication.id.clone(), publication.clone());
        Ok(true)
    }

    async fn insert_file(&self, file: &FileRecord) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        if tables.files.contains_key(&file.id) {
            return Ok(false);
        }
        tables.files.insert(file.id.clone(), file.clone());
        Ok(true)
    }

    async fn file_by_download_url(&self, url: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self
            .tables()
            .files
            .values()
            .find(|file| file.download_url == url)
            .cloned())
    }

    async fn files_with_status(
        &self,
        status: ExtractionStatus,
    ) -> Result<Vec<FileRecord>, StoreError> {
        Ok(self
            .tables()
            .files
            .values()
            .filter(|file| file.extraction_status == status)
            .cloned()
            .collect())
    }

    async fn set_extraction_status(
        &self,
        file_id: &str,
        status: ExtractionStatus,
        request_id: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(file) = self.tables().files.get_mut(file_id) {
            file.extraction_status = status;
            if let Some(request_id) = request_id {
                file.extraction_request_id = Some(request_id.to_string());
            }
        }
        Ok(())
    }

    async fn known_download_urls(&self, sources: &[SourceId]) -> Result<Vec<String>, StoreError> {
        Ok(self
            .tables()
            .files
            .values()
            .filter(|file| {
                sources.is_empty()
                    || SourceId::from_publication_id(&file.publication_id)
                        .is_some_and(|source| sources.contains(&source))
            })
            .map(|file| file.download_url.clone())
            .collect())
    }

    async fn insert_rows(&self, rows: &TableRows) -> Result<usize, StoreError> {
        let mut tables = self.tables();
        match rows {
            TableRows::HousingPriceIndex(rows) => {
                tables.housing_price_index.extend(rows.iter().cloned())
            }
            TableRows::AvgApartmentPrices(rows) => {
                tables.avg_apartment_prices.extend(rows.iter().cloned())
            }
            TableRows::ConsumerPriceIndex(rows) => {
                tables.consumer_price_index.extend(rows.iter().cloned())
            }
            TableRows::ReviewInsights(rows) => tables.review_insights.extend(rows.iter().cloned()),
        }
        Ok(rows.len())
    }

    async fn upsert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.tables().runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self
            .tables()
            .runs
            .values()
            .max_by_key(|run| run.started_at)
            .cloned())
    }
}
