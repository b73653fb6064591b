use anyhow::{bail, Result};
use chrono::Utc;
use tabula_adapters::ExtractorRegistry;
use tabula_core::{
    request_key, ExtractionRequest, ExtractionSchema, ExtractionStatus, FileFormat, FileRecord,
    Phase, PipelineError, RequestedFile, SourceId, TableKind, TableRows,
};
use tabula_storage::{write_json, BlobStore, RecordStore};
use tracing::{debug, info, warn};

use crate::context::RunContext;

/// Formats parsed inside this process. Legacy binary `.xls` workbooks go to
/// the external worker with the documents.
pub const IN_PROCESS_FORMATS: [FileFormat; 3] = [FileFormat::Xlsx, FileFormat::Xml, FileFormat::Docx];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    InProcess,
    External,
    Skip,
}

fn route_for(format: FileFormat) -> Route {
    match format {
        FileFormat::Xlsx | FileFormat::Xml | FileFormat::Docx => Route::InProcess,
        FileFormat::Pdf | FileFormat::Doc | FileFormat::Xls => Route::External,
        FileFormat::Zip | FileFormat::Other => Route::Skip,
    }
}

/// What the external extractor is told to expect from a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaHint {
    pub expected_content: &'static str,
    pub table: TableKind,
    pub fields: &'static [&'static str],
}

const NATIONAL_INDEX: SchemaHint = SchemaHint {
    expected_content: "Housing Price Index (national)",
    table: TableKind::HousingPriceIndex,
    fields: &["period", "index_value", "base_year", "pct_change_monthly", "pct_change_annual"],
};
const AVERAGE_PRICES: SchemaHint = SchemaHint {
    expected_content: "Average Apartment Prices by district, city, and rooms",
    table: TableKind::AvgApartmentPrices,
    fields: &["period", "district", "city", "rooms", "avg_price_nis_thousands"],
};
const DISTRICT_INDEX: SchemaHint = SchemaHint {
    expected_content: "Housing Price Index by District",
    table: TableKind::HousingPriceIndex,
    fields: &["period", "district", "index_value", "base_year", "pct_change"],
};
const NEW_DWELLINGS_INDEX: SchemaHint = SchemaHint {
    expected_content: "New Housing Price Index",
    table: TableKind::HousingPriceIndex,
    fields: &["period", "index_value", "base_year", "pct_change_monthly"],
};
const PRESS_RELEASE: SchemaHint = SchemaHint {
    expected_content: "Press release body text with key statistics",
    table: TableKind::ReviewInsights,
    fields: &["topic", "key_figures", "summary"],
};
const PERIODIC_REVIEW: SchemaHint = SchemaHint {
    expected_content: "Real estate periodic review with market analysis and statistics",
    table: TableKind::ReviewInsights,
    fields: &["topic", "key_figures", "summary", "extracted_text"],
};
const STATISTICAL_TABLE: SchemaHint = SchemaHint {
    expected_content: "Government statistical data table",
    table: TableKind::ReviewInsights,
    fields: &["topic", "key_figures", "summary", "extracted_text"],
};

/// `10_YY_NNNb.` press-release body.
fn is_press_release_body(name: &str) -> bool {
    name.match_indices("10_").any(|(start, _)| {
        let rest = name[start + 3..].as_bytes();
        rest.len() >= 8
            && rest[..2].iter().all(u8::is_ascii_digit)
            && rest[2] == b'_'
            && rest[3..6].iter().all(u8::is_ascii_digit)
            && rest[6] == b'b'
            && rest[7] == b'.'
    })
}

pub fn schema_hint(file: &FileRecord) -> SchemaHint {
    let name = file.filename.to_lowercase();
    if name.contains("aa2_1") {
        NATIONAL_INDEX
    } else if name.contains("aa2_2") {
        AVERAGE_PRICES
    } else if name.contains("aa2_3") {
        DISTRICT_INDEX
    } else if name.contains("aa2_4") {
        NEW_DWELLINGS_INDEX
    } else if is_press_release_body(&name) {
        PRESS_RELEASE
    } else if file
        .publication_id
        .starts_with(SourceId::GovIlReviews.publication_prefix())
    {
        PERIODIC_REVIEW
    } else {
        STATISTICAL_TABLE
    }
}

/// Rows parsed in process for one file, not yet stored.
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub file: FileRecord,
    pub tables: Vec<TableRows>,
}

#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub extracted: Vec<ExtractedFile>,
    pub requests: Vec<String>,
    pub errors: Vec<PipelineError>,
}

#[derive(Debug, Default)]
pub struct StoreOutcome {
    pub files_extracted: u32,
    pub rows_inserted: usize,
    pub errors: Vec<PipelineError>,
}

fn extraction_error(file: &FileRecord, message: impl Into<String>) -> PipelineError {
    PipelineError::new(Phase::Extraction, message).with_file(file.filename.clone())
}

/// Splits pending files between in-process extractors and durable requests
/// for the external worker.
#[derive(Debug)]
pub struct ExtractionRouter {
    registry: ExtractorRegistry,
}

impl ExtractionRouter {
    /// Fails unless every in-process format has an extractor.
    pub fn new(registry: ExtractorRegistry) -> Result<Self> {
        let missing = registry.missing(&IN_PROCESS_FORMATS);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(FileFormat::as_str).collect();
            bail!("no extractor registered for {}", names.join(", "));
        }
        Ok(Self { registry })
    }

    pub fn standard() -> Result<Self> {
        Self::new(ExtractorRegistry::standard())
    }

    pub async fn route(
        &self,
        ctx: &mut RunContext,
        blobs: &dyn BlobStore,
        records: &dyn RecordStore,
        files: &[FileRecord],
    ) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        for file in files
            .iter()
            .filter(|file| file.extraction_status == ExtractionStatus::Pending)
        {
            match route_for(file.format) {
                Route::InProcess => match self.extract_in_process(blobs, file).await {
                    Ok(tables) if tables.is_empty() => {
                        debug!(file = %file.id, "extractor produced no rows");
                    }
                    Ok(tables) => outcome.extracted.push(ExtractedFile {
                        file: file.clone(),
                        tables,
                    }),
                    Err(message) => {
                        warn!(file = %file.id, error = %message, "extraction failed");
                        outcome.errors.push(extraction_error(file, message));
                    }
                },
                Route::External => match request_extraction(ctx, blobs, records, file).await {
                    Ok(request_id) => outcome.requests.push(request_id),
                    Err(message) => {
                        warn!(file = %file.id, error = %message, "extraction request failed");
                        outcome.errors.push(extraction_error(file, message));
                    }
                },
                Route::Skip => {
                    info!(file = %file.id, format = %file.format, "no extraction route; skipping");
                }
            }
        }

        outcome
    }

    async fn extract_in_process(
        &self,
        blobs: &dyn BlobStore,
        file: &FileRecord,
    ) -> Result<Vec<TableRows>, String> {
        let extractor = self
            .registry
            .get(file.format)
            .ok_or_else(|| format!("no extractor for {}", file.format))?;
        let body = blobs
            .get(&file.storage_key)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("file not found in storage: {}", file.storage_key))?;
        debug!(file = %file.id, extractor = extractor.name(), "extracting in process");
        extractor.extract(file, &body).map_err(|err| err.to_string())
    }
}

async fn request_extraction(
    ctx: &mut RunContext,
    blobs: &dyn BlobStore,
    records: &dyn RecordStore,
    file: &FileRecord,
) -> Result<String, String> {
    let request_id = ctx.next_request_id();
    let hint = schema_hint(file);
    let request = ExtractionRequest {
        request_id: request_id.clone(),
        run_id: ctx.run_id().to_string(),
        source: SourceId::from_publication_id(&file.publication_id)
            .map(|source| source.to_string())
            .unwrap_or_else(|| "external".to_string()),
        publication_id: file.publication_id.clone(),
        file: RequestedFile {
            storage_key: file.storage_key.clone(),
            original_url: file.download_url.clone(),
            format: file.format,
            expected_content: hint.expected_content.to_string(),
        },
        extraction_schema: ExtractionSchema {
            table: hint.table,
            fields: hint.fields.iter().map(|f| f.to_string()).collect(),
        },
        created_at: Utc::now(),
    };

    write_json(blobs, &request_key(&request_id), &request)
        .await
        .map_err(|err| err.to_string())?;
    records
        .set_extraction_status(&file.id, ExtractionStatus::PendingExtraction, Some(&request_id))
        .await
        .map_err(|err| err.to_string())?;
    info!(file = %file.id, %request_id, "extraction request written");
    Ok(request_id)
}

/// Validate and insert in-process rows, then mark each fully stored file
/// `extracted`.
pub async fn persist_extracted(records: &dyn RecordStore, extracted: Vec<ExtractedFile>) -> StoreOutcome {
    let mut outcome = StoreOutcome::default();

    for ExtractedFile { file, tables } in extracted {
        let mut failed = false;
        for mut rows in tables {
            rows.fill_ids(&file.publication_id, &file.id);
            for reason in rows.retain_valid() {
                warn!(file = %file.id, table = %rows.kind(), %reason, "dropping invalid row");
            }
            if rows.is_empty() {
                continue;
            }
            match records.insert_rows(&rows).await {
                Ok(inserted) => outcome.rows_inserted += inserted,
                Err(err) => {
                    failed = true;
                    outcome.errors.push(
                        PipelineError::new(Phase::Store, err.to_string()).with_file(file.id.clone()),
                    );
                }
            }
        }
        if failed {
            continue;
        }

        match records
            .set_extraction_status(&file.id, ExtractionStatus::Extracted, None)
            .await
        {
            Ok(()) => outcome.files_extracted += 1,
            Err(err) => outcome.errors.push(
                PipelineError::new(Phase::Store, err.to_string()).with_file(file.id.clone()),
            ),
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{file_record, SAMPLE_CPI_XML};
    use tabula_storage::{read_json, BlobMetadata, MemoryBlobStore, MemoryRecordStore};

    async fn stored(
        blobs: &MemoryBlobStore,
        records: &MemoryRecordStore,
        publication_id: &str,
        filename: &str,
        body: &[u8],
    ) -> FileRecord {
        let file = file_record(publication_id, filename);
        blobs
            .put(&file.storage_key, body, &BlobMetadata::new())
            .await
            .unwrap();
        records.insert_file(&file).await.unwrap();
        file
    }

    fn named(publication_id: &str, filename: &str) -> SchemaHint {
        schema_hint(&file_record(publication_id, filename))
    }

    #[test]
    fn schema_hints_follow_the_filename_table() {
        assert_eq!(named("cbs-pub-2026-a", "aa2_1_h.pdf"), NATIONAL_INDEX);
        assert_eq!(named("cbs-pub-2026-a", "AA2_2_e.pdf"), AVERAGE_PRICES);
        assert_eq!(named("cbs-pub-2026-a", "aa2_3_h.pdf"), DISTRICT_INDEX);
        assert_eq!(named("cbs-pub-2026-a", "aa2_4_h.pdf"), NEW_DWELLINGS_INDEX);
        assert_eq!(named("cbs-media-2026-012", "10_26_012b.pdf"), PRESS_RELEASE);
        assert_eq!(named("cbs-media-2026-012", "10_26_012t.pdf"), STATISTICAL_TABLE);
        assert_eq!(named("gov-il-review-3", "review.pdf"), PERIODIC_REVIEW);
        assert_eq!(named("cbs-pub-2026-a", "notes.doc"), STATISTICAL_TABLE);
    }

    #[test]
    fn every_format_has_a_route() {
        for format in FileFormat::ALL {
            let route = route_for(format);
            assert_eq!(route == Route::InProcess, IN_PROCESS_FORMATS.contains(&format));
        }
        assert_eq!(route_for(FileFormat::Doc), Route::External);
        assert_eq!(route_for(FileFormat::Xls), Route::External);
        assert_eq!(route_for(FileFormat::Zip), Route::Skip);
    }

    #[test]
    fn incomplete_registry_is_rejected_at_startup() {
        let err = ExtractionRouter::new(ExtractorRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("xlsx"));
        assert!(ExtractionRouter::standard().is_ok());
    }

    #[tokio::test]
    async fn documents_become_numbered_durable_requests() {
        let blobs = MemoryBlobStore::new();
        let records = MemoryRecordStore::new();
        let pdf = stored(&blobs, &records, "gov-il-review-3", "review.pdf", b"%PDF").await;
        let doc = stored(&blobs, &records, "cbs-pub-2026-a", "aa2_2_h.doc", b"doc").await;

        let mut ctx = RunContext::new("2026-03-01-ab12cd34");
        let router = ExtractionRouter::standard().unwrap();
        let outcome = router
            .route(&mut ctx, &blobs, &records, &[pdf.clone(), doc.clone()])
            .await;

        assert!(outcome.errors.is_empty());
        assert_eq!(
            outcome.requests,
            vec!["req-2026-03-01-ab12cd34-001", "req-2026-03-01-ab12cd34-002"]
        );

        let request: ExtractionRequest = read_json(&blobs, &request_key("req-2026-03-01-ab12cd34-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.run_id, "2026-03-01-ab12cd34");
        assert_eq!(request.source, "gov-il-reviews");
        assert_eq!(request.file.storage_key, pdf.storage_key);
        assert_eq!(request.extraction_schema.table, TableKind::ReviewInsights);

        let second: ExtractionRequest = read_json(&blobs, &request_key("req-2026-03-01-ab12cd34-002"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.extraction_schema.table, TableKind::AvgApartmentPrices);
        assert_eq!(second.file.format, FileFormat::Doc);

        let updated = records.file(&pdf.id).unwrap();
        assert_eq!(updated.extraction_status, ExtractionStatus::PendingExtraction);
        assert_eq!(
            updated.extraction_request_id.as_deref(),
            Some("req-2026-03-01-ab12cd34-001")
        );
    }

    #[tokio::test]
    async fn legacy_workbooks_are_sent_to_the_worker() {
        let blobs = MemoryBlobStore::new();
        let records = MemoryRecordStore::new();
        let biff = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1rest";
        let xls = stored(&blobs, &records, "cbs-pub-2026-price02aa", "aa2_1_h.xls", biff).await;

        let mut ctx = RunContext::new("2026-03-01-ab12cd34");
        let outcome = ExtractionRouter::standard()
            .unwrap()
            .route(&mut ctx, &blobs, &records, &[xls.clone()])
            .await;

        assert!(outcome.errors.is_empty());
        assert!(outcome.extracted.is_empty());
        assert_eq!(outcome.requests, vec!["req-2026-03-01-ab12cd34-001"]);

        let request: ExtractionRequest = read_json(&blobs, &request_key("req-2026-03-01-ab12cd34-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.file.format, FileFormat::Xls);
        assert_eq!(request.extraction_schema.table, TableKind::HousingPriceIndex);
        assert_eq!(request.file.expected_content, NATIONAL_INDEX.expected_content);
        assert_eq!(
            records.file(&xls.id).unwrap().extraction_status,
            ExtractionStatus::PendingExtraction
        );
    }

    #[tokio::test]
    async fn in_process_rows_are_stored_and_files_marked() {
        let blobs = MemoryBlobStore::new();
        let records = MemoryRecordStore::new();
        let xml = stored(
            &blobs,
            &records,
            "cbs-xml-api-2026-ינואר",
            "price_selected_2026-02-15.xml",
            SAMPLE_CPI_XML.as_bytes(),
        )
        .await;

        let mut ctx = RunContext::new("run");
        let router = ExtractionRouter::standard().unwrap();
        let outcome = router.route(&mut ctx, &blobs, &records, &[xml.clone()]).await;
        assert!(outcome.errors.is_empty());
        assert!(outcome.requests.is_empty());
        assert_eq!(outcome.extracted.len(), 1);
        assert_eq!(records.file(&xml.id).unwrap().extraction_status, ExtractionStatus::Pending);

        let stored = persist_extracted(&records, outcome.extracted).await;
        assert!(stored.errors.is_empty());
        assert_eq!(stored.files_extracted, 1);
        assert_eq!(stored.rows_inserted, 2);
        assert_eq!(records.row_count(TableKind::ConsumerPriceIndex), 2);
        assert_eq!(records.file(&xml.id).unwrap().extraction_status, ExtractionStatus::Extracted);
    }

    #[tokio::test]
    async fn skipped_missing_and_non_pending_files() {
        let blobs = MemoryBlobStore::new();
        let records = MemoryRecordStore::new();
        let zip = stored(&blobs, &records, "cbs-pub-2026-a", "bundle.zip", b"PK").await;
        let missing = file_record("cbs-pub-2026-a", "aa2_1_h.xlsx");
        let mut done = file_record("cbs-pub-2026-a", "old.pdf");
        done.extraction_status = ExtractionStatus::NotNeeded;

        let mut ctx = RunContext::new("run");
        let router = ExtractionRouter::standard().unwrap();
        let outcome = router
            .route(&mut ctx, &blobs, &records, &[zip.clone(), missing, done])
            .await;

        assert!(outcome.requests.is_empty());
        assert!(outcome.extracted.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].phase, Phase::Extraction);
        assert!(outcome.errors[0].error_message.contains("not found in storage"));
        assert_eq!(records.file(&zip.id).unwrap().extraction_status, ExtractionStatus::Pending);
        assert_eq!(ctx.requests_issued(), 0);
    }
}
