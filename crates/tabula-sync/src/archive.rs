use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tabula_core::{
    ExtractionStatus, FileRecord, ManifestEntry, Phase, PipelineError, Publication,
    PublicationStatus, SourceId,
};
use tabula_storage::{BlobMetadata, BlobStore, RecordStore};
use tracing::{debug, info, warn};

use crate::download::DownloadedFile;

#[derive(Debug, Default)]
pub struct ArchiveOutcome {
    /// Records inserted by this call; files archived earlier are not repeated.
    pub records: Vec<FileRecord>,
    pub errors: Vec<PipelineError>,
}

fn segment(entry: &ManifestEntry, key: &str) -> String {
    entry
        .metadata_text(key)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Deterministic blob key for an archived file.
pub fn storage_key(entry: &ManifestEntry) -> String {
    match entry.source {
        SourceId::CbsPublications => format!(
            "raw-files/cbs/publications/{}/{}/{}",
            segment(entry, "year"),
            segment(entry, "folder"),
            entry.filename
        ),
        SourceId::CbsMedia => format!(
            "raw-files/cbs/media-releases/{}/{}/{}",
            segment(entry, "year"),
            segment(entry, "release_number"),
            entry.filename
        ),
        SourceId::CbsXmlApi => format!("raw-files/cbs/api-snapshots/{}", entry.filename),
        SourceId::GovIlReviews => format!(
            "raw-files/gov-il/reviews/{}/{}",
            segment(entry, "url_name"),
            entry.filename
        ),
    }
}

fn publication_for(entry: &ManifestEntry) -> Publication {
    Publication {
        id: entry.publication_id.clone(),
        source_id: entry.source,
        title: entry.metadata_text("title"),
        title_en: entry.metadata_text("title_en"),
        publish_date: Some(entry.publish_date.clone()).filter(|date| !date.is_empty()),
        discovery_url: Some(entry.url.clone()),
        raw_metadata: Value::Object(entry.metadata.clone()),
        status: PublicationStatus::Downloaded,
    }
}

fn archive_error(entry: &ManifestEntry, message: impl Into<String>) -> PipelineError {
    PipelineError::new(Phase::Archive, message)
        .with_source(entry.source.as_str())
        .with_file(entry.filename.clone())
}

/// Write each file to the blob store and record it in the ledger.
pub async fn archive_files(
    blobs: &dyn BlobStore,
    records: &dyn RecordStore,
    files: &[DownloadedFile],
    now: DateTime<Utc>,
) -> ArchiveOutcome {
    let mut outcome = ArchiveOutcome::default();

    let mut seen = HashSet::new();
    for file in files {
        if !seen.insert(file.entry.publication_id.as_str()) {
            continue;
        }
        match records.insert_publication(&publication_for(&file.entry)).await {
            Ok(true) => debug!(publication = %file.entry.publication_id, "publication recorded"),
            Ok(false) => {}
            Err(err) => {
                warn!(publication = %file.entry.publication_id, error = %err, "publication insert failed")
            }
        }
    }

    for file in files {
        let entry = &file.entry;
        let key = storage_key(entry);
        let metadata = BlobMetadata::from([
            ("source".to_string(), entry.source.to_string()),
            ("publication_id".to_string(), entry.publication_id.clone()),
            ("original_url".to_string(), entry.url.clone()),
            ("download_date".to_string(), now.to_rfc3339()),
            ("checksum".to_string(), file.checksum_sha256.clone()),
        ]);

        if let Err(err) = blobs.put(&key, &file.body, &metadata).await {
            warn!(file = %entry.filename, %key, error = %err, "blob write failed");
            outcome.errors.push(archive_error(entry, err.to_string()));
            continue;
        }

        let record = FileRecord {
            id: entry.file_id(),
            publication_id: entry.publication_id.clone(),
            filename: entry.filename.clone(),
            format: entry.format,
            download_url: entry.url.clone(),
            storage_key: key,
            file_size_bytes: file.body.len() as u64,
            checksum_sha256: file.checksum_sha256.clone(),
            is_preferred_format: file.is_preferred_format,
            extraction_status: ExtractionStatus::for_preference(file.is_preferred_format),
            extraction_request_id: None,
        };

        match records.insert_file(&record).await {
            Ok(true) => outcome.records.push(record),
            Ok(false) => debug!(file = %record.id, "file already recorded"),
            Err(err) => {
                warn!(file = %record.id, error = %err, "file insert failed");
                outcome.errors.push(archive_error(entry, err.to_string()));
            }
        }
    }

    info!(archived = outcome.records.len(), total = files.len(), "archive phase finished");
    outcome
}
