use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tabula_core::{
    request_key, ExtractionResult, ExtractionStatus, FileRecord, Phase, PipelineError,
    ResultStatus, TableKind, TableRows, RESULTS_PREFIX,
};
use tabula_storage::{read_json, BlobStore, RecordStore};
use tracing::{debug, info, warn};

use crate::pending::PendingIndex;

#[derive(Debug, Default)]
pub struct PickupOutcome {
    /// Result artifacts consumed.
    pub processed: u32,
    pub rows_inserted: usize,
    pub errors: Vec<PipelineError>,
}

fn pickup_error(file: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::new(Phase::Pickup, message).with_file(file)
}

/// Consume every result the external worker has deposited. Safe to re-run:
/// consumed artifacts are deleted.
pub async fn pickup_results(blobs: &dyn BlobStore, records: &dyn RecordStore) -> PickupOutcome {
    let mut outcome = PickupOutcome::default();

    let keys = match blobs.list(RESULTS_PREFIX).await {
        Ok(keys) => keys,
        Err(err) => {
            outcome.errors.push(pickup_error(RESULTS_PREFIX, err.to_string()));
            return outcome;
        }
    };
    if keys.is_empty() {
        debug!("no extraction results waiting");
        return outcome;
    }
    info!(results = keys.len(), "picking up extraction results");

    let index = match PendingIndex::load(records).await {
        Ok(index) => index,
        Err(err) => {
            outcome.errors.push(pickup_error(RESULTS_PREFIX, err.to_string()));
            return outcome;
        }
    };

    for key in keys {
        match consume(blobs, records, &index, &key).await {
            Ok(Some(stored)) => {
                outcome.processed += 1;
                outcome.rows_inserted += stored.rows;
                for failure in stored.failures {
                    outcome.errors.push(pickup_error(&key, failure));
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%key, error = %format!("{err:#}"), "result pickup failed");
                outcome.errors.push(pickup_error(&key, format!("{err:#}")));
            }
        }
    }

    info!(processed = outcome.processed, rows = outcome.rows_inserted, "pickup finished");
    outcome
}

/// Group untyped rows by the table their fields point at, keeping order.
fn classify_rows(data: &[Map<String, Value>]) -> Vec<(TableKind, Vec<Map<String, Value>>)> {
    let mut groups: Vec<(TableKind, Vec<Map<String, Value>>)> = Vec::new();
    for row in data {
        let Some(kind) = TableKind::classify(row) else {
            warn!(fields = ?row.keys().collect::<Vec<_>>(), "unclassifiable result row dropped");
            continue;
        };
        match groups.iter_mut().find(|(existing, _)| *existing == kind) {
            Some((_, rows)) => rows.push(row.clone()),
            None => groups.push((kind, vec![row.clone()])),
        }
    }
    groups
}

/// Rows stored from one result, plus the tables whose insert failed.
#[derive(Debug, Default)]
struct Stored {
    rows: usize,
    failures: Vec<String>,
}

/// Rows that do not decode or validate are dropped with a warning, so a
/// single odd row never holds back the rest of the result.
async fn store_result_rows(
    records: &dyn RecordStore,
    file: &FileRecord,
    result: &ExtractionResult,
) -> Stored {
    let mut stored = Stored::default();
    for (kind, rows) in classify_rows(&result.data) {
        let (mut batch, undecodable) = TableRows::from_json_rows(kind, &rows);
        for reason in undecodable {
            warn!(request_id = %result.request_id, table = %kind, %reason, "dropping undecodable row");
        }
        batch.fill_ids(&file.publication_id, &file.id);
        for reason in batch.retain_valid() {
            warn!(request_id = %result.request_id, table = %kind, %reason, "dropping invalid row");
        }
        if batch.is_empty() {
            continue;
        }
        match records.insert_rows(&batch).await {
            Ok(inserted) => stored.rows += inserted,
            Err(err) => {
                warn!(request_id = %result.request_id, table = %kind, error = %err, "row insert failed");
                stored.failures.push(format!("inserting {kind} rows: {err}"));
            }
        }
    }
    stored
}

/// Consume one result artifact. `None` when the artifact vanished. Once the
/// artifact parses it is always deleted; store failures come back in
/// [`Stored::failures`] and leave the file `failed`.
async fn consume(
    blobs: &dyn BlobStore,
    records: &dyn RecordStore,
    index: &PendingIndex,
    key: &str,
) -> Result<Option<Stored>> {
    let Some(result) = read_json::<ExtractionResult>(blobs, key)
        .await
        .context("reading result artifact")?
    else {
        return Ok(None);
    };
    let file = index.get(&result.request_id);

    let mut stored = Stored::default();
    match (result.status, file) {
        (ResultStatus::Success | ResultStatus::Partial, Some(file)) => {
            stored = store_result_rows(records, file, &result).await;
            let status = if stored.failures.is_empty() {
                ExtractionStatus::Extracted
            } else {
                ExtractionStatus::Failed
            };
            if let Err(err) = records.set_extraction_status(&file.id, status, None).await {
                stored.failures.push(format!("marking file {status}: {err}"));
            }
            info!(request_id = %result.request_id, file = %file.id, rows = stored.rows, %status, "extraction result stored");
        }
        (ResultStatus::ExtractionFailed, Some(file)) => {
            if let Err(err) = records
                .set_extraction_status(&file.id, ExtractionStatus::Failed, None)
                .await
            {
                stored.failures.push(format!("marking file failed: {err}"));
            }
            warn!(
                request_id = %result.request_id,
                file = %file.id,
                details = result.error_details.as_deref().unwrap_or(""),
                "external extraction failed"
            );
        }
        (status, None) => {
            info!(request_id = %result.request_id, %status, "no pending file for result; consuming");
        }
    }

    blobs.delete(key).await.context("deleting result artifact")?;
    if let Err(err) = blobs.delete(&request_key(&result.request_id)).await {
        warn!(request_id = %result.request_id, error = %err, "could not delete request artifact");
    }
    Ok(Some(stored))
}
