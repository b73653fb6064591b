use std::collections::HashMap;

use tabula_core::{ExtractionStatus, FileRecord};
use tabula_storage::{RecordStore, StoreError};

/// Files waiting on the external worker, keyed by their request id.
#[derive(Debug, Default)]
pub struct PendingIndex {
    by_request: HashMap<String, FileRecord>,
}

impl PendingIndex {
    pub async fn load(records: &dyn RecordStore) -> Result<Self, StoreError> {
        let files = records
            .files_with_status(ExtractionStatus::PendingExtraction)
            .await?;
        Ok(Self::from_files(files))
    }

    pub fn from_files(files: impl IntoIterator<Item = FileRecord>) -> Self {
        let by_request = files
            .into_iter()
            .filter_map(|file| Some((file.extraction_request_id.clone()?, file)))
            .collect();
        Self { by_request }
    }

    pub fn get(&self, request_id: &str) -> Option<&FileRecord> {
        self.by_request.get(request_id)
    }

    pub fn len(&self) -> usize {
        self.by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_request.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::file_record;
    use tabula_storage::MemoryRecordStore;

    #[tokio::test]
    async fn only_files_awaiting_the_worker_are_indexed() {
        let records = MemoryRecordStore::new();
        let waiting = file_record("gov-il-review-3", "review.pdf");
        let fresh = file_record("gov-il-review-3", "appendix.pdf");
        records.insert_file(&waiting).await.unwrap();
        records.insert_file(&fresh).await.unwrap();
        records
            .set_extraction_status(&waiting.id, ExtractionStatus::PendingExtraction, Some("req-r-001"))
            .await
            .unwrap();

        let index = PendingIndex::load(&records).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("req-r-001").unwrap().id, waiting.id);
        assert!(index.get("req-r-002").is_none());
    }

    #[test]
    fn files_without_a_request_id_are_ignored() {
        let mut orphan = file_record("cbs-pub-2026-a", "x.pdf");
        orphan.extraction_status = ExtractionStatus::PendingExtraction;
        assert!(PendingIndex::from_files([orphan]).is_empty());
    }
}
