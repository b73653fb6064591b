use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FileFormat, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    Discovered,
    Downloading,
    Downloaded,
    Extracting,
    Extracted,
    Failed,
}

text_enum!(PublicationStatus {
    Discovered => "discovered",
    Downloading => "downloading",
    Downloaded => "downloaded",
    Extracting => "extracting",
    Extracted => "extracted",
    Failed => "failed",
});

/// A logical release that groups one or more files. First writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub id: String,
    pub source_id: SourceId,
    pub title: Option<String>,
    pub title_en: Option<String>,
    pub publish_date: Option<String>,
    pub discovery_url: Option<String>,
    pub raw_metadata: Value,
    pub status: PublicationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    PendingExtraction,
    Extracted,
    Failed,
    NotNeeded,
}

text_enum!(ExtractionStatus {
    Pending => "pending",
    PendingExtraction => "pending_extraction",
    Extracted => "extracted",
    Failed => "failed",
    NotNeeded => "not_needed",
});

impl ExtractionStatus {
    pub fn for_preference(is_preferred: bool) -> Self {
        if is_preferred {
            ExtractionStatus::Pending
        } else {
            ExtractionStatus::NotNeeded
        }
    }
}

/// Ledger row for one archived binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// `publication_id:filename`
    pub id: String,
    pub publication_id: String,
    pub filename: String,
    pub format: FileFormat,
    pub download_url: String,
    pub storage_key: String,
    pub file_size_bytes: u64,
    pub checksum_sha256: String,
    pub is_preferred_format: bool,
    pub extraction_status: ExtractionStatus,
    pub extraction_request_id: Option<String>,
}
