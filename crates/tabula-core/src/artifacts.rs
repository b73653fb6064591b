//! Durable handoff artifacts exchanged with the out-of-process extractor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{FileFormat, TableKind};

pub const REQUESTS_PREFIX: &str = "pipeline/extraction-requests/";
pub const RESULTS_PREFIX: &str = "pipeline/extracted/";

pub fn request_key(request_id: &str) -> String {
    format!("{REQUESTS_PREFIX}{request_id}.json")
}

pub fn result_key(request_id: &str) -> String {
    format!("{RESULTS_PREFIX}{request_id}.json")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedFile {
    pub storage_key: String,
    pub original_url: String,
    pub format: FileFormat,
    pub expected_content: String,
}

/// Hint telling the extractor which table shape to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    #[serde(rename = "type")]
    pub table: TableKind,
    pub fields: Vec<String>,
}

/// Write-once work order for the external extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub request_id: String,
    pub run_id: String,
    pub source: String,
    pub publication_id: String,
    pub file: RequestedFile,
    pub extraction_schema: ExtractionSchema,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    ExtractionFailed,
    Partial,
}

text_enum!(ResultStatus {
    Success => "success",
    ExtractionFailed => "extraction_failed",
    Partial => "partial",
});

impl ResultStatus {
    pub fn carries_rows(&self) -> bool {
        matches!(self, ResultStatus::Success | ResultStatus::Partial)
    }
}

/// Asynchronous answer deposited by the extractor; consumed exactly once by
/// pickup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub request_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub data: Vec<Map<String, Value>>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub extraction_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_processed: Option<u32>,
    #[serde(default)]
    pub processed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_keys_live_under_pipeline_prefixes() {
        assert_eq!(
            request_key("req-2026-03-01-ab12cd34-001"),
            "pipeline/extraction-requests/req-2026-03-01-ab12cd34-001.json"
        );
        assert_eq!(result_key("req-x-002"), "pipeline/extracted/req-x-002.json");
    }

    #[test]
    fn worker_result_parses_with_optional_fields_missing() {
        let result: ExtractionResult = serde_json::from_value(serde_json::json!({
            "request_id": "req-x-001",
            "status": "extraction_failed",
            "error_details": "pdf had no text layer"
        }))
        .unwrap();
        assert_eq!(result.status, ResultStatus::ExtractionFailed);
        assert!(!result.status.carries_rows());
        assert!(result.data.is_empty());
        assert_eq!(result.pages_processed, None);
    }

    #[test]
    fn schema_hint_serializes_type_field() {
        let schema = ExtractionSchema {
            table: TableKind::AvgApartmentPrices,
            fields: vec!["district".into()],
        };
        let value = serde_json::to_value(&schema).unwrap();
        assert_eq!(value["type"], "avg_apartment_prices");
    }
}
