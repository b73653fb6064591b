//! Core domain model for the tabula ingestion pipeline.
//!
//! Everything that crosses a crate boundary or a persistence boundary lives
//! here: manifest entries produced by discovery, per-source cursors, the
//! publication and file ledger, the extraction request/result artifacts
//! exchanged with the external worker, run records, and the structured rows
//! that extraction produces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Generates `ALL`, `as_str`, `Display` and `FromStr` for closed enums whose
/// wire form is a fixed string.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::ParseError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($ty::$variant),)+
                    other => Err($crate::ParseError::new(stringify!($ty), other)),
                }
            }
        }
    };
}

mod artifacts;
mod cursor;
mod records;
mod rows;
mod run;

pub use artifacts::{
    request_key, result_key, ExtractionRequest, ExtractionResult, ExtractionSchema,
    RequestedFile, ResultStatus, REQUESTS_PREFIX, RESULTS_PREFIX,
};
pub use cursor::{period_key, period_is_newer, DiscoveryState};
pub use records::{ExtractionStatus, FileRecord, Publication, PublicationStatus};
pub use rows::{
    AvgApartmentPriceRow, ConsumerPriceIndexRow, HousingPriceIndexRow, ReviewInsightRow,
    TableKind, TableRows, DEFAULT_BASE_YEAR,
};
pub use run::{Phase, PipelineError, PipelineRun, RunStatus};

pub const CRATE_NAME: &str = "tabula-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// The upstream portals the pipeline knows how to discover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceId {
    CbsPublications,
    CbsMedia,
    CbsXmlApi,
    GovIlReviews,
}

text_enum!(SourceId {
    CbsPublications => "cbs-publications",
    CbsMedia => "cbs-media",
    CbsXmlApi => "cbs-xml-api",
    GovIlReviews => "gov-il-reviews",
});

impl SourceId {
    /// Prefix every publication id minted by this source starts with.
    pub fn publication_prefix(&self) -> &'static str {
        match self {
            SourceId::CbsPublications => "cbs-pub-",
            SourceId::CbsMedia => "cbs-media-",
            SourceId::CbsXmlApi => "cbs-xml-api-",
            SourceId::GovIlReviews => "gov-il-",
        }
    }

    pub fn from_publication_id(publication_id: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|source| publication_id.starts_with(source.publication_prefix()))
    }
}

/// File formats the pipeline distinguishes. Anything unrecognised is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Xlsx,
    Xls,
    Docx,
    Doc,
    Pdf,
    Zip,
    Xml,
    #[serde(other)]
    Other,
}

impl FileFormat {
    pub const ALL: [FileFormat; 8] = [
        FileFormat::Xlsx,
        FileFormat::Xls,
        FileFormat::Docx,
        FileFormat::Doc,
        FileFormat::Pdf,
        FileFormat::Zip,
        FileFormat::Xml,
        FileFormat::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Xlsx => "xlsx",
            FileFormat::Xls => "xls",
            FileFormat::Docx => "docx",
            FileFormat::Doc => "doc",
            FileFormat::Pdf => "pdf",
            FileFormat::Zip => "zip",
            FileFormat::Xml => "xml",
            FileFormat::Other => "other",
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "xlsx" => FileFormat::Xlsx,
            "xls" => FileFormat::Xls,
            "docx" => FileFormat::Docx,
            "doc" => FileFormat::Doc,
            "pdf" => FileFormat::Pdf,
            "zip" => FileFormat::Zip,
            "xml" => FileFormat::Xml,
            _ => FileFormat::Other,
        }
    }

    pub fn from_filename(filename: &str) -> Self {
        match filename.rsplit_once('.') {
            Some((_, ext)) => Self::from_extension(ext),
            None => FileFormat::Other,
        }
    }

    /// Preference rank among sibling files of the same table; lower wins.
    pub fn priority(&self) -> u8 {
        match self {
            FileFormat::Zip => 0,
            FileFormat::Xlsx | FileFormat::Xml => 1,
            FileFormat::Xls => 2,
            FileFormat::Docx => 3,
            FileFormat::Doc => 4,
            FileFormat::Pdf => 5,
            FileFormat::Other => 99,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, FileFormat::Other)
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileFormat {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_extension(value))
    }
}

/// Filename without its final extension: `table.xlsx` -> `table`.
pub fn base_name(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, ext))
            if !ext.is_empty() && ext.chars().all(|c| c.is_alphanumeric() || c == '_') =>
        {
            stem
        }
        _ => filename,
    }
}

/// Stable file id shared by the ledger and the structured tables.
pub fn file_id(publication_id: &str, filename: &str) -> String {
    format!("{publication_id}:{filename}")
}

fn default_true() -> bool {
    true
}

/// One downloadable file reported by discovery (or posted by an external
/// discovery helper).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source: SourceId,
    pub url: String,
    pub filename: String,
    pub format: FileFormat,
    pub publication_id: String,
    /// ISO-8601 timestamp as reported upstream; may be empty.
    #[serde(default)]
    pub publish_date: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "default_true")]
    pub is_new: bool,
    /// Payload already fetched during discovery; used instead of downloading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_content: Option<String>,
    /// Filename of the container this entry was expanded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_from: Option<String>,
}

impl ManifestEntry {
    pub fn base_name(&self) -> &str {
        base_name(&self.filename)
    }

    pub fn file_id(&self) -> String {
        file_id(&self.publication_id, &self.filename)
    }

    /// Metadata value rendered as text; numbers are formatted, other shapes ignored.
    pub fn metadata_text(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
