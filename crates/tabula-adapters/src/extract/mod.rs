//! In-process extraction for formats that can be parsed without the external
//! worker: Office Open XML workbooks and documents, and the price-index XML.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tabula_core::{FileFormat, FileRecord, TableRows};
use thiserror::Error;

pub mod cpi_xml;
mod docx;
mod ooxml;
mod spreadsheet;

pub use cpi_xml::CpiXmlExtractor;
pub use docx::DocxExtractor;
pub use spreadsheet::{SheetLayout, SpreadsheetExtractor};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unreadable container: {0}")]
    Container(#[from] zip::result::ZipError),
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed xml attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing document part `{0}`")]
    MissingPart(String),
    #[error("payload is not valid utf-8")]
    Encoding,
    #[error("workbook is not an OOXML package")]
    NotOoxml,
}

/// Turns the archived bytes of one file into structured row batches. An empty
/// result means nothing recognisable was found.
pub trait ContentExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn formats(&self) -> &'static [FileFormat];

    fn extract(&self, file: &FileRecord, body: &[u8]) -> Result<Vec<TableRows>, ExtractError>;
}

#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_format: HashMap<FileFormat, Arc<dyn ContentExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SpreadsheetExtractor));
        registry.register(Arc::new(CpiXmlExtractor));
        registry.register(Arc::new(DocxExtractor));
        registry
    }

    /// Later registrations replace earlier ones for the same format.
    pub fn register(&mut self, extractor: Arc<dyn ContentExtractor>) {
        for format in extractor.formats() {
            self.by_format.insert(*format, Arc::clone(&extractor));
        }
    }

    pub fn get(&self, format: FileFormat) -> Option<&dyn ContentExtractor> {
        self.by_format.get(&format).map(|extractor| extractor.as_ref())
    }

    /// Formats from `required` that no extractor handles.
    pub fn missing(&self, required: &[FileFormat]) -> Vec<FileFormat> {
        required
            .iter()
            .copied()
            .filter(|format| !self.by_format.contains_key(format))
            .collect()
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self
            .by_format
            .iter()
            .map(|(format, extractor)| (format.as_str(), extractor.name()))
            .collect();
        entries.sort();
        f.debug_map().entries(entries).finish()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use tabula_core::{ExtractionStatus, FileFormat, FileRecord};

    pub fn file_record(publication_id: &str, filename: &str) -> FileRecord {
        FileRecord {
            id: tabula_core::file_id(publication_id, filename),
            publication_id: publication_id.to_string(),
            filename: filename.to_string(),
            format: FileFormat::from_filename(filename),
            download_url: format!("https://example.test/{filename}"),
            storage_key: format!("raw-files/test/{filename}"),
            file_size_bytes: 0,
            checksum_sha256: String::new(),
            is_preferred_format: true,
            extraction_status: ExtractionStatus::Pending,
            extraction_request_id: None,
        }
    }
}
