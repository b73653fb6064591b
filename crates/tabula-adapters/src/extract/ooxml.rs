use std::io::{Cursor, Read};

use quick_xml::events::BytesStart;
use zip::result::ZipError;
use zip::ZipArchive;

use super::ExtractError;

/// Read access to the XML parts of an Office Open XML package.
pub(crate) struct OoxmlPackage<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
}

impl<'a> OoxmlPackage<'a> {
    pub fn open(bytes: &'a [u8]) -> Result<Self, ExtractError> {
        Ok(Self {
            archive: ZipArchive::new(Cursor::new(bytes))?,
        })
    }

    pub fn part(&mut self, name: &str) -> Result<Option<String>, ExtractError> {
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        Ok(Some(text.trim_start_matches('\u{feff}').to_string()))
    }

    pub fn part_names(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_string).collect()
    }
}

pub(crate) fn looks_like_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
}

pub(crate) fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, ExtractError> {
    Ok(match element.try_get_attribute(name)? {
        Some(attr) => Some(attr.unescape_value()?.into_owned()),
        None => None,
    })
}

#[cfg(test)]
pub(crate) fn zip_parts(parts: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in parts {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_read_by_name_and_missing_parts_are_none() {
        let bytes = zip_parts(&[("word/document.xml", "\u{feff}<w:document/>")]);
        assert!(looks_like_zip(&bytes));
        let mut package = OoxmlPackage::open(&bytes).unwrap();
        assert_eq!(
            package.part("word/document.xml").unwrap().as_deref(),
            Some("<w:document/>")
        );
        assert_eq!(package.part("xl/workbook.xml").unwrap(), None);
        assert_eq!(package.part_names(), vec!["word/document.xml".to_string()]);
    }

    #[test]
    fn non_zip_bytes_are_rejected() {
        assert!(!looks_like_zip(b"\xD0\xCF\x11\xE0legacy"));
        assert!(matches!(
            OoxmlPackage::open(b"not a zip"),
            Err(ExtractError::Container(_))
        ));
    }
}
