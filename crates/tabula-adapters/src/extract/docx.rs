use std::sync::LazyLock;

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde_json::Value;
use tabula_core::{FileFormat, FileRecord, ReviewInsightRow, TableRows};
use tracing::warn;

use super::ooxml::OoxmlPackage;
use super::{ContentExtractor, ExtractError};

const DOCUMENT_PART: &str = "word/document.xml";
const SUMMARY_CHARS: usize = 500;
const FIGURES_PER_KIND: usize = 10;
const TEXT_CONFIDENCE: f64 = 0.7;

static PERCENTAGES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\d.,]+\s*%").expect("valid regex"));
static SHEKEL_AMOUNTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"₪\s*[\d,]+(?:\.\d+)?").expect("valid regex"));
static GROUPED_NUMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?:,\d{3})+(?:\.\d+)?\b").expect("valid regex"));

/// Paragraph text of a WordprocessingML body, one line per paragraph.
fn paragraphs(xml: &str) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(element) => match element.name().as_ref() {
                b"w:p" => depth += 1,
                b"w:t" if depth > 0 => in_text = true,
                _ => {}
            },
            Event::Text(chunk) if in_text => current.push_str(&chunk.unescape()?),
            Event::End(element) => match element.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" if depth > 0 => {
                    depth -= 1;
                    if depth == 0 && !current.is_empty() {
                        paragraphs.push(std::mem::take(&mut current));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(paragraphs)
}

/// Percentages, shekel amounts and grouped numbers, first occurrence order.
pub(crate) fn key_figures(text: &str) -> Vec<String> {
    let mut figures: Vec<String> = Vec::new();
    for pattern in [&*PERCENTAGES, &*SHEKEL_AMOUNTS, &*GROUPED_NUMBERS] {
        for found in pattern.find_iter(text).take(FIGURES_PER_KIND) {
            let figure = found.as_str().to_string();
            if !figures.contains(&figure) {
                figures.push(figure);
            }
        }
    }
    figures
}

pub(crate) fn infer_topic(filename: &str, text: &str) -> &'static str {
    let name = filename.to_lowercase();
    if name.contains("price") || name.contains("מחיר") {
        return "Housing Prices";
    }
    if name.contains("madad") || name.contains("מדד") {
        return "Price Index";
    }
    if name.contains("review") || name.contains("סקירה") {
        return "Market Review";
    }

    let opening: String = text.chars().take(SUMMARY_CHARS).collect::<String>().to_lowercase();
    if opening.contains("דירות") || opening.contains("apartment") {
        "Housing"
    } else if opening.contains("מדד") || opening.contains("index") {
        "Price Index"
    } else if opening.contains("נדל\"ן") || opening.contains("real estate") {
        "Real Estate"
    } else {
        "Government Publication"
    }
}

/// Narrative documents: one review-insight row carrying the full text, a
/// short summary and the notable figures found in it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocxExtractor;

impl ContentExtractor for DocxExtractor {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn formats(&self) -> &'static [FileFormat] {
        &[FileFormat::Docx]
    }

    fn extract(&self, file: &FileRecord, body: &[u8]) -> Result<Vec<TableRows>, ExtractError> {
        let mut package = OoxmlPackage::open(body)?;
        let Some(document) = package.part(DOCUMENT_PART)? else {
            warn!(file = %file.id, "document has no main part");
            return Err(ExtractError::MissingPart(DOCUMENT_PART.to_string()));
        };

        let text = paragraphs(&document)?.join("\n");
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let figures = key_figures(&text);
        let summary: String = text.chars().take(SUMMARY_CHARS).collect();
        let row = ReviewInsightRow {
            publication_id: file.publication_id.clone(),
            file_id: file.id.clone(),
            topic: Some(infer_topic(&file.filename, &text).to_string()),
            key_figures: (!figures.is_empty()).then(|| Value::from(figures).to_string()),
            summary: Some(summary.trim().to_string()),
            extracted_text: Some(text),
            confidence: Some(TEXT_CONFIDENCE),
        };
        Ok(vec![TableRows::ReviewInsights(vec![row])])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::fixtures::file_record;
    use crate::extract::ooxml::zip_parts;

    fn document(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        )
    }

    #[test]
    fn paragraphs_join_runs_and_skip_empty_ones() {
        let xml = document(
            r#"<w:p><w:r><w:t>מחירי </w:t></w:r><w:r><w:t xml:space="preserve">הדירות עלו</w:t></w:r></w:p>
<w:p><w:pPr/></w:p>
<w:tbl><w:tr><w:tc><w:p><w:r><w:t>תא &amp; טבלה</w:t></w:r></w:p></w:tc></w:tr></w:tbl>"#,
        );
        assert_eq!(
            paragraphs(&xml).unwrap(),
            vec!["מחירי הדירות עלו".to_string(), "תא & טבלה".to_string()]
        );
    }

    #[test]
    fn key_figures_are_deduplicated_in_order() {
        let text = "עלייה של 3.2% ומחיר ממוצע ₪ 2,150,000 ועוד 3.2% ו-1,250 עסקאות";
        assert_eq!(
            key_figures(text),
            vec!["3.2%", "₪ 2,150,000", "2,150,000", "1,250"]
        );
    }

    #[test]
    fn topic_prefers_filename_then_opening_text() {
        assert_eq!(infer_topic("price_review.docx", ""), "Housing Prices");
        assert_eq!(infer_topic("10_26_012b.docx", "מדד המחירים לצרכן"), "Price Index");
        assert_eq!(infer_topic("x.docx", "Apartment sales rose"), "Housing");
        assert_eq!(infer_topic("x.docx", "nothing here"), "Government Publication");
    }

    #[test]
    fn document_becomes_one_review_row() {
        let body = document(
            r#"<w:p><w:r><w:t>סקירת שוק הדירות: עלייה של 1.1% בחודש.</w:t></w:r></w:p>"#,
        );
        let bytes = zip_parts(&[("word/document.xml", &body)]);
        let file = file_record("cbs-media-2026-012", "10_26_012b.docx");

        let tables = DocxExtractor.extract(&file, &bytes).unwrap();
        let [TableRows::ReviewInsights(rows)] = tables.as_slice() else {
            panic!("expected one review batch");
        };
        let row = &rows[0];
        assert_eq!(row.file_id, "cbs-media-2026-012:10_26_012b.docx");
        assert_eq!(row.key_figures.as_deref(), Some(r#"["1.1%"]"#));
        assert_eq!(row.confidence, Some(0.7));
        assert_eq!(row.topic.as_deref(), Some("Housing"));
        assert!(row.summary.as_deref().unwrap().starts_with("סקירת"));
    }

    #[test]
    fn empty_document_yields_nothing_and_missing_part_is_an_error() {
        let file = file_record("gov-il-x", "review.docx");
        let empty = zip_parts(&[("word/document.xml", &document(""))]);
        assert!(DocxExtractor.extract(&file, &empty).unwrap().is_empty());

        let no_body = zip_parts(&[("docProps/app.xml", "<Properties/>")]);
        assert!(matches!(
            DocxExtractor.extract(&file, &no_body),
            Err(ExtractError::MissingPart(_))
        ));
    }
}
