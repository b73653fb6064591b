//! Price-index XML published by the CBS index API:
//!
//! ```xml
//! <indices>
//!   <date year="2026" month="ינואר">
//!     <code code="120010">
//!       <name>מדד המחירים לצרכן - כללי</name>
//!       <percent>-0.3</percent>
//!       <index base="2024 ממוצע">103.3</index>
//!       <index base="2020 ממוצע" chainingCoefficient="1.059">117.49</index>
//!     </code>
//!   </date>
//! </indices>
//! ```

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tabula_core::{ConsumerPriceIndexRow, FileFormat, FileRecord, TableRows, DEFAULT_BASE_YEAR};

use super::ooxml::attribute;
use super::{ContentExtractor, ExtractError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpiPeriod {
    pub year: String,
    pub month: String,
}

impl CpiPeriod {
    /// `year-month`, the month kept as published.
    pub fn label(&self) -> String {
        format!("{}-{}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpiIndex {
    pub code: String,
    pub name: String,
    pub percent: Option<f64>,
    /// `(base label, value)` in document order.
    pub values: Vec<(String, f64)>,
}

impl CpiIndex {
    /// Value on the preferred base year when published, else the first one.
    pub fn chosen_value(&self) -> Option<(f64, i32)> {
        if let Some((_, value)) = self
            .values
            .iter()
            .find(|(base, _)| base_year(base) == Some(DEFAULT_BASE_YEAR))
        {
            return Some((*value, DEFAULT_BASE_YEAR));
        }
        self.values
            .first()
            .map(|(base, value)| (*value, base_year(base).unwrap_or(DEFAULT_BASE_YEAR)))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpiSnapshot {
    /// Period of the first `<date>` element.
    pub period: Option<CpiPeriod>,
    pub indices: Vec<CpiIndex>,
}

fn base_year(base: &str) -> Option<i32> {
    let digits: String = base
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn read_period(element: &BytesStart<'_>) -> Result<Option<CpiPeriod>, ExtractError> {
    let year = attribute(element, "year")?;
    let month = attribute(element, "month")?;
    Ok(match (year, month) {
        (Some(year), Some(month)) if !year.is_empty() && !month.is_empty() => {
            Some(CpiPeriod { year, month })
        }
        _ => None,
    })
}

enum Field {
    Name,
    Percent,
    Index(String),
}

pub fn parse_snapshot(xml: &str) -> Result<CpiSnapshot, ExtractError> {
    let mut reader = Reader::from_str(xml.trim_start_matches('\u{feff}'));
    reader.config_mut().trim_text(true);

    let mut snapshot = CpiSnapshot::default();
    let mut current: Option<CpiIndex> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"date" if snapshot.period.is_none() => snapshot.period = read_period(&element)?,
                b"code" => {
                    current = Some(CpiIndex {
                        code: attribute(&element, "code")?.unwrap_or_default(),
                        ..CpiIndex::default()
                    });
                }
                b"name" if current.is_some() => field = Some(Field::Name),
                b"percent" if current.is_some() => field = Some(Field::Percent),
                b"index" if current.is_some() => {
                    field = Some(Field::Index(
                        attribute(&element, "base")?.unwrap_or_default(),
                    ));
                }
                _ => {}
            },
            Event::Empty(element)
                if element.local_name().as_ref() == b"date" && snapshot.period.is_none() =>
            {
                snapshot.period = read_period(&element)?;
            }
            Event::Text(chunk) if field.is_some() => text.push_str(&chunk.unescape()?),
            Event::CData(chunk) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&chunk));
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"code" => {
                    if let Some(index) = current.take() {
                        snapshot.indices.push(index);
                    }
                }
                b"name" | b"percent" | b"index" => {
                    if let (Some(done), Some(index)) = (field.take(), current.as_mut()) {
                        let value = text.trim();
                        match done {
                            Field::Name => index.name = value.to_string(),
                            Field::Percent => index.percent = value.parse().ok(),
                            Field::Index(base) => {
                                if let Ok(parsed) = value.parse::<f64>() {
                                    index.values.push((base, parsed));
                                }
                            }
                        }
                    }
                    text.clear();
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(snapshot)
}

/// Rows for every index that carries a usable value; empty when the document
/// has no period header.
pub fn cpi_rows(
    snapshot: &CpiSnapshot,
    publication_id: &str,
    file_id: &str,
) -> Vec<ConsumerPriceIndexRow> {
    let Some(period) = &snapshot.period else {
        return Vec::new();
    };
    let period = period.label();

    snapshot
        .indices
        .iter()
        .filter(|index| !index.code.is_empty())
        .filter_map(|index| {
            let (index_value, base_year) = index.chosen_value()?;
            Some(ConsumerPriceIndexRow {
                publication_id: publication_id.to_string(),
                file_id: file_id.to_string(),
                period: period.clone(),
                index_code: index.code.clone(),
                index_name_he: Some(index.name.clone()).filter(|name| !name.is_empty()),
                index_name_en: None,
                index_value,
                base_year,
                pct_change_monthly: index.percent,
                pct_change_annual: None,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpiXmlExtractor;

impl ContentExtractor for CpiXmlExtractor {
    fn name(&self) -> &'static str {
        "cpi-xml"
    }

    fn formats(&self) -> &'static [FileFormat] {
        &[FileFormat::Xml]
    }

    fn extract(&self, file: &FileRecord, body: &[u8]) -> Result<Vec<TableRows>, ExtractError> {
        let xml = std::str::from_utf8(body).map_err(|_| ExtractError::Encoding)?;
        let rows = cpi_rows(&parse_snapshot(xml)?, &file.publication_id, &file.id);
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![TableRows::ConsumerPriceIndex(rows)])
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<indices UpdateDate="15/02/2026">
  <date year="2026" month="ינואר">
    <code code="120010">
      <name>מדד המחירים לצרכן - כללי</name>
      <percent>-0.3</percent>
      <index base="2024 ממוצע">103.3</index>
      <index base="2020 ממוצע" chainingCoefficient="1.059">117.49</index>
    </code>
    <code code="120460">
      <name>דיור</name>
      <percent>0.4</percent>
      <index base="2024 ממוצע">104.1</index>
    </code>
    <code code="999999">
      <name>ללא ערך</name>
      <index base="2024 ממוצע">n/a</index>
    </code>
  </date>
</indices>"#;
