//! CBS housing workbooks (`aa2_<table>_<lang>.xlsx`). Only the first sheet is
//! read; the layouts below are positional.

use std::sync::LazyLock;

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tabula_core::{
    AvgApartmentPriceRow, FileFormat, FileRecord, HousingPriceIndexRow, TableRows,
    DEFAULT_BASE_YEAR,
};
use tracing::info;

use super::ooxml::{attribute, looks_like_zip, OoxmlPackage};
use super::{ContentExtractor, ExtractError};

const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const WORKSHEET_PREFIX: &str = "xl/worksheets/sheet";

const DISTRICTS: [&str; 6] = ["Jerusalem", "North", "Haifa", "Center", "Tel Aviv", "South"];
const ROOM_BANDS: [&str; 5] = ["1.5-2", "2.5-3", "3.5-4", "4.5-5", "5+"];

static HOUSING_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^aa2_([1-4])_[he]\.xlsx?$").expect("valid regex"));
static LEADING_FLOAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetLayout {
    /// Table 2.1: period | index | monthly change.
    NationalIndex,
    /// Table 2.2: district headers followed by city rows with one column per room band.
    AveragePrices,
    /// Table 2.3: period | one index column per district.
    DistrictIndex,
    /// Table 2.4: as 2.1, for newly built dwellings.
    NewDwellingsIndex,
}

impl SheetLayout {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_lowercase();
        let table = HOUSING_TABLE.captures(&lower)?.get(1)?.as_str();
        match table {
            "1" => Some(SheetLayout::NationalIndex),
            "2" => Some(SheetLayout::AveragePrices),
            "3" => Some(SheetLayout::DistrictIndex),
            "4" => Some(SheetLayout::NewDwellingsIndex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Number(f64),
    Text(String),
}

type SheetRow = Vec<Option<Cell>>;

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Leading numeric prefix of a text cell, so `"104.2*"` reads as 104.2.
fn parse_leading_float(text: &str) -> Option<f64> {
    LEADING_FLOAT
        .find(text)
        .and_then(|found| found.as_str().trim().parse().ok())
}

fn cell_text(cell: Option<&Option<Cell>>) -> String {
    match cell {
        Some(Some(Cell::Number(n))) => format_number(*n),
        Some(Some(Cell::Text(s))) => s.trim().to_string(),
        _ => String::new(),
    }
}

fn cell_number(cell: Option<&Option<Cell>>) -> Option<f64> {
    match cell? {
        Some(Cell::Number(n)) => Some(*n),
        Some(Cell::Text(s)) => parse_leading_float(s),
        None => None,
    }
}

/// Zero-based column index from a cell reference such as `AB12`.
fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(u8::is_ascii_alphabetic)
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let index = letters
        .iter()
        .fold(0usize, |acc, b| acc * 26 + usize::from(b - b'A' + 1));
    Some(index - 1)
}

fn shared_strings(xml: &str) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                }
                b"t" if in_item => in_text = true,
                _ => {}
            },
            Event::Empty(element) if element.local_name().as_ref() == b"si" => {
                strings.push(String::new());
            }
            Event::Text(chunk) if in_text => current.push_str(&chunk.unescape()?),
            Event::End(element) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    in_item = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(strings)
}

struct PendingCell {
    column: usize,
    kind: Option<String>,
    raw: String,
}

fn finish_cell(pending: PendingCell, strings: &[String], row: &mut SheetRow) {
    let raw = pending.raw;
    let cell = match pending.kind.as_deref() {
        Some("s") => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|idx| strings.get(idx))
            .map(|s| Cell::Text(s.clone())),
        Some("inlineStr") | Some("str") => Some(Cell::Text(raw)),
        Some("e") => None,
        _ if raw.trim().is_empty() => None,
        _ => Some(match raw.trim().parse::<f64>() {
            Ok(n) => Cell::Number(n),
            Err(_) => Cell::Text(raw),
        }),
    };
    if let Some(cell) = cell {
        if row.len() <= pending.column {
            row.resize(pending.column + 1, None);
        }
        row[pending.column] = Some(cell);
    }
}

fn sheet_rows(xml: &str, strings: &[String]) -> Result<Vec<SheetRow>, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut row: SheetRow = Vec::new();
    let mut next_column = 0usize;
    let mut cell: Option<PendingCell> = None;
    let mut in_value = false;

    loop {
        match reader.read_event()? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"row" => {
                    row = Vec::new();
                    next_column = 0;
                }
                b"c" => {
                    let column = attribute(&element, "r")?
                        .and_then(|r| column_index(&r))
                        .unwrap_or(next_column);
                    next_column = column + 1;
                    cell = Some(PendingCell {
                        column,
                        kind: attribute(&element, "t")?,
                        raw: String::new(),
                    });
                }
                b"v" | b"t" if cell.is_some() => in_value = true,
                _ => {}
            },
            Event::Empty(element) if element.local_name().as_ref() == b"c" => {
                next_column = attribute(&element, "r")?
                    .and_then(|r| column_index(&r))
                    .unwrap_or(next_column)
                    + 1;
            }
            Event::Text(chunk) if in_value => {
                if let Some(pending) = cell.as_mut() {
                    pending.raw.push_str(&chunk.unescape()?);
                }
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    if let Some(pending) = cell.take() {
                        finish_cell(pending, strings, &mut row);
                    }
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rows)
}

/// Rows of the workbook's first worksheet.
fn first_sheet(package: &mut OoxmlPackage<'_>) -> Result<Vec<SheetRow>, ExtractError> {
    let strings = match package.part(SHARED_STRINGS_PART)? {
        Some(xml) => shared_strings(&xml)?,
        None => Vec::new(),
    };

    let mut sheets: Vec<(u32, String)> = package
        .part_names()
        .into_iter()
        .filter_map(|name| {
            let number = name
                .strip_prefix(WORKSHEET_PREFIX)?
                .strip_suffix(".xml")?
                .parse()
                .ok()?;
            Some((number, name))
        })
        .collect();
    sheets.sort();
    let Some((_, sheet)) = sheets.into_iter().next() else {
        return Err(ExtractError::MissingPart(format!("{WORKSHEET_PREFIX}1.xml")));
    };

    let xml = package
        .part(&sheet)?
        .ok_or_else(|| ExtractError::MissingPart(sheet.clone()))?;
    sheet_rows(&xml, &strings)
}

fn housing_index(rows: &[SheetRow], file: &FileRecord, new_dwellings: bool) -> Vec<HousingPriceIndexRow> {
    rows.iter()
        .filter(|row| row.len() >= 2)
        .filter_map(|row| {
            let period = cell_text(row.first());
            if period.is_empty() || period.contains("תקופה") || period.contains("Period") {
                return None;
            }
            let index_value = cell_number(row.get(1))?;
            Some(HousingPriceIndexRow {
                publication_id: file.publication_id.clone(),
                file_id: file.id.clone(),
                period,
                district: None,
                index_value,
                base_year: DEFAULT_BASE_YEAR,
                pct_change_monthly: cell_number(row.get(2)),
                pct_change_annual: None,
                is_new_dwellings: new_dwellings,
            })
        })
        .collect()
}

fn district_index(rows: &[SheetRow], file: &FileRecord) -> Vec<HousingPriceIndexRow> {
    let mut out = Vec::new();
    for row in rows.iter().filter(|row| row.len() >= 3) {
        let period = cell_text(row.first());
        if period.is_empty() || period.contains("תקופה") || period.contains("מחוז") {
            continue;
        }
        for (offset, district) in DISTRICTS.iter().enumerate().take(row.len() - 1) {
            let Some(index_value) = cell_number(row.get(offset + 1)) else {
                continue;
            };
            out.push(HousingPriceIndexRow {
                publication_id: file.publication_id.clone(),
                file_id: file.id.clone(),
                period: period.clone(),
                district: Some(district.to_string()),
                index_value,
                base_year: DEFAULT_BASE_YEAR,
                pct_change_monthly: None,
                pct_change_annual: None,
                is_new_dwellings: false,
            });
        }
    }
    out
}

fn average_prices(rows: &[SheetRow], file: &FileRecord) -> Vec<AvgApartmentPriceRow> {
    let mut out = Vec::new();
    let mut district = String::new();
    for row in rows {
        let label = cell_text(row.first());
        if label.is_empty() || label.contains("מחוז") || label.contains("District") {
            continue;
        }
        let has_numbers = row.iter().skip(1).any(|cell| cell_number(Some(cell)).is_some());
        if !has_numbers {
            district = label;
            continue;
        }
        for (offset, rooms) in ROOM_BANDS.iter().enumerate().take(row.len() - 1) {
            let Some(price) = cell_number(row.get(offset + 1)).filter(|p| *p != 0.0) else {
                continue;
            };
            out.push(AvgApartmentPriceRow {
                publication_id: file.publication_id.clone(),
                file_id: file.id.clone(),
                period: String::new(),
                district: district.clone(),
                city: (label != district).then(|| label.clone()),
                rooms: Some(rooms.to_string()),
                avg_price_nis_thousands: price,
                sample_size: None,
            });
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetExtractor;

impl ContentExtractor for SpreadsheetExtractor {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn formats(&self) -> &'static [FileFormat] {
        &[FileFormat::Xlsx]
    }

    fn extract(&self, file: &FileRecord, body: &[u8]) -> Result<Vec<TableRows>, ExtractError> {
        let Some(layout) = SheetLayout::from_filename(&file.filename) else {
            info!(file = %file.id, "no parser for workbook layout, skipping");
            return Ok(Vec::new());
        };
        if !looks_like_zip(body) {
            return Err(ExtractError::NotOoxml);
        }

        let rows = first_sheet(&mut OoxmlPackage::open(body)?)?;
        let table = match layout {
            SheetLayout::NationalIndex => TableRows::HousingPriceIndex(housing_index(&rows, file, false)),
            SheetLayout::NewDwellingsIndex => TableRows::HousingPriceIndex(housing_index(&rows, file, true)),
            SheetLayout::DistrictIndex => TableRows::HousingPriceIndex(district_index(&rows, file)),
            SheetLayout::AveragePrices => TableRows::AvgApartmentPrices(average_prices(&rows, file)),
        };
        if table.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![table])
    }
}
