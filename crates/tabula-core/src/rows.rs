//! Structured output tables and the rules for classifying untyped rows.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_BASE_YEAR: i32 = 2020;

fn default_base_year() -> i32 {
    DEFAULT_BASE_YEAR
}

/// Accepts either a JSON-encoded string or any JSON value, keeping text.
fn json_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Text field that also takes numbers; `null` reads as empty.
fn plain_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(json_text(deserializer)?.unwrap_or_default())
}

/// A JSON number or a string holding one.
fn number_from(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    number_from(&value)
        .ok_or_else(|| de::Error::custom(format!("expected a number, found {value}")))
}

/// Optional measure; values that are not numbers read as absent.
fn lenient_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?
        .as_ref()
        .and_then(number_from))
}

fn lenient_opt_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_f64(deserializer)?
        .filter(|n| n.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(n))
        .map(|n| n as u32))
}

fn lenient_base_year<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(DEFAULT_BASE_YEAR);
    }
    number_from(&value)
        .filter(|n| n.fract() == 0.0 && n.abs() < 100_000.0)
        .map(|n| n as i32)
        .ok_or_else(|| de::Error::custom(format!("expected a year, found {value}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousingPriceIndexRow {
    #[serde(default)]
    pub publication_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default, deserialize_with = "plain_text")]
    pub period: String,
    #[serde(default, deserialize_with = "json_text", skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub index_value: f64,
    #[serde(default = "default_base_year", deserialize_with = "lenient_base_year")]
    pub base_year: i32,
    #[serde(default, deserialize_with = "lenient_opt_f64", skip_serializing_if = "Option::is_none")]
    pub pct_change_monthly: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64", skip_serializing_if = "Option::is_none")]
    pub pct_change_annual: Option<f64>,
    #[serde(default)]
    pub is_new_dwellings: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvgApartmentPriceRow {
    #[serde(default)]
    pub publication_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default, deserialize_with = "plain_text")]
    pub period: String,
    #[serde(default, deserialize_with = "plain_text")]
    pub district: String,
    #[serde(default, deserialize_with = "json_text", skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "json_text", skip_serializing_if = "Option::is_none")]
    pub rooms: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub avg_price_nis_thousands: f64,
    #[serde(default, deserialize_with = "lenient_opt_u32", skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerPriceIndexRow {
    #[serde(default)]
    pub publication_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default, deserialize_with = "plain_text")]
    pub period: String,
    #[serde(deserialize_with = "plain_text")]
    pub index_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name_he: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name_en: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub index_value: f64,
    #[serde(default = "default_base_year", deserialize_with = "lenient_base_year")]
    pub base_year: i32,
    #[serde(default, deserialize_with = "lenient_opt_f64", skip_serializing_if = "Option::is_none")]
    pub pct_change_monthly: Option<f64>,
    #[serde(default, deserialize_with = "lenient_opt_f64", skip_serializing_if = "Option::is_none")]
    pub pct_change_annual: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewInsightRow {
    #[serde(default)]
    pub publication_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// JSON array of notable figures, kept as text.
    #[serde(default, deserialize_with = "json_text", skip_serializing_if = "Option::is_none")]
    pub key_figures: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_f64", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

trait Row {
    fn ids_mut(&mut self) -> (&mut String, &mut String);
    fn validate(&self) -> Vec<String>;
}

fn check_ids(publication_id: &str, file_id: &str, errors: &mut Vec<String>) {
    if publication_id.is_empty() {
        errors.push("missing publication_id".to_string());
    }
    if file_id.is_empty() {
        errors.push("missing file_id".to_string());
    }
}

fn check_range(name: &str, value: f64, max: f64, errors: &mut Vec<String>) {
    if !value.is_finite() {
        errors.push(format!("{name} is not a finite number"));
    } else if !(0.0..=max).contains(&value) {
        errors.push(format!("{name} {value} out of reasonable range"));
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

impl Row for HousingPriceIndexRow {
    fn ids_mut(&mut self) -> (&mut String, &mut String) {
        (&mut self.publication_id, &mut self.file_id)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        check_ids(&self.publication_id, &self.file_id, &mut errors);
        if self.period.trim().is_empty() {
            errors.push("missing period".to_string());
        }
        check_range("index_value", self.index_value, 10_000.0, &mut errors);
        if self.base_year <= 0 {
            errors.push("invalid base_year".to_string());
        }
        errors
    }
}

impl Row for AvgApartmentPriceRow {
    fn ids_mut(&mut self) -> (&mut String, &mut String) {
        (&mut self.publication_id, &mut self.file_id)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        check_ids(&self.publication_id, &self.file_id, &mut errors);
        if self.district.trim().is_empty() {
            errors.push("missing district".to_string());
        }
        check_range(
            "avg_price_nis_thousands",
            self.avg_price_nis_thousands,
            100_000.0,
            &mut errors,
        );
        errors
    }
}

impl Row for ConsumerPriceIndexRow {
    fn ids_mut(&mut self) -> (&mut String, &mut String) {
        (&mut self.publication_id, &mut self.file_id)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.publication_id.is_empty() {
            errors.push("missing publication_id".to_string());
        }
        if self.period.trim().is_empty() {
            errors.push("missing period".to_string());
        }
        if self.index_code.trim().is_empty() {
            errors.push("missing index_code".to_string());
        }
        if !self.index_value.is_finite() {
            errors.push("index_value is not a finite number".to_string());
        }
        if self.base_year <= 0 {
            errors.push("invalid base_year".to_string());
        }
        errors
    }
}

impl Row for ReviewInsightRow {
    fn ids_mut(&mut self) -> (&mut String, &mut String) {
        (&mut self.publication_id, &mut self.file_id)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        check_ids(&self.publication_id, &self.file_id, &mut errors);
        if !has_text(&self.summary) && !has_text(&self.extracted_text) && !has_text(&self.key_figures)
        {
            errors.push("one of summary, extracted_text or key_figures is required".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    HousingPriceIndex,
    AvgApartmentPrices,
    ConsumerPriceIndex,
    ReviewInsights,
}

text_enum!(TableKind {
    HousingPriceIndex => "housing_price_index",
    AvgApartmentPrices => "avg_apartment_prices",
    ConsumerPriceIndex => "consumer_price_index",
    ReviewInsights => "review_insights",
});

impl TableKind {
    /// Which table an untyped row belongs to, judged by the fields present.
    pub fn classify(row: &Map<String, Value>) -> Option<TableKind> {
        let has = |key: &str| row.get(key).is_some_and(|v| !v.is_null());
        if has("index_code") {
            Some(TableKind::ConsumerPriceIndex)
        } else if has("index_value") {
            Some(TableKind::HousingPriceIndex)
        } else if has("avg_price_nis_thousands") {
            Some(TableKind::AvgApartmentPrices)
        } else if has("summary") || has("key_figures") || has("extracted_text") {
            Some(TableKind::ReviewInsights)
        } else {
            None
        }
    }
}

/// A batch of rows bound for one structured table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRows {
    HousingPriceIndex(Vec<HousingPriceIndexRow>),
    AvgApartmentPrices(Vec<AvgApartmentPriceRow>),
    ConsumerPriceIndex(Vec<ConsumerPriceIndexRow>),
    ReviewInsights(Vec<ReviewInsightRow>),
}

fn parse_rows<T: de::DeserializeOwned>(
    rows: &[Map<String, Value>],
    rejected: &mut Vec<String>,
) -> Vec<T> {
    rows.iter()
        .enumerate()
        .filter_map(|(index, row)| {
            match serde_json::from_value(Value::Object(row.clone())) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    rejected.push(format!("row {index}: {err}"));
                    None
                }
            }
        })
        .collect()
}

fn fill_ids<T: Row>(rows: &mut [T], publication_id: &str, file_id: &str) {
    for row in rows {
        let (p, f) = row.ids_mut();
        if p.is_empty() {
            *p = publication_id.to_string();
        }
        if f.is_empty() {
            *f = file_id.to_string();
        }
    }
}

fn retain_valid<T: Row>(rows: &mut Vec<T>) -> Vec<String> {
    let mut rejected = Vec::new();
    rows.retain(|row| {
        let errors = row.validate();
        if errors.is_empty() {
            true
        } else {
            rejected.push(errors.join("; "));
            false
        }
    });
    rejected
}

impl TableRows {
    /// Decode untyped rows one by one. Rows that do not decode are left out
    /// and reported, one message each.
    pub fn from_json_rows(kind: TableKind, rows: &[Map<String, Value>]) -> (TableRows, Vec<String>) {
        let mut rejected = Vec::new();
        let decoded = match kind {
            TableKind::HousingPriceIndex => {
                TableRows::HousingPriceIndex(parse_rows(rows, &mut rejected))
            }
            TableKind::AvgApartmentPrices => {
                TableRows::AvgApartmentPrices(parse_rows(rows, &mut rejected))
            }
            TableKind::ConsumerPriceIndex => {
                TableRows::ConsumerPriceIndex(parse_rows(rows, &mut rejected))
            }
            TableKind::ReviewInsights => TableRows::ReviewInsights(parse_rows(rows, &mut rejected)),
        };
        (decoded, rejected)
    }

    pub fn kind(&self) -> TableKind {
        match self {
            TableRows::HousingPriceIndex(_) => TableKind::HousingPriceIndex,
            TableRows::AvgApartmentPrices(_) => TableKind::AvgApartmentPrices,
            TableRows::ConsumerPriceIndex(_) => TableKind::ConsumerPriceIndex,
            TableRows::ReviewInsights(_) => TableKind::ReviewInsights,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TableRows::HousingPriceIndex(rows) => rows.len(),
            TableRows::AvgApartmentPrices(rows) => rows.len(),
            TableRows::ConsumerPriceIndex(rows) => rows.len(),
            TableRows::ReviewInsights(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populate ids the producer left blank.
    pub fn fill_ids(&mut self, publication_id: &str, file_id: &str) {
        match self {
            TableRows::HousingPriceIndex(rows) => fill_ids(rows, publication_id, file_id),
            TableRows::AvgApartmentPrices(rows) => fill_ids(rows, publication_id, file_id),
            TableRows::ConsumerPriceIndex(rows) => fill_ids(rows, publication_id, file_id),
            TableRows::ReviewInsights(rows) => fill_ids(rows, publication_id, file_id),
        }
    }

    /// Drop rows that fail validation; returns one message per dropped row.
    pub fn retain_valid(&mut self) -> Vec<String> {
        match self {
            TableRows::HousingPriceIndex(rows) => retain_valid(rows),
            TableRows::AvgApartmentPrices(rows) => retain_valid(rows),
            TableRows::ConsumerPriceIndex(rows) => retain_valid(rows),
            TableRows::ReviewInsights(rows) => retain_valid(rows),
        }
    }
}
