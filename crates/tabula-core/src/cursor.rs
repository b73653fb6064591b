use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-source incremental discovery cursor.
///
/// Every high-water mark is optional because each source only tracks the
/// marks that make sense for its upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub last_check: DateTime<Utc>,
    /// `year/folder` of the newest publication folder seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_folder: Option<String>,
    /// `year-month` of the newest index period seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_period: Option<String>,
    /// `year/release` of the newest media release seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_publish_date: Option<DateTime<Utc>>,
}

impl DiscoveryState {
    pub fn new(last_check: DateTime<Utc>) -> Self {
        Self {
            last_check,
            latest_folder: None,
            latest_period: None,
            latest_release: None,
            latest_publish_date: None,
        }
    }

    /// Combine a freshly produced cursor with the stored one so no mark moves
    /// backwards.
    pub fn merged_with(self, previous: Option<&DiscoveryState>) -> DiscoveryState {
        let Some(previous) = previous else {
            return self;
        };

        DiscoveryState {
            last_check: self.last_check.max(previous.last_check),
            latest_folder: max_text(self.latest_folder, previous.latest_folder.as_ref()),
            latest_period: max_period(self.latest_period, previous.latest_period.as_ref()),
            latest_release: max_text(self.latest_release, previous.latest_release.as_ref()),
            latest_publish_date: match (self.latest_publish_date, previous.latest_publish_date) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

fn max_text(candidate: Option<String>, previous: Option<&String>) -> Option<String> {
    match (candidate, previous) {
        (Some(a), Some(b)) if b > &a => Some(b.clone()),
        (Some(a), _) => Some(a),
        (None, b) => b.cloned(),
    }
}

fn max_period(candidate: Option<String>, previous: Option<&String>) -> Option<String> {
    match (candidate, previous) {
        (Some(a), Some(b)) => {
            if period_is_newer(&a, Some(b)) {
                Some(a)
            } else {
                Some(b.clone())
            }
        }
        (a, b) => a.or_else(|| b.cloned()),
    }
}

const HEBREW_MONTHS: [&str; 12] = [
    "ינואר",
    "פברואר",
    "מרץ",
    "אפריל",
    "מאי",
    "יוני",
    "יולי",
    "אוגוסט",
    "ספטמבר",
    "אוקטובר",
    "נובמבר",
    "דצמבר",
];

/// Sort key for a `year-month` period. The month may be numeric or a Hebrew
/// month name as published by the price-index API.
pub fn period_key(period: &str) -> Option<(i32, u32)> {
    let (year, month) = period.trim().split_once('-')?;
    let year: i32 = year.trim().parse().ok()?;
    let month = month.trim();
    let month = match month.parse::<u32>() {
        Ok(n) if (1..=12).contains(&n) => n,
        Ok(_) => return None,
        Err(_) => HEBREW_MONTHS
            .iter()
            .position(|name| *name == month)
            .map(|idx| idx as u32 + 1)?,
    };
    Some((year, month))
}

/// True when `candidate` is strictly later than the known period. Periods that
/// cannot be ordered are compared for equality only.
pub fn period_is_newer(candidate: &str, known: Option<&str>) -> bool {
    let Some(known) = known else {
        return true;
    };
    match (period_key(candidate), period_key(known)) {
        (Some(a), Some(b)) => a > b,
        _ => candidate != known,
    }
}
