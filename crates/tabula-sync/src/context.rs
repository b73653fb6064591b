use chrono::{DateTime, Utc};
use uuid::Uuid;

/// `YYYY-MM-DD-<8 hex>`: sortable by day, unique within it.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y-%m-%d"), &suffix[..8])
}

/// State scoped to one run or one manifest ingestion.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    request_seq: u32,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            request_seq: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn next_request_id(&mut self) -> String {
        self.request_seq += 1;
        format!("req-{}-{:03}", self.run_id, self.request_seq)
    }

    pub fn requests_issued(&self) -> u32 {
        self.request_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_ids_are_date_scoped_and_unique() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 5).unwrap();
        let a = new_run_id(now);
        let b = new_run_id(now);
        assert!(a.starts_with("2026-03-01-"));
        assert_eq!(a.len(), "2026-03-01-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn request_ids_are_numbered_per_context() {
        let mut ctx = RunContext::new("2026-03-01-ab12cd34");
        assert_eq!(ctx.next_request_id(), "req-2026-03-01-ab12cd34-001");
        assert_eq!(ctx.next_request_id(), "req-2026-03-01-ab12cd34-002");
        assert_eq!(ctx.requests_issued(), 2);

        let mut other = RunContext::new("2026-03-01-ffffffff");
        assert_eq!(other.next_request_id(), "req-2026-03-01-ffffffff-001");
    }
}
