use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

text_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    Partial => "partial",
    Failed => "failed",
});

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Download,
    Archive,
    Extraction,
    Store,
    Pickup,
    Trigger,
    Orchestrator,
}

text_enum!(Phase {
    Discovery => "discovery",
    Download => "download",
    Archive => "archive",
    Extraction => "extraction",
    Store => "store",
    Pickup => "pickup",
    Trigger => "trigger",
    Orchestrator => "orchestrator",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

impl PipelineError {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            source: None,
            file: None,
            error_message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// One execution of the pipeline with its counters and ordered errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub sources_checked: u32,
    pub files_discovered: u32,
    pub files_downloaded: u32,
    pub files_extracted: u32,
    pub extraction_requests_created: u32,
    pub extraction_results_processed: u32,
    pub errors: Vec<PipelineError>,
}

impl PipelineRun {
    pub fn start(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            sources_checked: 0,
            files_discovered: 0,
            files_downloaded: 0,
            files_extracted: 0,
            extraction_requests_created: 0,
            extraction_results_processed: 0,
            errors: Vec::new(),
        }
    }

    /// Terminal status is derived from the accumulated errors.
    pub fn finish(&mut self) {
        self.status = if self.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: PipelineError) {
        self.errors.push(error);
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }
}
