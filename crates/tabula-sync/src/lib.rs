//! Pipeline orchestration: discovery across sources, download and archive,
//! extraction routing, result pickup and run bookkeeping.

use anyhow::Result;
use tabula_core::PipelineRun;

pub mod archive;
pub mod config;
pub mod context;
pub mod discover;
pub mod download;
pub mod orchestrator;
pub mod pending;
pub mod pickup;
pub mod router;
pub mod scheduler;
pub mod trigger;

pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use context::{new_run_id, RunContext};
pub use discover::{DiscoveryCoordinator, DiscoveryOutcome};
pub use orchestrator::{IngestSummary, Pipeline, Stores};
pub use pickup::PickupOutcome;
pub use router::ExtractionRouter;
pub use scheduler::maybe_build_scheduler;
pub use trigger::{GithubWorkflowNotifier, NoopNotifier, TriggerError, WorkerNotifier};

pub const CRATE_NAME: &str = "tabula-sync";

pub async fn run_sync_once_from_env() -> Result<PipelineRun> {
    let config = SyncConfig::from_env();
    let pipeline = Pipeline::from_config(&config).await?;
    pipeline.run_once().await
}

pub async fn run_pickup_from_env() -> Result<PickupOutcome> {
    let config = SyncConfig::from_env();
    let pipeline = Pipeline::from_config(&config).await?;
    Ok(pipeline.run_pickup().await)
}
