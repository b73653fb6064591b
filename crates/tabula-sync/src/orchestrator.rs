use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tabula_core::{
    FileRecord, ManifestEntry, Phase, PipelineError, PipelineRun, RunStatus, SourceId,
};
use tabula_storage::{
    BlobStore, FsBlobStore, HttpFetcher, KvStore, MemoryBlobStore, MemoryKvStore,
    MemoryRecordStore, PgStore, RecordStore, LAST_RUN_KEY, LAST_SUCCESSFUL_RUN_KEY,
};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::archive::archive_files;
use crate::config::{SourceRegistry, SyncConfig};
use crate::context::{new_run_id, RunContext};
use crate::discover::DiscoveryCoordinator;
use crate::download::download_entries;
use crate::pickup::{pickup_results, PickupOutcome};
use crate::router::{persist_extracted, ExtractionRouter};
use crate::trigger::{notifier_from_config, WorkerNotifier};

/// The three persistence backends a pipeline writes to.
#[derive(Clone)]
pub struct Stores {
    pub blobs: Arc<dyn BlobStore>,
    pub kv: Arc<dyn KvStore>,
    pub records: Arc<dyn RecordStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            blobs: Arc::new(MemoryBlobStore::new()),
            kv: Arc::new(MemoryKvStore::new()),
            records: Arc::new(MemoryRecordStore::new()),
        }
    }

    /// PostgreSQL for records and cursors, the filesystem for blobs.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let pg = Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?,
        );
        Ok(Self {
            blobs: Arc::new(FsBlobStore::new(&config.storage_dir)),
            kv: pg.clone(),
            records: pg,
        })
    }
}

/// Response of a manifest ingestion.
#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    /// Files whose rows were stored in process.
    pub processed: u32,
    pub errors: Vec<PipelineError>,
    pub pdf_requests: u32,
}

#[derive(Debug, Default)]
struct Fetched {
    files_downloaded: u32,
    archived: Vec<FileRecord>,
    errors: Vec<PipelineError>,
}

#[derive(Debug, Default)]
struct Extracted {
    files_extracted: u32,
    requests_created: u32,
    errors: Vec<PipelineError>,
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

pub struct Pipeline {
    stores: Stores,
    http: Arc<HttpFetcher>,
    discovery: DiscoveryCoordinator,
    router: ExtractionRouter,
    notifier: Arc<dyn WorkerNotifier>,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        stores: Stores,
        http: Arc<HttpFetcher>,
        discovery: DiscoveryCoordinator,
        router: ExtractionRouter,
        notifier: Arc<dyn WorkerNotifier>,
    ) -> Self {
        Self {
            stores,
            http,
            discovery,
            router,
            notifier,
            run_lock: Mutex::new(()),
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let stores = Stores::connect(config).await?;
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let discovery =
            DiscoveryCoordinator::from_registry(&registry, Arc::clone(&http), Arc::clone(&stores.kv));
        let router = ExtractionRouter::standard()?;
        let notifier = notifier_from_config(config).context("configuring worker notifier")?;
        Ok(Self::new(stores, http, discovery, router, notifier))
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// One full pipeline run. Errors inside phases are recorded on the run;
    /// `Err` means the final run state could not be persisted.
    pub async fn run_once(&self) -> Result<PipelineRun> {
        let _guard = self.run_lock.lock().await;
        let mut ctx = RunContext::new(new_run_id(Utc::now()));
        let mut run = PipelineRun::start(ctx.run_id());
        let span = info_span!("run", run_id = %run.id);

        async move {
            info!("pipeline run started");
            match self.run_phases(&mut ctx, &mut run).await {
                Ok(()) => run.finish(),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "pipeline run aborted");
                    run.fail(PipelineError::new(Phase::Orchestrator, message));
                }
            }

            self.stores
                .records
                .upsert_run(&run)
                .await
                .context("persisting final run state")?;
            if run.status == RunStatus::Completed {
                let finished = run.finished_at.unwrap_or_else(Utc::now);
                self.stores
                    .kv
                    .put(LAST_SUCCESSFUL_RUN_KEY, &finished.to_rfc3339())
                    .await
                    .context("recording last successful run")?;
            }
            info!(
                status = %run.status,
                errors = run.errors.len(),
                sources_checked = run.sources_checked,
                files_discovered = run.files_discovered,
                files_extracted = run.files_extracted,
                "pipeline run finished"
            );
            Ok(run)
        }
        .instrument(span)
        .await
    }

    async fn run_phases(&self, ctx: &mut RunContext, run: &mut PipelineRun) -> Result<()> {
        let records = self.stores.records.as_ref();
        records.upsert_run(run).await.context("recording run start")?;
        self.stores
            .kv
            .put(LAST_RUN_KEY, &run.started_at.to_rfc3339())
            .await
            .context("recording last run")?;

        let picked = pickup_results(self.stores.blobs.as_ref(), records).await;
        run.extraction_results_processed = picked.processed;
        run.errors.extend(picked.errors);

        let discovered = self.discovery.discover_all(Utc::now()).await;
        run.sources_checked = discovered.sources_checked;
        run.files_discovered = count(discovered.entries.len());
        run.errors.extend(discovered.errors);
        records
            .upsert_run(run)
            .await
            .context("persisting discovery counters")?;
        if discovered.entries.is_empty() {
            info!("no new files discovered");
            return Ok(());
        }

        let fetched = self.fetch_and_archive(&discovered.entries).await;
        run.files_downloaded = fetched.files_downloaded;
        run.errors.extend(fetched.errors);
        records
            .upsert_run(run)
            .await
            .context("persisting download counters")?;

        let extracted = self.extract_and_store(ctx, &fetched.archived).await;
        run.files_extracted = extracted.files_extracted;
        run.extraction_requests_created = extracted.requests_created;
        run.errors.extend(extracted.errors);
        records
            .upsert_run(run)
            .await
            .context("persisting extraction counters")?;

        if extracted.requests_created > 0 {
            if let Some(err) = self.notify_worker(ctx.run_id(), extracted.requests_created).await {
                run.errors.push(err);
            }
        }
        Ok(())
    }

    async fn fetch_and_archive(&self, entries: &[ManifestEntry]) -> Fetched {
        let records = self.stores.records.as_ref();
        let downloads = download_entries(&self.http, records, entries).await;
        let archived = archive_files(
            self.stores.blobs.as_ref(),
            records,
            &downloads.files,
            Utc::now(),
        )
        .await;

        let mut errors = downloads.errors;
        errors.extend(archived.errors);
        Fetched {
            files_downloaded: count(downloads.files.len()),
            archived: archived.records,
            errors,
        }
    }

    async fn extract_and_store(&self, ctx: &mut RunContext, files: &[FileRecord]) -> Extracted {
        let records = self.stores.records.as_ref();
        let routed = self
            .router
            .route(ctx, self.stores.blobs.as_ref(), records, files)
            .await;
        let stored = persist_extracted(records, routed.extracted).await;

        let mut errors = routed.errors;
        errors.extend(stored.errors);
        Extracted {
            files_extracted: stored.files_extracted,
            requests_created: count(routed.requests.len()),
            errors,
        }
    }

    async fn notify_worker(&self, run_id: &str, requests: u32) -> Option<PipelineError> {
        info!(requests, notifier = self.notifier.name(), "notifying extraction worker");
        match self.notifier.notify(run_id).await {
            Ok(()) => None,
            Err(err) => {
                warn!(error = %err, "worker notification failed");
                Some(PipelineError::new(Phase::Trigger, err.to_string()))
            }
        }
    }

    /// Download, archive and extract entries discovered outside this process.
    pub async fn ingest_manifest(&self, entries: Vec<ManifestEntry>) -> IngestSummary {
        let _guard = self.run_lock.lock().await;
        if entries.is_empty() {
            return IngestSummary::default();
        }
        let mut ctx = RunContext::new(new_run_id(Utc::now()));
        let span = info_span!("ingest", run_id = %ctx.run_id(), entries = entries.len());

        async move {
            let fetched = self.fetch_and_archive(&entries).await;
            let extracted = self.extract_and_store(&mut ctx, &fetched.archived).await;

            let mut errors = fetched.errors;
            errors.extend(extracted.errors);
            if extracted.requests_created > 0 {
                if let Some(err) = self.notify_worker(ctx.run_id(), extracted.requests_created).await {
                    errors.push(err);
                }
            }
            info!(
                processed = extracted.files_extracted,
                errors = errors.len(),
                pdf_requests = extracted.requests_created,
                "manifest ingested"
            );
            IngestSummary {
                processed: extracted.files_extracted,
                errors,
                pdf_requests: extracted.requests_created,
            }
        }
        .instrument(span)
        .await
    }

    pub async fn run_pickup(&self) -> PickupOutcome {
        let _guard = self.run_lock.lock().await;
        pickup_results(self.stores.blobs.as_ref(), self.stores.records.as_ref()).await
    }

    pub async fn latest_run(&self) -> Result<Option<PipelineRun>> {
        Ok(self.stores.records.latest_run().await?)
    }

    /// Start time of the most recent run, as recorded in the key-value store.
    pub async fn last_run_at(&self) -> Result<Option<String>> {
        Ok(self.stores.kv.get(LAST_RUN_KEY).await?)
    }

    pub async fn known_urls(&self, sources: &[SourceId]) -> Result<Vec<String>> {
        Ok(self.stores.records.known_download_urls(sources).await?)
    }
}
