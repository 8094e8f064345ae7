//! Ingestion orchestration for nestwatch: pipeline runs, version linking,
//! manual links and scheduling.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use nestwatch_adapters::{Geocoder, NoopGeocoder, NotificationDispatcher, StaticGeocoder};
use nestwatch_storage::{
    HttpClientConfig, HttpFetcher, HttpMediaDownloader, ListingStore, MediaStore, MemoryStore, PgStore,
};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod graph;
pub mod links;
pub mod pipeline;
pub mod similarity_cache;
pub mod versioning;

pub use config::{DelayRange, JobConfig, JobProvider, JobRegistry, ProviderRegistry, SyncConfig};
pub use graph::{select_head, VersionGraph};
pub use links::{ChainHead, LinkError, LinkResult, ManualLinkService};
pub use pipeline::{Pipeline, RunCounts, RunOutcome, RunReport, RunRequest, Stage};
pub use similarity_cache::SimilarityCache;
pub use versioning::{VersionLinker, VersionPlan};

pub const CRATE_NAME: &str = "nestwatch-sync";

/// Postgres when `DATABASE_URL` is set, otherwise a process-local store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn ListingStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            if !store.has_versioning() {
                warn!("listing versioning migration missing; version stages will be skipped");
            }
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set, using in-memory listing store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub struct SyncService {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    pipeline: Pipeline,
}

impl SyncService {
    pub async fn new(config: SyncConfig, store: Arc<dyn ListingStore>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let geocoder = load_geocoder(&config.workspace_root).await?;
        let media = HttpMediaDownloader::new(http.clone(), MediaStore::new(config.media_dir.clone()));
        let cache = SimilarityCache::new(Duration::from_secs(config.similarity_cache_ttl_secs));
        let pipeline = Pipeline::new(store)
            .with_geocoder(geocoder)
            .with_media_downloader(Arc::new(media))
            .with_similarity_cache(Arc::new(cache))
            .with_delays(config.detail_delay, config.media_delay);
        Ok(Self {
            config,
            http,
            pipeline,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ListingStore> {
        self.pipeline.store().clone()
    }

    pub fn with_pipeline(mut self, configure: impl FnOnce(Pipeline) -> Pipeline) -> Self {
        self.pipeline = configure(self.pipeline);
        self
    }

    /// Runs every enabled job once. Jobs run concurrently, the providers of
    /// one job one after another.
    pub async fn run_all_jobs(&self) -> Result<Vec<RunReport>> {
        let providers = ProviderRegistry::load(&self.config.workspace_root).await?;
        let jobs = JobRegistry::load(&self.config.workspace_root).await?;
        let runs = jobs.enabled().map(|job| self.run_job(job, &providers));
        let reports: Vec<RunReport> = join_all(runs).await.into_iter().flatten().collect();
        let failed = reports.iter().filter(|r| r.outcome.is_failure()).count();
        info!(runs = reports.len(), failed, "sync finished");
        Ok(reports)
    }

    pub async fn run_job(&self, job: &JobConfig, providers: &ProviderRegistry) -> Vec<RunReport> {
        let adapters = job
            .notifications
            .iter()
            .map(|n| n.build(self.http.clone()))
            .collect();
        let notifier = NotificationDispatcher::new(adapters);
        let mut reports = Vec::new();

        for entry in &job.providers {
            let Some(provider_config) = providers.get(&entry.id) else {
                warn!(job_id = %job.id, provider_id = %entry.id, "provider not registered, skipping");
                continue;
            };
            let provider = match provider_config.build(&self.config.workspace_root, self.http.clone()) {
                Ok(provider) => provider,
                Err(err) => {
                    error!(job_id = %job.id, provider_id = %entry.id, error = %err, "provider setup failed");
                    continue;
                }
            };
            if !provider.enabled() {
                debug!(job_id = %job.id, provider_id = %entry.id, "provider disabled");
                continue;
            }
            let request = RunRequest {
                job_id: &job.id,
                search_url: &entry.url,
                provider: provider.as_ref(),
                blacklist: job.blacklist().union(&provider_config.blacklist()),
                full_fetch: job.full_fetch,
                home: job.home,
                notifier: &notifier,
            };
            reports.push(self.pipeline.run(&request).await);
        }
        reports
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let service = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                if let Err(err) = service.run_all_jobs().await {
                    error!(error = %format!("{err:#}"), "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn load_geocoder(workspace_root: &Path) -> Result<Arc<dyn Geocoder>> {
    let path = workspace_root.join(config::GEOCODER_TABLE_FILE);
    if !fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(Arc::new(NoopGeocoder));
    }
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let table = StaticGeocoder::from_json(&text).with_context(|| format!("parsing {}", path.display()))?;
    debug!(entries = table.len(), "loaded geocoder table");
    Ok(Arc::new(table))
}

pub async fn run_sync_once_from_env() -> Result<Vec<RunReport>> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    let service = SyncService::new(config, store).await?;
    service.run_all_jobs().await
}
