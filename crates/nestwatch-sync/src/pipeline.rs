//! One (job, provider) ingestion run: fetch, filter, enrich, version, persist, notify.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nestwatch_adapters::{
    build_request_url, FetchRequest, Geocoder, NoopGeocoder, NotificationDispatcher, Provider,
};
use nestwatch_core::geo::{distance_between, valid_coordinates};
use nestwatch_core::{Blacklist, Coordinates, Listing, NewListing, PropertyAttributes};
use nestwatch_storage::{ListingStore, MediaDownloader, NoopMediaDownloader};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DelayRange;
use crate::similarity_cache::SimilarityCache;
use crate::versioning::{VersionLinker, VersionPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BuildUrl,
    Fetch,
    Normalize,
    Filter,
    Dedup,
    Geocode,
    Enrich,
    Media,
    Version,
    Persist,
    Distance,
    CrossPlatform,
    Notify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BuildUrl => "build_url",
            Stage::Fetch => "fetch",
            Stage::Normalize => "normalize",
            Stage::Filter => "filter",
            Stage::Dedup => "dedup",
            Stage::Geocode => "geocode",
            Stage::Enrich => "enrich",
            Stage::Media => "media",
            Stage::Version => "version",
            Stage::Persist => "persist",
            Stage::Distance => "distance",
            Stage::CrossPlatform => "cross_platform",
            Stage::Notify => "notify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Notified { listings: Vec<Listing> },
    /// Nothing left to do after `stage`; not an error.
    NoNewListings { stage: Stage },
    Failed { stage: Stage, error: String },
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub normalized: usize,
    pub missing_required: usize,
    pub blacklisted: usize,
    pub new_listings: usize,
    pub geocoded: usize,
    pub enriched: usize,
    pub enrichment_failures: usize,
    pub media_failures: usize,
    pub version_links: usize,
    pub persisted: usize,
    pub chains_resolved: usize,
    pub distances: usize,
    pub cross_platform_duplicates: usize,
    pub notified: usize,
    pub notification_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub job_id: String,
    pub provider_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub outcome: RunOutcome,
}

/// Inputs for one run. The blacklist is the job's terms merged with the
/// provider's own.
pub struct RunRequest<'a> {
    pub job_id: &'a str,
    pub search_url: &'a str,
    pub provider: &'a dyn Provider,
    pub blacklist: Blacklist,
    pub full_fetch: bool,
    pub home: Option<Coordinates>,
    pub notifier: &'a NotificationDispatcher,
}

struct StageError {
    stage: Stage,
    error: anyhow::Error,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageError>;
}

impl<T, E> AtStage<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn at(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|err| StageError {
            stage,
            error: err.into(),
        })
    }
}

type StageFlow = Result<ControlFlow<Stage, Vec<Listing>>, StageError>;

pub struct Pipeline {
    store: Arc<dyn ListingStore>,
    geocoder: Arc<dyn Geocoder>,
    media: Arc<dyn MediaDownloader>,
    similarity_cache: Arc<SimilarityCache>,
    linker: VersionLinker,
    detail_delay: DelayRange,
    media_delay: DelayRange,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            linker: VersionLinker::new(store.clone()),
            store,
            geocoder: Arc::new(NoopGeocoder),
            media: Arc::new(NoopMediaDownloader),
            similarity_cache: Arc::new(SimilarityCache::new(Duration::from_secs(24 * 60 * 60))),
            detail_delay: DelayRange::default(),
            media_delay: DelayRange::default(),
        }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn with_media_downloader(mut self, media: Arc<dyn MediaDownloader>) -> Self {
        self.media = media;
        self
    }

    pub fn with_similarity_cache(mut self, cache: Arc<SimilarityCache>) -> Self {
        self.similarity_cache = cache;
        self
    }

    pub fn with_delays(mut self, detail: DelayRange, media: DelayRange) -> Self {
        self.detail_delay = detail;
        self.media_delay = media;
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Runs every stage in order. Never returns an error: hard failures are
    /// logged once here and reported as [`RunOutcome::Failed`].
    pub async fn run(&self, request: &RunRequest<'_>) -> RunReport {
        let provider_id = request.provider.provider_id().to_string();
        let span = info_span!("pipeline_run", job_id = request.job_id, provider_id = %provider_id);
        async {
            let started_at = Utc::now();
            let mut counts = RunCounts::default();
            let outcome = match self.execute(request, &mut counts).await {
                Ok(ControlFlow::Continue(listings)) => {
                    info!(count = listings.len(), "run finished with notifications");
                    RunOutcome::Notified { listings }
                }
                Ok(ControlFlow::Break(stage)) => {
                    debug!(stage = %stage, "no new listings");
                    RunOutcome::NoNewListings { stage }
                }
                Err(StageError { stage, error }) => {
                    let error = format!("{error:#}");
                    error!(stage = %stage, error = %error, "pipeline run failed");
                    RunOutcome::Failed { stage, error }
                }
            };
            RunReport {
                run_id: Uuid::new_v4(),
                job_id: request.job_id.to_string(),
                provider_id: provider_id.clone(),
                started_at,
                finished_at: Utc::now(),
                counts,
                outcome,
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, request: &RunRequest<'_>, counts: &mut RunCounts) -> StageFlow {
        let provider = request.provider;
        let job_id = request.job_id;
        let provider_id = provider.provider_id();

        let url = build_request_url(request.search_url, provider.sort_param()).at(Stage::BuildUrl)?;

        let known: HashSet<String> = self
            .store
            .known_hashes(job_id, provider_id)
            .await
            .at(Stage::Fetch)?
            .into_iter()
            .collect();
        let fetch_request = FetchRequest {
            url,
            known_hashes: known,
            blacklist: request.blacklist.clone(),
            full_fetch: request.full_fetch,
        };
        let raw = provider.fetch(&fetch_request).await.at(Stage::Fetch)?;
        counts.fetched = raw.len();

        let normalized = raw
            .iter()
            .map(|r| provider.normalize(r))
            .collect::<Result<Vec<_>, _>>()
            .at(Stage::Normalize)?;
        counts.normalized = normalized.len();

        let kept = self.filter(provider, &request.blacklist, normalized, counts);

        let mut seen = HashSet::new();
        let mut fresh: Vec<NewListing> = kept
            .into_iter()
            .filter(|l| !fetch_request.known_hashes.contains(&l.hash) && seen.insert(l.hash.clone()))
            .collect();
        counts.new_listings = fresh.len();
        if fresh.is_empty() {
            return Ok(ControlFlow::Break(Stage::Dedup));
        }
        debug!(count = fresh.len(), "new listings after dedup");

        self.geocode(&mut fresh, counts).await;
        self.enrich(provider, &mut fresh, counts).await;
        self.download_media(provider_id, &mut fresh, counts).await;

        let plan = match self
            .linker
            .detect_versions_with_batch_awareness(job_id, &mut fresh, Utc::now())
            .await
        {
            Ok(plan) => plan,
            Err(err) if err.is_migration_pending() => {
                debug!(error = %err, "versioning schema missing, skipping version detection");
                VersionPlan::default()
            }
            Err(err) => return Err(err).at(Stage::Version),
        };
        counts.version_links = plan.pending_edges.len()
            + fresh.iter().filter(|l| l.previous_version_id.is_some()).count();

        let persisted = self
            .store
            .persist(job_id, &fresh, &plan.supersede)
            .await
            .at(Stage::Persist)?;
        counts.persisted = persisted.len();
        if persisted.is_empty() {
            return Ok(ControlFlow::Break(Stage::Persist));
        }
        let persisted = self.settle_versions(job_id, &plan, persisted, counts).await;

        let persisted = self.update_distances(request.home, persisted, counts).await;

        let mut surviving = Vec::with_capacity(persisted.len());
        for listing in persisted {
            let duplicate = self
                .similarity_cache
                .check_and_add(&listing.title, listing.address.as_deref(), listing.price)
                .await;
            if duplicate {
                counts.cross_platform_duplicates += 1;
                debug!(hash = %listing.hash, listing_id = %listing.id, "cross-platform duplicate dropped");
            } else {
                surviving.push(listing);
            }
        }
        if surviving.is_empty() {
            return Ok(ControlFlow::Break(Stage::CrossPlatform));
        }

        let summary = request.notifier.send(provider_id, &surviving, job_id).await;
        counts.notified = surviving.len();
        counts.notification_failures = summary.failed;
        Ok(ControlFlow::Continue(surviving))
    }

    fn filter(
        &self,
        provider: &dyn Provider,
        blacklist: &Blacklist,
        listings: Vec<NewListing>,
        counts: &mut RunCounts,
    ) -> Vec<NewListing> {
        let required = provider.required_fields();
        let (complete, incomplete): (Vec<_>, Vec<_>) = listings
            .into_iter()
            .partition(|l| required.iter().all(|field| l.has_field(field)));
        let (kept, blacklisted): (Vec<_>, Vec<_>) =
            complete.into_iter().partition(|l| provider.filter(l, blacklist));
        counts.missing_required = incomplete.len();
        counts.blacklisted = blacklisted.len();
        if !incomplete.is_empty() || !blacklisted.is_empty() {
            debug!(
                missing_required = incomplete.len(),
                blacklisted = blacklisted.len(),
                "listings filtered"
            );
        }
        kept
    }

    async fn geocode(&self, listings: &mut [NewListing], counts: &mut RunCounts) {
        for listing in listings.iter_mut() {
            if valid_coordinates(listing.coordinates()).is_some() {
                continue;
            }
            let Some(address) = listing.address.clone().filter(|a| !a.trim().is_empty()) else {
                continue;
            };
            match self.geocoder.geocode(&address).await {
                Ok(Some(coordinates)) => {
                    listing.latitude = Some(coordinates.latitude);
                    listing.longitude = Some(coordinates.longitude);
                    counts.geocoded += 1;
                }
                Ok(None) => debug!(hash = %listing.hash, "address not geocoded"),
                Err(err) => debug!(hash = %listing.hash, error = %err, "geocoding failed"),
            }
        }
    }

    async fn enrich(&self, provider: &dyn Provider, listings: &mut [NewListing], counts: &mut RunCounts) {
        if !provider.supports_details() {
            return;
        }
        for (index, listing) in listings.iter_mut().enumerate() {
            if index > 0 {
                pause(self.detail_delay).await;
            }
            match provider.get_details(listing).await {
                Ok(patch) => {
                    listing.apply_detail(patch);
                    counts.enriched += 1;
                }
                Err(err) => {
                    counts.enrichment_failures += 1;
                    debug!(hash = %listing.hash, error = %err, "detail enrichment failed");
                }
            }
        }
    }

    async fn download_media(&self, provider_id: &str, listings: &mut [NewListing], counts: &mut RunCounts) {
        let mut first = true;
        for listing in listings.iter_mut() {
            if listing.image_urls.is_empty() && listing.documents.is_empty() {
                continue;
            }
            if !first {
                pause(self.media_delay).await;
            }
            first = false;
            match self
                .media
                .download(provider_id, &listing.hash, &listing.image_urls, &listing.documents)
                .await
            {
                Ok(download) => {
                    counts.media_failures += download.failed;
                    listing.image_paths = download.image_paths;
                    listing.document_paths = download.document_paths;
                }
                Err(err) => {
                    counts.media_failures += 1;
                    debug!(hash = %listing.hash, error = %err, "media download failed");
                }
            }
        }
    }

    /// Post-persist upkeep. Failures here leave the rows persisted and are
    /// only logged.
    async fn settle_versions(
        &self,
        job_id: &str,
        plan: &VersionPlan,
        persisted: Vec<Listing>,
        counts: &mut RunCounts,
    ) -> Vec<Listing> {
        match self.linker.resolve_batch_chains(job_id, &plan.pending_edges).await {
            Ok(linked) => counts.chains_resolved = linked,
            Err(err) if err.is_migration_pending() => {
                debug!(error = %err, "versioning schema missing, skipping chain resolution")
            }
            Err(err) => warn!(error = %err, "failed to resolve batch version chains"),
        }

        let mut identities: Vec<String> = persisted
            .iter()
            .filter_map(|l| l.fuzzy_identity.clone())
            .collect();
        identities.sort();
        identities.dedup();
        if identities.is_empty() {
            return persisted;
        }
        if let Err(err) = self.linker.supersede_stale_group_members(job_id, &identities).await {
            warn!(error = %err, "failed to recompute fuzzy-identity group heads");
        }

        let ids: Vec<Uuid> = persisted.iter().map(|l| l.id).collect();
        match self.store.get_listings(&ids).await {
            Ok(rows) => {
                let mut fresh: HashMap<Uuid, Listing> = rows.into_iter().map(|l| (l.id, l)).collect();
                persisted
                    .into_iter()
                    .map(|l| fresh.remove(&l.id).unwrap_or(l))
                    .collect()
            }
            Err(err) => {
                warn!(error = %err, "failed to reload persisted listings");
                persisted
            }
        }
    }

    async fn update_distances(
        &self,
        home: Option<Coordinates>,
        mut listings: Vec<Listing>,
        counts: &mut RunCounts,
    ) -> Vec<Listing> {
        let Some(home) = home else {
            debug!("no home location configured, skipping distances");
            return listings;
        };
        for listing in &mut listings {
            let Some(distance) = listing.coordinates().and_then(|c| distance_between(home, c)) else {
                continue;
            };
            match self.store.update_distance(listing.id, Some(distance)).await {
                Ok(()) => {
                    listing.distance_to_home = Some(distance);
                    counts.distances += 1;
                }
                Err(err) => warn!(listing_id = %listing.id, error = %err, "failed to store distance"),
            }
        }
        listings
    }
}

async fn pause(range: DelayRange) {
    if range.is_zero() {
        return;
    }
    tokio::time::sleep(range.sample()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestwatch_storage::StoreError;

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::CrossPlatform.to_string(), "cross_platform");
        assert_eq!(
            serde_json::to_value(RunOutcome::NoNewListings { stage: Stage::Dedup }).unwrap(),
            serde_json::json!({"outcome": "no_new_listings", "stage": "dedup"})
        );
    }

    #[test]
    fn errors_carry_their_stage() {
        let failed: Result<(), StoreError> = Err(StoreError::NotFound(Uuid::nil()));
        let err = failed.at(Stage::Persist).err().unwrap();
        assert_eq!(err.stage, Stage::Persist);
        assert!(format!("{:#}", err.error).contains("not found"));
    }
}
