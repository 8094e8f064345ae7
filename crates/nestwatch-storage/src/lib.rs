//! Listing persistence, media storage and HTTP plumbing for nestwatch.

use std::collections::HashMap;

use async_trait::async_trait;
use nestwatch_core::{ChangeSet, GraphEdge, Listing, ManualLink, NewListing};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod media;
pub mod memory;
pub mod postgres;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use media::{HttpMediaDownloader, MediaDownload, MediaDownloader, MediaStore, NoopMediaDownloader};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "nestwatch-storage";

/// Postgres SQLSTATEs raised when the identity/versioning migration is missing.
const UNDEFINED_COLUMN: &str = "42703";
const UNDEFINED_TABLE: &str = "42P01";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Identity/versioning columns or the manual link table do not exist yet.
    #[error("listing versioning schema is not migrated: {0}")]
    MigrationPending(String),
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_migration_pending(&self) -> bool {
        matches!(self, StoreError::MigrationPending(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if matches!(db.code().as_deref(), Some(UNDEFINED_COLUMN | UNDEFINED_TABLE)) {
                return StoreError::MigrationPending(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the pipeline, version linker and link service need from storage.
///
/// Listings are unique per `(job_id, hash)`. Methods touching identity or
/// version columns return [`StoreError::MigrationPending`] on a schema that
/// predates them.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn known_hashes(&self, job_id: &str, provider_id: &str) -> StoreResult<Vec<String>>;

    /// Inserts the batch and flags `supersede` ids as superseded in one
    /// transaction. Hashes already present are skipped. Returns inserted rows.
    async fn persist(
        &self,
        job_id: &str,
        listings: &[NewListing],
        supersede: &[Uuid],
    ) -> StoreResult<Vec<Listing>>;

    async fn get_listing(&self, id: Uuid) -> StoreResult<Option<Listing>>;

    /// Rows for `ids` that exist, in no particular order.
    async fn get_listings(&self, ids: &[Uuid]) -> StoreResult<Vec<Listing>>;

    async fn find_by_hashes(
        &self,
        job_id: &str,
        hashes: &[String],
    ) -> StoreResult<HashMap<String, Listing>>;

    /// Newest non-deleted listing with the given strict identity.
    async fn find_by_property_identity(
        &self,
        job_id: &str,
        property_identity: &str,
        exclude_hash: &str,
    ) -> StoreResult<Option<Listing>>;

    /// Newest non-deleted listing per fuzzy identity.
    async fn find_by_fuzzy_identities(
        &self,
        job_id: &str,
        fuzzy_identities: &[String],
    ) -> StoreResult<HashMap<String, Listing>>;

    /// All non-deleted listings of a job sharing a fuzzy identity.
    async fn fuzzy_identity_group(
        &self,
        job_id: &str,
        fuzzy_identity: &str,
    ) -> StoreResult<Vec<Listing>>;

    /// Sets `successor.previous_version_id` and supersedes the predecessor together.
    async fn link_versions(&self, successor: Uuid, predecessor: Uuid) -> StoreResult<()>;

    /// Rewrites `previous_version_id` without touching supersession flags.
    async fn set_previous_version(&self, id: Uuid, previous: Option<Uuid>) -> StoreResult<()>;

    /// Marks `head` current and every other member superseded in one statement.
    async fn apply_supersession(&self, head: Uuid, members: &[Uuid]) -> StoreResult<()>;

    async fn update_change_set(&self, id: Uuid, change_set: &ChangeSet) -> StoreResult<()>;

    async fn update_distance(&self, id: Uuid, distance_to_home: Option<f64>) -> StoreResult<()>;

    async fn set_manually_deleted(&self, id: Uuid, deleted: bool) -> StoreResult<()>;

    /// Version and manual edges incident to any of `ids`.
    async fn edges_touching(&self, ids: &[Uuid]) -> StoreResult<Vec<GraphEdge>>;

    /// Returns `false` when the pair already existed.
    async fn insert_manual_link(&self, link: &ManualLink) -> StoreResult<bool>;

    /// Returns `false` when no such link existed.
    async fn delete_manual_link(&self, low: Uuid, high: Uuid) -> StoreResult<bool>;

    /// Non-deleted listings other than `exclude`, newest first.
    async fn similarity_candidates(&self, exclude: Uuid, limit: usize) -> StoreResult<Vec<Listing>>;
}
