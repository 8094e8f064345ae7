//! Postgres-backed [`ListingStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use nestwatch_core::{ChangeSet, EdgeKind, GraphEdge, Listing, ManualLink, NewListing};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{ListingStore, StoreError, StoreResult};

const VERSIONING_COLUMNS: &[&str] = &[
    "property_identity",
    "fuzzy_identity",
    "previous_version_id",
    "is_superseded",
];

const INSERT_VERSIONED: &str = r#"
    INSERT INTO listings (
        id, job_id, hash, provider_id, provider_listing_id, title, description, address, link,
        price, size, rooms, latitude, longitude, image_urls, image_paths, document_paths,
        created_at, published_at, change_set,
        property_identity, fuzzy_identity, previous_version_id
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
            $21, $22, $23)
    ON CONFLICT (job_id, hash) DO NOTHING
    RETURNING *
"#;

const INSERT_LEGACY: &str = r#"
    INSERT INTO listings (
        id, job_id, hash, provider_id, provider_listing_id, title, description, address, link,
        price, size, rooms, latitude, longitude, image_urls, image_paths, document_paths,
        created_at, published_at, change_set
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
    ON CONFLICT (job_id, hash) DO NOTHING
    RETURNING *
"#;

pub struct PgStore {
    pool: PgPool,
    versioning: bool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(StoreError::Database)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let mut store = Self {
            pool,
            versioning: false,
        };
        store.detect_capabilities().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn has_versioning(&self) -> bool {
        self.versioning
    }

    /// Applies `migrations/` and re-checks the schema.
    pub async fn migrate(&mut self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        self.detect_capabilities().await
    }

    async fn detect_capabilities(&mut self) -> StoreResult<()> {
        let columns: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = 'listings'
               AND column_name = ANY($1)
            "#,
        )
        .bind(VERSIONING_COLUMNS)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Database)?;
        let links_table: bool =
            sqlx::query_scalar("SELECT to_regclass('manual_links') IS NOT NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::Database)?;

        self.versioning = columns == VERSIONING_COLUMNS.len() as i64 && links_table;
        if self.versioning {
            info!("listing versioning schema present");
        } else {
            warn!("listing versioning schema missing; identity and version linking disabled until migrated");
        }
        Ok(())
    }

    fn require_versioning(&self) -> StoreResult<()> {
        if self.versioning {
            Ok(())
        } else {
            Err(StoreError::MigrationPending(
                "listings.fuzzy_identity / manual_links".into(),
            ))
        }
    }

    fn listing_from_row(&self, row: &PgRow) -> StoreResult<Listing> {
        let change_set: Json<ChangeSet> = row.try_get("change_set")?;
        let image_urls: Json<Vec<String>> = row.try_get("image_urls")?;
        let image_paths: Json<Vec<String>> = row.try_get("image_paths")?;
        let document_paths: Json<Vec<String>> = row.try_get("document_paths")?;

        let (property_identity, fuzzy_identity, previous_version_id, is_superseded) =
            if self.versioning {
                (
                    row.try_get("property_identity")?,
                    row.try_get("fuzzy_identity")?,
                    row.try_get("previous_version_id")?,
                    row.try_get("is_superseded")?,
                )
            } else {
                (None, None, None, false)
            };

        Ok(Listing {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            hash: row.try_get("hash")?,
            provider_id: row.try_get("provider_id")?,
            provider_listing_id: row.try_get("provider_listing_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            address: row.try_get("address")?,
            link: row.try_get("link")?,
            price: row.try_get("price")?,
            size: row.try_get("size")?,
            rooms: row.try_get("rooms")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            distance_to_home: row.try_get("distance_to_home")?,
            image_urls: image_urls.0,
            image_paths: image_paths.0,
            document_paths: document_paths.0,
            property_identity,
            fuzzy_identity,
            previous_version_id,
            is_superseded,
            is_active: row.try_get("is_active")?,
            manually_deleted: row.try_get("manually_deleted")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            deactivated_at: row.try_get("deactivated_at")?,
            change_set: change_set.0,
        })
    }

    fn listings_from_rows(&self, rows: &[PgRow]) -> StoreResult<Vec<Listing>> {
        rows.iter().map(|row| self.listing_from_row(row)).collect()
    }
}

fn expect_row(id: Uuid, rows_affected: u64) -> StoreResult<()> {
    if rows_affected == 0 {
        Err(StoreError::NotFound(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgStore {
    async fn known_hashes(&self, job_id: &str, provider_id: &str) -> StoreResult<Vec<String>> {
        let hashes = sqlx::query_scalar(
            "SELECT hash FROM listings WHERE job_id = $1 AND provider_id = $2",
        )
        .bind(job_id)
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(hashes)
    }

    async fn persist(
        &self,
        job_id: &str,
        listings: &[NewListing],
        supersede: &[Uuid],
    ) -> StoreResult<Vec<Listing>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(listings.len());

        for listing in listings {
            let sql = if self.versioning {
                INSERT_VERSIONED
            } else {
                INSERT_LEGACY
            };
            let mut query = sqlx::query(sql)
                .bind(Uuid::new_v4())
                .bind(job_id)
                .bind(&listing.hash)
                .bind(&listing.provider_id)
                .bind(&listing.provider_listing_id)
                .bind(&listing.title)
                .bind(&listing.description)
                .bind(&listing.address)
                .bind(&listing.link)
                .bind(listing.price)
                .bind(listing.size)
                .bind(listing.rooms)
                .bind(listing.latitude)
                .bind(listing.longitude)
                .bind(Json(&listing.image_urls))
                .bind(Json(&listing.image_paths))
                .bind(Json(&listing.document_paths))
                .bind(listing.created_at)
                .bind(listing.published_at)
                .bind(Json(&listing.change_set));
            if self.versioning {
                query = query
                    .bind(&listing.property_identity)
                    .bind(&listing.fuzzy_identity)
                    .bind(listing.previous_version_id);
            }
            if let Some(row) = query.fetch_optional(&mut *tx).await? {
                inserted.push(self.listing_from_row(&row)?);
            }
        }

        if self.versioning && !supersede.is_empty() {
            sqlx::query("UPDATE listings SET is_superseded = TRUE WHERE id = ANY($1)")
                .bind(supersede)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_listing(&self, id: Uuid) -> StoreResult<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| self.listing_from_row(&row)).transpose()
    }

    async fn get_listings(&self, ids: &[Uuid]) -> StoreResult<Vec<Listing>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM listings WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        self.listings_from_rows(&rows)
    }

    async fn find_by_hashes(
        &self,
        job_id: &str,
        hashes: &[String],
    ) -> StoreResult<HashMap<String, Listing>> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT * FROM listings WHERE job_id = $1 AND hash = ANY($2)")
            .bind(job_id)
            .bind(hashes)
            .fetch_all(&self.pool)
            .await?;
        Ok(self
            .listings_from_rows(&rows)?
            .into_iter()
            .map(|l| (l.hash.clone(), l))
            .collect())
    }

    async fn find_by_property_identity(
        &self,
        job_id: &str,
        property_identity: &str,
        exclude_hash: &str,
    ) -> StoreResult<Option<Listing>> {
        self.require_versioning()?;
        let row = sqlx::query(
            r#"
            SELECT *
              FROM listings
             WHERE job_id = $1
               AND property_identity = $2
               AND hash <> $3
               AND NOT manually_deleted
             ORDER BY COALESCE(published_at, created_at) DESC, created_at DESC
             LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(property_identity)
        .bind(exclude_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| self.listing_from_row(&row)).transpose()
    }

    async fn find_by_fuzzy_identities(
        &self,
        job_id: &str,
        fuzzy_identities: &[String],
    ) -> StoreResult<HashMap<String, Listing>> {
        self.require_versioning()?;
        if fuzzy_identities.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (fuzzy_identity) *
              FROM listings
             WHERE job_id = $1
               AND fuzzy_identity = ANY($2)
               AND NOT manually_deleted
             ORDER BY fuzzy_identity, COALESCE(published_at, created_at) DESC, created_at DESC
            "#,
        )
        .bind(job_id)
        .bind(fuzzy_identities)
        .fetch_all(&self.pool)
        .await?;
        let mut found = HashMap::new();
        for listing in self.listings_from_rows(&rows)? {
            if let Some(identity) = listing.fuzzy_identity.clone() {
                found.insert(identity, listing);
            }
        }
        Ok(found)
    }

    async fn fuzzy_identity_group(
        &self,
        job_id: &str,
        fuzzy_identity: &str,
    ) -> StoreResult<Vec<Listing>> {
        self.require_versioning()?;
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM listings
             WHERE job_id = $1
               AND fuzzy_identity = $2
               AND NOT manually_deleted
             ORDER BY COALESCE(published_at, created_at), id
            "#,
        )
        .bind(job_id)
        .bind(fuzzy_identity)
        .fetch_all(&self.pool)
        .await?;
        self.listings_from_rows(&rows)
    }

    async fn link_versions(&self, successor: Uuid, predecessor: Uuid) -> StoreResult<()> {
        self.require_versioning()?;
        let mut tx = self.pool.begin().await?;
        let linked = sqlx::query("UPDATE listings SET previous_version_id = $2 WHERE id = $1")
            .bind(successor)
            .bind(predecessor)
            .execute(&mut *tx)
            .await?;
        expect_row(successor, linked.rows_affected())?;
        let superseded = sqlx::query("UPDATE listings SET is_superseded = TRUE WHERE id = $1")
            .bind(predecessor)
            .execute(&mut *tx)
            .await?;
        expect_row(predecessor, superseded.rows_affected())?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_previous_version(&self, id: Uuid, previous: Option<Uuid>) -> StoreResult<()> {
        self.require_versioning()?;
        let result = sqlx::query("UPDATE listings SET previous_version_id = $2 WHERE id = $1")
            .bind(id)
            .bind(previous)
            .execute(&self.pool)
            .await?;
        expect_row(id, result.rows_affected())
    }

    async fn apply_supersession(&self, head: Uuid, members: &[Uuid]) -> StoreResult<()> {
        self.require_versioning()?;
        sqlx::query("UPDATE listings SET is_superseded = (id <> $1) WHERE id = ANY($2)")
            .bind(head)
            .bind(members)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_change_set(&self, id: Uuid, change_set: &ChangeSet) -> StoreResult<()> {
        let result = sqlx::query("UPDATE listings SET change_set = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(change_set))
            .execute(&self.pool)
            .await?;
        expect_row(id, result.rows_affected())
    }

    async fn update_distance(&self, id: Uuid, distance_to_home: Option<f64>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE listings SET distance_to_home = $2 WHERE id = $1")
            .bind(id)
            .bind(distance_to_home)
            .execute(&self.pool)
            .await?;
        expect_row(id, result.rows_affected())
    }

    async fn set_manually_deleted(&self, id: Uuid, deleted: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE listings SET manually_deleted = $2 WHERE id = $1")
            .bind(id)
            .bind(deleted)
            .execute(&self.pool)
            .await?;
        expect_row(id, result.rows_affected())
    }

    async fn edges_touching(&self, ids: &[Uuid]) -> StoreResult<Vec<GraphEdge>> {
        self.require_versioning()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let version_rows = sqlx::query(
            r#"
            SELECT id, previous_version_id
              FROM listings
             WHERE previous_version_id IS NOT NULL
               AND (id = ANY($1) OR previous_version_id = ANY($1))
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        let link_rows = sqlx::query(
            r#"
            SELECT listing_id_low, listing_id_high
              FROM manual_links
             WHERE listing_id_low = ANY($1) OR listing_id_high = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut edges = Vec::with_capacity(version_rows.len() + link_rows.len());
        for row in version_rows {
            edges.push(GraphEdge {
                a: row.try_get("id")?,
                b: row.try_get("previous_version_id")?,
                kind: EdgeKind::Version,
            });
        }
        for row in link_rows {
            edges.push(GraphEdge {
                a: row.try_get("listing_id_low")?,
                b: row.try_get("listing_id_high")?,
                kind: EdgeKind::Manual,
            });
        }
        Ok(edges)
    }

    async fn insert_manual_link(&self, link: &ManualLink) -> StoreResult<bool> {
        self.require_versioning()?;
        let result = sqlx::query(
            r#"
            INSERT INTO manual_links (listing_id_low, listing_id_high, created_by, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (listing_id_low, listing_id_high) DO NOTHING
            "#,
        )
        .bind(link.listing_id_low)
        .bind(link.listing_id_high)
        .bind(&link.created_by)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_manual_link(&self, low: Uuid, high: Uuid) -> StoreResult<bool> {
        self.require_versioning()?;
        let result = sqlx::query(
            "DELETE FROM manual_links WHERE listing_id_low = $1 AND listing_id_high = $2",
        )
        .bind(low)
        .bind(high)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn similarity_candidates(&self, exclude: Uuid, limit: usize) -> StoreResult<Vec<Listing>> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM listings
             WHERE id <> $1
               AND NOT manually_deleted
             ORDER BY created_at DESC, id
             LIMIT $2
            "#,
        )
        .bind(exclude)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        self.listings_from_rows(&rows)
    }
}
