//! In-process [`ListingStore`] used when no `DATABASE_URL` is configured and in tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use nestwatch_core::{ChangeSet, EdgeKind, GraphEdge, Listing, ManualLink, NewListing};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{ListingStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct State {
    listings: HashMap<Uuid, Listing>,
    by_hash: HashMap<(String, String), Uuid>,
    links: BTreeMap<(Uuid, Uuid), ManualLink>,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<State>,
    versioning: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            versioning: true,
        }
    }

    /// Behaves like a database whose versioning migration has not run.
    pub fn without_versioning() -> Self {
        Self {
            state: RwLock::new(State::default()),
            versioning: false,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.listings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all_listings(&self) -> Vec<Listing> {
        let mut all: Vec<Listing> = self.state.read().await.listings.values().cloned().collect();
        all.sort_by_key(|l| (l.created_at, l.id));
        all
    }

    pub async fn manual_links(&self) -> Vec<ManualLink> {
        self.state.read().await.links.values().cloned().collect()
    }

    fn require_versioning(&self) -> StoreResult<()> {
        if self.versioning {
            Ok(())
        } else {
            Err(StoreError::MigrationPending(
                "column \"fuzzy_identity\" does not exist".into(),
            ))
        }
    }
}

fn newest<'a>(listings: impl Iterator<Item = &'a Listing>) -> Option<&'a Listing> {
    listings.max_by_key(|l| (l.timeline_at(), l.created_at, l.id))
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn known_hashes(&self, job_id: &str, provider_id: &str) -> StoreResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .listings
            .values()
            .filter(|l| l.job_id == job_id && l.provider_id == provider_id)
            .map(|l| l.hash.clone())
            .collect())
    }

    async fn persist(
        &self,
        job_id: &str,
        listings: &[NewListing],
        supersede: &[Uuid],
    ) -> StoreResult<Vec<Listing>> {
        let mut state = self.state.write().await;
        let mut inserted = Vec::new();
        for new in listings {
            let key = (job_id.to_string(), new.hash.clone());
            if state.by_hash.contains_key(&key) {
                continue;
            }
            let mut new = new.clone();
            if !self.versioning {
                new.property_identity = None;
                new.fuzzy_identity = None;
                new.previous_version_id = None;
            }
            let listing = Listing::from_new(Uuid::new_v4(), job_id, new);
            state.by_hash.insert(key, listing.id);
            state.listings.insert(listing.id, listing.clone());
            inserted.push(listing);
        }
        if self.versioning {
            for id in supersede {
                if let Some(listing) = state.listings.get_mut(id) {
                    listing.is_superseded = true;
                }
            }
        }
        Ok(inserted)
    }

    async fn get_listing(&self, id: Uuid) -> StoreResult<Option<Listing>> {
        Ok(self.state.read().await.listings.get(&id).cloned())
    }

    async fn get_listings(&self, ids: &[Uuid]) -> StoreResult<Vec<Listing>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.listings.get(id).cloned())
            .collect())
    }

    async fn find_by_hashes(
        &self,
        job_id: &str,
        hashes: &[String],
    ) -> StoreResult<HashMap<String, Listing>> {
        let state = self.state.read().await;
        let mut found = HashMap::new();
        for hash in hashes {
            if let Some(listing) = state
                .by_hash
                .get(&(job_id.to_string(), hash.clone()))
                .and_then(|id| state.listings.get(id))
            {
                found.insert(hash.clone(), listing.clone());
            }
        }
        Ok(found)
    }

    async fn find_by_property_identity(
        &self,
        job_id: &str,
        property_identity: &str,
        exclude_hash: &str,
    ) -> StoreResult<Option<Listing>> {
        self.require_versioning()?;
        let state = self.state.read().await;
        Ok(newest(state.listings.values().filter(|l| {
            l.job_id == job_id
                && !l.manually_deleted
                && l.hash != exclude_hash
                && l.property_identity.as_deref() == Some(property_identity)
        }))
        .cloned())
    }

    async fn find_by_fuzzy_identities(
        &self,
        job_id: &str,
        fuzzy_identities: &[String],
    ) -> StoreResult<HashMap<String, Listing>> {
        self.require_versioning()?;
        let state = self.state.read().await;
        let mut found = HashMap::new();
        for identity in fuzzy_identities {
            let hit = newest(state.listings.values().filter(|l| {
                l.job_id == job_id
                    && !l.manually_deleted
                    && l.fuzzy_identity.as_deref() == Some(identity.as_str())
            }));
            if let Some(listing) = hit {
                found.insert(identity.clone(), listing.clone());
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
        let state = self.state.read().await;
        let mut group: Vec<Listing> = state
            .listings
            .values()
            .filter(|l| {
                l.job_id == job_id
                    && !l.manually_deleted
                    && l.fuzzy_identity.as_deref() == Some(fuzzy_identity)
            })
            .cloned()
            .collect();
        group.sort_by_key(|l| (l.timeline_at(), l.id));
        Ok(group)
    }

    async fn link_versions(&self, successor: Uuid, predecessor: Uuid) -> StoreResult<()> {
        self.require_versioning()?;
        let mut state = self.state.write().await;
        if !state.listings.contains_key(&predecessor) {
            return Err(StoreError::NotFound(predecessor));
        }
        let next = state
            .listings
            .get_mut(&successor)
            .ok_or(StoreError::NotFound(successor))?;
        next.previous_version_id = Some(predecessor);
        if let Some(prev) = state.listings.get_mut(&predecessor) {
            prev.is_superseded = true;
        }
        Ok(())
    }

    async fn set_previous_version(&self, id: Uuid, previous: Option<Uuid>) -> StoreResult<()> {
        self.require_versioning()?;
        let mut state = self.state.write().await;
        let listing = state.listings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        listing.previous_version_id = previous;
        Ok(())
    }

    async fn apply_supersession(&self, head: Uuid, members: &[Uuid]) -> StoreResult<()> {
        self.require_versioning()?;
        let mut state = self.state.write().await;
        for id in members {
            if let Some(listing) = state.listings.get_mut(id) {
                listing.is_superseded = *id != head;
            }
        }
        Ok(())
    }

    async fn update_change_set(&self, id: Uuid, change_set: &ChangeSet) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let listing = state.listings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        listing.change_set = change_set.clone();
        Ok(())
    }

    async fn update_distance(&self, id: Uuid, distance_to_home: Option<f64>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let listing = state.listings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        listing.distance_to_home = distance_to_home;
        Ok(())
    }

    async fn set_manually_deleted(&self, id: Uuid, deleted: bool) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let listing = state.listings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        listing.manually_deleted = deleted;
        Ok(())
    }

    async fn edges_touching(&self, ids: &[Uuid]) -> StoreResult<Vec<GraphEdge>> {
        self.require_versioning()?;
        let wanted: HashSet<Uuid> = ids.iter().copied().collect();
        let state = self.state.read().await;
        let mut edges: Vec<GraphEdge> = state
            .listings
            .values()
            .filter_map(|l| l.previous_version_id.map(|prev| (l.id, prev)))
            .filter(|(id, prev)| wanted.contains(id) || wanted.contains(prev))
            .map(|(a, b)| GraphEdge {
                a,
                b,
                kind: EdgeKind::Version,
            })
            .collect();
        edges.extend(
            state
                .links
                .keys()
                .filter(|(low, high)| wanted.contains(low) || wanted.contains(high))
                .map(|&(a, b)| GraphEdge {
                    a,
                    b,
                    kind: EdgeKind::Manual,
                }),
        );
        Ok(edges)
    }

    async fn insert_manual_link(&self, link: &ManualLink) -> StoreResult<bool> {
        self.require_versioning()?;
        let mut state = self.state.write().await;
        for id in [link.listing_id_low, link.listing_id_high] {
            if !state.listings.contains_key(&id) {
                return Err(StoreError::NotFound(id));
            }
        }
        let key = (link.listing_id_low, link.listing_id_high);
        if state.links.contains_key(&key) {
            return Ok(false);
        }
        state.links.insert(key, link.clone());
        Ok(true)
    }

    async fn delete_manual_link(&self, low: Uuid, high: Uuid) -> StoreResult<bool> {
        self.require_versioning()?;
        Ok(self.state.write().await.links.remove(&(low, high)).is_some())
    }

    async fn similarity_candidates(&self, exclude: Uuid, limit: usize) -> StoreResult<Vec<Listing>> {
        let state = self.state.read().await;
        let mut candidates: Vec<Listing> = state
            .listings
            .values()
            .filter(|l| l.id != exclude && !l.manually_deleted)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        candidates.truncate(limit);
        Ok(candidates)
    }
}
