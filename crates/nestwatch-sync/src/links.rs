//! User-driven linking between persisted listings.
//!
//! Every mutation here ends by re-normalizing the affected components so that
//! exactly one member of each stays un-superseded.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use nestwatch_core::{
    find_similar_listings, EdgeKind, GraphEdge, Listing, ManualLink, SimilarMatch,
    SimilarityOptions,
};
use nestwatch_storage::{ListingStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::graph::{select_head, VersionGraph};

/// Candidates pulled from the store for one suggestion query.
pub const SUGGESTION_CANDIDATE_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error("cannot link listing {0} to itself")]
    SelfLink(Uuid),
    #[error("listings {0} and {1} are not linked")]
    NotLinked(Uuid, Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainHead {
    pub head_id: Uuid,
    /// Component members, start node first.
    pub component: Vec<Uuid>,
    pub truncated: bool,
}

/// Structured answer for interactive callers. Failures are reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkResult {
    pub success: bool,
    pub error: Option<String>,
    pub head_id: Option<Uuid>,
    pub component: Vec<Uuid>,
}

impl From<Result<ChainHead, LinkError>> for LinkResult {
    fn from(outcome: Result<ChainHead, LinkError>) -> Self {
        match outcome {
            Ok(head) => LinkResult {
                success: true,
                error: None,
                head_id: Some(head.head_id),
                component: head.component,
            },
            Err(err) => LinkResult {
                success: false,
                error: Some(err.to_string()),
                head_id: None,
                component: Vec::new(),
            },
        }
    }
}

pub struct ManualLinkService {
    store: Arc<dyn ListingStore>,
}

impl ManualLinkService {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    pub async fn find_chain_head(&self, id: Uuid) -> LinkResult {
        self.chain_head(id).await.into()
    }

    pub async fn create_manual_link(&self, a: Uuid, b: Uuid, created_by: &str) -> LinkResult {
        let outcome = self.try_create(a, b, created_by).await;
        if let Err(err) = &outcome {
            warn!(a = %a, b = %b, error = %err, "manual link failed");
        }
        outcome.into()
    }

    /// Detaches `b` from the component it shares with `a`: the direct link
    /// and every other edge bridging `b` into `a`'s side are removed. The
    /// result describes `b`'s component afterwards.
    pub async fn remove_manual_link(&self, a: Uuid, b: Uuid) -> LinkResult {
        let outcome = self.try_remove(a, b).await;
        if let Err(err) = &outcome {
            warn!(a = %a, b = %b, error = %err, "manual unlink failed");
        }
        outcome.into()
    }

    /// Tombstones a listing; its component gets a new head if needed.
    pub async fn delete_listing(&self, id: Uuid) -> LinkResult {
        self.set_deleted(id, true).await.into()
    }

    pub async fn restore_listing(&self, id: Uuid) -> LinkResult {
        self.set_deleted(id, false).await.into()
    }

    /// Ranks live listings by similarity to `id`, skipping its own component.
    pub async fn suggest_links(
        &self,
        id: Uuid,
        options: SimilarityOptions,
    ) -> Result<Vec<SimilarMatch>, LinkError> {
        let target = self.require(id).await?;
        let linked: HashSet<Uuid> = match VersionGraph::load(self.store.as_ref(), id).await {
            Ok(graph) => graph.nodes().iter().copied().collect(),
            Err(err) if err.is_migration_pending() => HashSet::from([id]),
            Err(err) => return Err(err.into()),
        };
        let candidates: Vec<Listing> = self
            .store
            .similarity_candidates(id, SUGGESTION_CANDIDATE_LIMIT)
            .await?
            .into_iter()
            .filter(|c| !linked.contains(&c.id))
            .collect();
        Ok(find_similar_listings(&target, &candidates, options))
    }

    async fn require(&self, id: Uuid) -> Result<Listing, LinkError> {
        self.store.get_listing(id).await?.ok_or(LinkError::NotFound(id))
    }

    async fn chain_head(&self, id: Uuid) -> Result<ChainHead, LinkError> {
        self.require(id).await?;
        let graph = VersionGraph::load(self.store.as_ref(), id).await?;
        let members = self.store.get_listings(graph.nodes()).await?;
        let head = select_head(&members).ok_or(LinkError::NotFound(id))?;
        Ok(ChainHead {
            head_id: head.id,
            component: graph.nodes().to_vec(),
            truncated: graph.is_truncated(),
        })
    }

    async fn try_create(&self, a: Uuid, b: Uuid, created_by: &str) -> Result<ChainHead, LinkError> {
        if a == b {
            return Err(LinkError::SelfLink(a));
        }
        let first = self.require(a).await?;
        let second = self.require(b).await?;

        let link = ManualLink::new(a, b, created_by, Utc::now());
        if !self.store.insert_manual_link(&link).await? {
            debug!(a = %a, b = %b, "manual link already exists");
        }

        let key = |l: &Listing| (l.timeline_at(), l.created_at, l.id);
        let (newer, older) = if key(&second) > key(&first) {
            (second, first)
        } else {
            (first, second)
        };
        if newer.previous_version_id.is_none() && older.previous_version_id != Some(newer.id) {
            self.store.set_previous_version(newer.id, Some(older.id)).await?;
        }

        let head = self.normalize_component(a).await?;
        info!(a = %a, b = %b, head = %head.head_id, size = head.component.len(), "listings linked");
        Ok(head)
    }

    async fn try_remove(&self, a: Uuid, b: Uuid) -> Result<ChainHead, LinkError> {
        if a == b {
            return Err(LinkError::SelfLink(a));
        }
        self.require(a).await?;
        self.require(b).await?;

        let graph = VersionGraph::load(self.store.as_ref(), a).await?;
        if !graph.contains(b) {
            return Err(LinkError::NotLinked(a, b));
        }

        // Every edge from `b` into the part of the component that `a` still
        // reaches without it, direct links included.
        let side_a = graph.component_from(a, Some(b));
        let doomed: Vec<GraphEdge> = graph
            .incident(b)
            .iter()
            .filter(|e| e.other(b).is_some_and(|other| side_a.contains(&other)))
            .copied()
            .collect();
        if doomed.is_empty() {
            return Err(LinkError::NotLinked(a, b));
        }

        for edge in &doomed {
            self.remove_edge(edge).await?;
        }

        self.normalize_component(a).await?;
        let head = self.normalize_component(b).await?;
        info!(a = %a, b = %b, removed = doomed.len(), "listings unlinked");
        Ok(head)
    }

    async fn remove_edge(&self, edge: &GraphEdge) -> Result<(), LinkError> {
        match edge.kind {
            EdgeKind::Manual => {
                self.store.delete_manual_link(edge.a, edge.b).await?;
            }
            EdgeKind::Version => {
                self.store.set_previous_version(edge.a, None).await?;
            }
        }
        Ok(())
    }

    async fn set_deleted(&self, id: Uuid, deleted: bool) -> Result<ChainHead, LinkError> {
        self.require(id).await?;
        self.store.set_manually_deleted(id, deleted).await?;
        match self.normalize_component(id).await {
            Err(LinkError::Store(err)) if err.is_migration_pending() => Ok(ChainHead {
                head_id: id,
                component: vec![id],
                truncated: false,
            }),
            other => other,
        }
    }

    /// Un-supersedes the head of `id`'s component, supersedes everyone else
    /// and folds every member's prices into the head's history.
    async fn normalize_component(&self, id: Uuid) -> Result<ChainHead, LinkError> {
        let graph = VersionGraph::load(self.store.as_ref(), id).await?;
        let mut members = self.store.get_listings(graph.nodes()).await?;
        members.sort_by_key(|l| (l.timeline_at(), l.created_at, l.id));
        let head = select_head(&members).cloned().ok_or(LinkError::NotFound(id))?;

        let ids: Vec<Uuid> = members.iter().map(|l| l.id).collect();
        self.store.apply_supersession(head.id, &ids).await?;

        let mut history = head.change_set.clone();
        let mut changed = false;
        for member in &members {
            changed |= history.merge_price_history(&member.change_set.price_history);
            let Some(price) = member.price else {
                continue;
            };
            // Version detection already recorded the head's current price.
            let recorded = member.id == head.id
                && head.change_set.price_history.last().is_some_and(|p| p.price == price);
            if !recorded {
                changed |= history.record_price(member.created_at, price);
            }
        }
        if changed {
            history.normalize();
            self.store.update_change_set(head.id, &history).await?;
        }

        Ok(ChainHead {
            head_id: head.id,
            component: graph.nodes().to_vec(),
            truncated: graph.is_truncated(),
        })
    }
}
