//! Version detection for freshly fetched listings and post-persist chain upkeep.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nestwatch_core::{
    compute_fuzzy_identity, compute_property_identity, ChangeSet, EdgeKind, GraphEdge, Listing,
    NewListing, PendingVersionEdge,
};
use nestwatch_storage::{ListingStore, StoreResult};
use tracing::{debug, warn};
use uuid::Uuid;

/// Links decided before persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionPlan {
    /// Edges between batch members, resolved once both rows exist.
    pub pending_edges: Vec<PendingVersionEdge>,
    /// Already persisted predecessors, superseded inside the persist transaction.
    pub supersede: Vec<Uuid>,
}

impl VersionPlan {
    pub fn is_empty(&self) -> bool {
        self.pending_edges.is_empty() && self.supersede.is_empty()
    }
}

pub struct VersionLinker {
    store: Arc<dyn ListingStore>,
}

impl VersionLinker {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    pub fn assign_identities(listings: &mut [NewListing]) {
        for listing in listings {
            listing.property_identity = compute_property_identity(listing);
            listing.fuzzy_identity = compute_fuzzy_identity(listing);
        }
    }

    /// Strict single-listing path: the newest live listing of the job with the
    /// same property identity and another hash becomes the predecessor.
    pub async fn detect_version(
        &self,
        job_id: &str,
        listing: &mut NewListing,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Uuid>> {
        let Some(predecessor) = self.strict_predecessor(job_id, listing).await? else {
            return Ok(None);
        };
        link_to_persisted(listing, &predecessor, now);
        Ok(Some(predecessor.id))
    }

    async fn strict_predecessor(
        &self,
        job_id: &str,
        listing: &mut NewListing,
    ) -> StoreResult<Option<Listing>> {
        if listing.property_identity.is_none() {
            listing.property_identity = compute_property_identity(listing);
        }
        let Some(identity) = listing.property_identity.as_deref() else {
            return Ok(None);
        };
        self.store
            .find_by_property_identity(job_id, identity, &listing.hash)
            .await
    }

    /// Groups the batch by fuzzy identity, chains each group newest to
    /// oldest, and hangs the oldest member of every group off the newest
    /// persisted listing with the same identity. Listings without a fuzzy
    /// identity fall back to the strict identity lookup.
    ///
    /// A persisted listing is claimed by at most one batch member. When
    /// several chains resolve to the same predecessor they are ordered by
    /// their oldest member and stacked, so the component keeps one head.
    ///
    /// Nothing is written. The returned plan carries the in-batch edges and
    /// the persisted predecessors to supersede.
    pub async fn detect_versions_with_batch_awareness(
        &self,
        job_id: &str,
        listings: &mut [NewListing],
        now: DateTime<Utc>,
    ) -> StoreResult<VersionPlan> {
        Self::assign_identities(listings);

        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut chains: Vec<Vec<usize>> = Vec::new();
        for (index, listing) in listings.iter().enumerate() {
            match &listing.fuzzy_identity {
                Some(identity) => groups.entry(identity.clone()).or_default().push(index),
                None => chains.push(vec![index]),
            }
        }

        let identities: Vec<String> = groups.keys().cloned().collect();
        let existing = self.store.find_by_fuzzy_identities(job_id, &identities).await?;

        // Each candidate chain is oldest member first.
        let mut candidates: Vec<(Option<Listing>, Vec<usize>)> = Vec::new();
        for (identity, mut members) in groups {
            members.sort_by_key(|&i| listings[i].published_at.map_or(0, |p| p.timestamp_millis()));
            let predecessor = match existing.get(&identity) {
                Some(found) => Some(found.clone()),
                None => self.strict_predecessor(job_id, &mut listings[members[0]]).await?,
            };
            candidates.push((predecessor, members));
        }
        for members in chains {
            let predecessor = self.strict_predecessor(job_id, &mut listings[members[0]]).await?;
            candidates.push((predecessor, members));
        }

        let chain_count = candidates.len();
        let mut claims: BTreeMap<Uuid, (Listing, Vec<Vec<usize>>)> = BTreeMap::new();
        let mut unclaimed = Vec::new();
        for (predecessor, members) in candidates {
            match predecessor {
                Some(found) => claims
                    .entry(found.id)
                    .or_insert_with(|| (found, Vec::new()))
                    .1
                    .push(members),
                None => unclaimed.push(members),
            }
        }

        let mut plan = VersionPlan::default();
        for members in &unclaimed {
            chain_within_batch(listings, members, now, &mut plan);
        }
        for (predecessor, mut claimants) in claims.into_values() {
            claimants.sort_by(|left, right| {
                let (a, b) = (&listings[left[0]], &listings[right[0]]);
                (a.timeline_at(), &a.hash).cmp(&(b.timeline_at(), &b.hash))
            });
            link_to_persisted(&mut listings[claimants[0][0]], &predecessor, now);
            plan.supersede.push(predecessor.id);
            for (index, members) in claimants.iter().enumerate() {
                if index > 0 {
                    let tail = claimants[index - 1][claimants[index - 1].len() - 1];
                    link_within_batch(listings, members[0], tail, now, &mut plan);
                }
                chain_within_batch(listings, members, now, &mut plan);
            }
        }

        debug!(
            job_id,
            chains = chain_count,
            pending_edges = plan.pending_edges.len(),
            superseded = plan.supersede.len(),
            "version detection finished"
        );
        Ok(plan)
    }

    /// Turns in-batch edges into `previous_version_id` updates after the
    /// batch is persisted. Edges whose rows cannot be found are dropped.
    pub async fn resolve_batch_chains(
        &self,
        job_id: &str,
        edges: &[PendingVersionEdge],
    ) -> StoreResult<usize> {
        if edges.is_empty() {
            return Ok(0);
        }
        let mut hashes: Vec<String> = edges
            .iter()
            .flat_map(|e| [e.successor_hash.clone(), e.predecessor_hash.clone()])
            .collect();
        hashes.sort();
        hashes.dedup();
        let rows = self.store.find_by_hashes(job_id, &hashes).await?;

        let mut linked = 0;
        for edge in edges {
            let (Some(successor), Some(predecessor)) =
                (rows.get(&edge.successor_hash), rows.get(&edge.predecessor_hash))
            else {
                debug!(
                    job_id,
                    successor = %edge.successor_hash,
                    predecessor = %edge.predecessor_hash,
                    "dropping unresolved version edge"
                );
                continue;
            };
            match self.store.link_versions(successor.id, predecessor.id).await {
                Ok(()) => linked += 1,
                Err(err) if err.is_migration_pending() => return Err(err),
                Err(err) => warn!(
                    job_id,
                    successor = %successor.id,
                    predecessor = %predecessor.id,
                    error = %err,
                    "failed to link batch versions"
                ),
            }
        }
        Ok(linked)
    }

    /// For every fuzzy-identity group, keeps the newest member that no
    /// listing points back to and supersedes the rest. A group whose chain
    /// continues into another group is left as it is. Returns the number of
    /// groups touched.
    pub async fn supersede_stale_group_members(
        &self,
        job_id: &str,
        fuzzy_identities: &[String],
    ) -> StoreResult<usize> {
        let unique: BTreeSet<&String> = fuzzy_identities.iter().collect();
        let mut touched = 0;
        for identity in unique {
            let group = self.store.fuzzy_identity_group(job_id, identity).await?;
            if group.len() < 2 {
                continue;
            }
            let members: Vec<Uuid> = group.iter().map(|l| l.id).collect();
            let edges = self.store.edges_touching(&members).await?;
            let Some(head) = group_head(&group, &edges) else {
                continue;
            };
            self.store.apply_supersession(head, &members).await?;
            touched += 1;
        }
        Ok(touched)
    }
}

fn group_head(group: &[Listing], edges: &[GraphEdge]) -> Option<Uuid> {
    let members: HashSet<Uuid> = group.iter().map(|l| l.id).collect();
    let mut referenced = HashSet::new();
    let mut continues_elsewhere = false;
    for edge in edges
        .iter()
        .filter(|e| e.kind == EdgeKind::Version && members.contains(&e.b))
    {
        referenced.insert(edge.b);
        continues_elsewhere |= !members.contains(&edge.a);
    }
    if let Some(head) = newest_id(group.iter().filter(|l| !referenced.contains(&l.id))) {
        return Some(head);
    }
    // Everyone is a predecessor: either the head sits outside the group or
    // the group is a cycle, which falls back to its newest member.
    if continues_elsewhere {
        None
    } else {
        newest_id(group.iter())
    }
}

fn newest_id<'a>(listings: impl Iterator<Item = &'a Listing>) -> Option<Uuid> {
    listings
        .max_by_key(|l| (l.timeline_at(), l.created_at, l.id))
        .map(|l| l.id)
}

fn link_to_persisted(listing: &mut NewListing, predecessor: &Listing, now: DateTime<Utc>) {
    listing.previous_version_id = Some(predecessor.id);
    let price = listing.price;
    merge_price_history(
        &mut listing.change_set,
        &predecessor.change_set,
        predecessor.created_at,
        predecessor.price,
        price,
        now,
    );
}

/// Links consecutive members of an oldest-first chain, oldest pair first so
/// each successor inherits the full history.
fn chain_within_batch(
    listings: &mut [NewListing],
    members: &[usize],
    now: DateTime<Utc>,
    plan: &mut VersionPlan,
) {
    for pair in members.windows(2) {
        link_within_batch(listings, pair[1], pair[0], now, plan);
    }
}

fn link_within_batch(
    listings: &mut [NewListing],
    successor: usize,
    predecessor: usize,
    now: DateTime<Utc>,
    plan: &mut VersionPlan,
) {
    let older = listings[predecessor].clone();
    let price = listings[successor].price;
    merge_price_history(
        &mut listings[successor].change_set,
        &older.change_set,
        older.timeline_at(),
        older.price,
        price,
        now,
    );
    plan.pending_edges.push(PendingVersionEdge {
        successor_hash: listings[successor].hash.clone(),
        predecessor_hash: older.hash,
    });
}

/// Carries the predecessor's history forward, then records the predecessor's
/// own price at `predecessor_date` and the successor's price at `now`.
/// Predecessor points dated `now` belong to its own successor entry and are skipped.
pub fn merge_price_history(
    target: &mut ChangeSet,
    predecessor: &ChangeSet,
    predecessor_date: DateTime<Utc>,
    predecessor_price: Option<f64>,
    price: Option<f64>,
    now: DateTime<Utc>,
) {
    let carried: Vec<_> = predecessor
        .price_history
        .iter()
        .filter(|p| p.date != now)
        .cloned()
        .collect();
    target.merge_price_history(&carried);
    if let Some(previous) = predecessor_price {
        target.record_price(predecessor_date, previous);
    }
    if let Some(current) = price {
        target.record_price(now, current);
    }
    target.normalize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nestwatch_core::PricePoint;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn price_history_merges_without_duplicates() {
        let mut predecessor = ChangeSet::default();
        predecessor.record_price(ts(100), 1000.0);
        predecessor.record_price(ts(500), 1100.0);

        let mut target = ChangeSet::default();
        merge_price_history(&mut target, &predecessor, ts(200), Some(1100.0), Some(1150.0), ts(500));

        let points: Vec<(i64, f64)> = target
            .price_history
            .iter()
            .map(|p| (p.date.timestamp(), p.price))
            .collect();
        assert_eq!(points, vec![(100, 1000.0), (200, 1100.0), (500, 1150.0)]);
    }

    #[test]
    fn unknown_prices_record_nothing() {
        let mut target = ChangeSet {
            price_history: vec![PricePoint { date: ts(1), price: 1.0 }],
            ..ChangeSet::default()
        };
        merge_price_history(&mut target, &ChangeSet::default(), ts(2), None, None, ts(3));
        assert_eq!(target.price_history.len(), 1);
    }

    fn version_edge(successor: &Listing, predecessor: &Listing) -> GraphEdge {
        GraphEdge {
            a: successor.id,
            b: predecessor.id,
            kind: EdgeKind::Version,
        }
    }

    #[test]
    fn group_head_skips_referenced_members() {
        let old = Listing::from_new(Uuid::new_v4(), "job", NewListing::new("a", "p", "t", ts(100)));
        let mut newer = Listing::from_new(Uuid::new_v4(), "job", NewListing::new("b", "p", "t", ts(50)));
        newer.published_at = Some(ts(200));
        let group = [old.clone(), newer.clone()];
        assert_eq!(group_head(&group, &[]), Some(newer.id));

        // `newer` is `old`'s predecessor, so `old` heads the group.
        assert_eq!(group_head(&group, &[version_edge(&old, &newer)]), Some(old.id));

        // A cycle references everybody; fall back to the newest.
        let cycle = [version_edge(&old, &newer), version_edge(&newer, &old)];
        assert_eq!(group_head(&group, &cycle), Some(newer.id));

        // The chain continues in another group, whose head wins.
        let outsider = Listing::from_new(Uuid::new_v4(), "job", NewListing::new("c", "p", "t", ts(300)));
        let chain = [version_edge(&old, &newer), version_edge(&outsider, &old)];
        assert_eq!(group_head(&group, &chain), None);
    }
}
