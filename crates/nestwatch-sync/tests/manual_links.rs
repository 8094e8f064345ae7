use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use nestwatch_core::{Listing, ManualLink, NewListing};
use nestwatch_storage::{ListingStore, MemoryStore};
use nestwatch_sync::{ManualLinkService, VersionGraph};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, d, 12, 0, 0).single().unwrap()
}

async fn seed(store: &MemoryStore, listings: &[(&str, u32, f64)]) -> Vec<Listing> {
    let batch: Vec<NewListing> = listings
        .iter()
        .map(|&(hash, published, price)| {
            let mut l = NewListing::new(hash, "immo-a", format!("Wohnung {hash}"), day(published));
            l.published_at = Some(day(published));
            l.price = Some(price);
            l
        })
        .collect();
    let rows = store.persist("job", &batch, &[]).await.unwrap();
    listings
        .iter()
        .map(|(hash, _, _)| rows.iter().find(|r| r.hash == *hash).unwrap().clone())
        .collect()
}

async fn live_heads(store: &MemoryStore, component_of: Uuid) -> Vec<Uuid> {
    let graph = VersionGraph::load(store, component_of).await.unwrap();
    store
        .get_listings(graph.nodes())
        .await
        .unwrap()
        .into_iter()
        .filter(|l| !l.is_superseded)
        .map(|l| l.id)
        .collect()
}

#[tokio::test]
async fn linking_an_isolated_listing_to_a_chain_elects_one_head() {
    let store = Arc::new(MemoryStore::new());
    let service = ManualLinkService::new(store.clone());
    let rows = seed(&store, &[("p", 1, 1100.0), ("a", 2, 1150.0), ("c", 5, 1200.0)]).await;
    let (p, a, c) = (rows[0].id, rows[1].id, rows[2].id);
    store.link_versions(a, p).await.unwrap();

    let result = service.create_manual_link(a, c, "alex").await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.head_id, Some(c));
    assert_eq!(result.component.iter().copied().collect::<HashSet<_>>(), HashSet::from([p, a, c]));
    assert_eq!(live_heads(&store, p).await, vec![c]);

    let head = store.get_listing(c).await.unwrap().unwrap();
    assert_eq!(head.previous_version_id, Some(a));
    let prices: Vec<f64> = head.change_set.price_history.iter().map(|pt| pt.price).collect();
    assert_eq!(prices, vec![1100.0, 1150.0, 1200.0]);
}

#[tokio::test]
async fn transitive_unlink_removes_the_bridging_edge() {
    let store = Arc::new(MemoryStore::new());
    let service = ManualLinkService::new(store.clone());
    let rows = seed(&store, &[("a", 1, 900.0), ("c", 2, 950.0), ("b", 3, 990.0)]).await;
    let (a, c, b) = (rows[0].id, rows[1].id, rows[2].id);

    // b -> a by version, a <-> c by a manual link; b and c share no edge.
    store.link_versions(b, a).await.unwrap();
    store
        .insert_manual_link(&ManualLink::new(a, c, "alex", Utc::now()))
        .await
        .unwrap();
    assert_eq!(service.find_chain_head(c).await.head_id, Some(b));

    let result = service.remove_manual_link(c, b).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.head_id, Some(b));
    assert_eq!(result.component, vec![b]);

    let detached = store.get_listing(b).await.unwrap().unwrap();
    assert_eq!(detached.previous_version_id, None);
    assert!(!detached.is_superseded);

    assert_eq!(store.manual_links().await.len(), 1);
    assert_eq!(live_heads(&store, a).await, vec![c]);
    assert_eq!(service.find_chain_head(a).await.head_id, Some(c));
}

#[tokio::test]
async fn direct_manual_link_is_removed_when_present() {
    let store = Arc::new(MemoryStore::new());
    let service = ManualLinkService::new(store.clone());
    let rows = seed(&store, &[("a", 1, 900.0), ("b", 2, 900.0)]).await;
    let (a, b) = (rows[0].id, rows[1].id);

    assert!(service.create_manual_link(a, b, "alex").await.success);
    let result = service.remove_manual_link(a, b).await;

    assert!(result.success);
    assert!(store.manual_links().await.is_empty());
    assert_eq!(store.get_listing(b).await.unwrap().unwrap().previous_version_id, None);
    assert_eq!(live_heads(&store, a).await, vec![a]);
    assert_eq!(live_heads(&store, b).await, vec![b]);
}

#[tokio::test]
async fn unlinking_detaches_b_even_with_a_version_path_back_to_a() {
    let store = Arc::new(MemoryStore::new());
    let service = ManualLinkService::new(store.clone());
    let rows = seed(&store, &[("a", 1, 900.0), ("x", 2, 920.0), ("b", 3, 940.0)]).await;
    let (a, x, b) = (rows[0].id, rows[1].id, rows[2].id);
    store.link_versions(x, a).await.unwrap();
    store.link_versions(b, x).await.unwrap();
    assert!(service.create_manual_link(a, b, "alex").await.success);

    let result = service.remove_manual_link(a, b).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.head_id, Some(b));
    assert_eq!(result.component, vec![b]);
    assert!(store.manual_links().await.is_empty());
    assert_eq!(store.get_listing(b).await.unwrap().unwrap().previous_version_id, None);
    assert_eq!(live_heads(&store, b).await, vec![b]);

    let rest = VersionGraph::load(store.as_ref(), a).await.unwrap();
    assert_eq!(rest.nodes().iter().copied().collect::<HashSet<_>>(), HashSet::from([a, x]));
    assert_eq!(live_heads(&store, a).await, vec![x]);
}

#[tokio::test]
async fn every_component_keeps_exactly_one_head() {
    let store = Arc::new(MemoryStore::new());
    let service = ManualLinkService::new(store.clone());
    let rows = seed(
        &store,
        &[
            ("l0", 1, 800.0),
            ("l1", 4, 810.0),
            ("l2", 2, 820.0),
            ("l3", 9, 830.0),
            ("l4", 6, 840.0),
            ("l5", 3, 850.0),
        ],
    )
    .await;
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..60 {
        let i = rng.gen_range(0..ids.len());
        let j = rng.gen_range(0..ids.len());
        match rng.gen_range(0..5) {
            0 | 1 => {
                service.create_manual_link(ids[i], ids[j], "fuzzer").await;
            }
            2 | 3 => {
                service.remove_manual_link(ids[i], ids[j]).await;
            }
            _ => {
                let deleted = store.get_listing(ids[i]).await.unwrap().unwrap().manually_deleted;
                if deleted {
                    service.restore_listing(ids[i]).await;
                } else {
                    service.delete_listing(ids[i]).await;
                }
            }
        }

        for &id in &ids {
            assert_eq!(live_heads(&store, id).await.len(), 1, "component of {id}");
        }
    }
}
