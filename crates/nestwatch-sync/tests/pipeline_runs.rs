use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nestwatch_adapters::{
    AdapterError, FetchRequest, FixtureFile, FixtureProvider, Notification, NotificationAdapter,
    NotificationDispatcher, Provider, ProviderSettings, StaticGeocoder,
};
use nestwatch_core::{Blacklist, Coordinates, RawListing};
use nestwatch_storage::{ListingStore, MemoryStore};
use nestwatch_sync::{DelayRange, Pipeline, RunOutcome, RunRequest, Stage, SyncConfig, SyncService};
use serde_json::{json, Value as JsonValue};

const SEARCH_URL: &str = "https://immo.example/search?city=berlin";

#[derive(Default)]
struct CountingNotifier {
    listings: AtomicUsize,
}

#[async_trait]
impl NotificationAdapter for CountingNotifier {
    fn name(&self) -> &str {
        "counting"
    }

    async fn send(&self, notification: &Notification<'_>) -> Result<(), AdapterError> {
        self.listings.fetch_add(notification.listings.len(), Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenNotifier;

#[async_trait]
impl NotificationAdapter for BrokenNotifier {
    fn name(&self) -> &str {
        "broken"
    }

    async fn send(&self, _notification: &Notification<'_>) -> Result<(), AdapterError> {
        Err(AdapterError::Notification {
            adapter: "broken".into(),
            message: "connection refused".into(),
        })
    }
}

struct UnreachableProvider;

#[async_trait]
impl Provider for UnreachableProvider {
    fn provider_id(&self) -> &str {
        "immo-down"
    }

    fn required_fields(&self) -> &[String] {
        &[]
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<Vec<RawListing>, AdapterError> {
        Err(AdapterError::Other(anyhow::anyhow!("upstream answered 503")))
    }
}

fn fixture(id: &str, pages: Vec<Vec<JsonValue>>) -> FixtureProvider {
    let file = FixtureFile {
        pages,
        ..Default::default()
    };
    FixtureProvider::from_file(id, file, ProviderSettings::default())
}

fn two_flats() -> Vec<Vec<JsonValue>> {
    vec![vec![
        json!({
            "id": "101",
            "title": "Altbau mit Balkon",
            "price": 1200,
            "address": "Musterstr. 12, 10115 Berlin",
            "size": 70,
            "rooms": 3
        }),
        json!({
            "id": "102",
            "title": "Neubau am Park",
            "price": "1.480",
            "address": {"street": "Parkweg 3", "zip": "10437", "city": "Berlin"},
            "size": 82,
            "rooms": 3,
            "latitude": 52.5440,
            "longitude": 13.4130
        }),
    ]]
}

fn request<'a>(provider: &'a dyn Provider, notifier: &'a NotificationDispatcher) -> RunRequest<'a> {
    RunRequest {
        job_id: "berlin",
        search_url: SEARCH_URL,
        provider,
        blacklist: Blacklist::default(),
        full_fetch: false,
        home: None,
        notifier,
    }
}

fn notified(outcome: &RunOutcome) -> usize {
    match outcome {
        RunOutcome::Notified { listings } => listings.len(),
        other => panic!("expected notified run, got {other:?}"),
    }
}

#[tokio::test]
async fn second_run_over_the_same_results_finds_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let counter = Arc::new(CountingNotifier::default());
    let notifier = NotificationDispatcher::new(vec![counter.clone()]);
    let provider = fixture("immo-a", two_flats());

    let first = pipeline.run(&request(&provider, &notifier)).await;
    assert_eq!(notified(&first.outcome), 2);
    assert_eq!(first.counts.fetched, 2);
    assert_eq!(first.counts.persisted, 2);
    assert_eq!(counter.listings.load(Ordering::SeqCst), 2);

    let second = pipeline.run(&request(&provider, &notifier)).await;
    assert_eq!(second.outcome, RunOutcome::NoNewListings { stage: Stage::Dedup });
    assert_eq!(store.len().await, 2);
    assert_eq!(counter.listings.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn incomplete_and_blacklisted_listings_are_filtered() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let notifier = NotificationDispatcher::default();
    let mut pages = two_flats();
    pages[0].push(json!({"id": "103", "title": "WG-Zimmer frei", "price": 450}));
    pages[0].push(json!({"id": "104", "title": "Dachgeschoss ohne Preis"}));
    let settings = ProviderSettings {
        required_fields: vec!["title".into(), "price".into()],
        ..Default::default()
    };
    let provider = FixtureProvider::from_file(
        "immo-a",
        FixtureFile {
            pages,
            ..Default::default()
        },
        settings,
    );

    let mut req = request(&provider, &notifier);
    req.blacklist = Blacklist::new(["wg zimmer"]);
    let report = pipeline.run(&req).await;

    assert_eq!(notified(&report.outcome), 2);
    assert_eq!(report.counts.missing_required, 1);
    assert_eq!(report.counts.blacklisted, 1);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn failing_detail_calls_do_not_fail_the_run() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let notifier = NotificationDispatcher::default();
    let file = FixtureFile {
        pages: two_flats(),
        details: [
            ("101".to_string(), json!({"description": "Dielen, Südbalkon"})),
            ("102".to_string(), json!({"error": "503 Service Unavailable"})),
        ]
        .into_iter()
        .collect(),
    };
    let provider = FixtureProvider::from_file("immo-a", file, ProviderSettings::default());

    let report = pipeline.run(&request(&provider, &notifier)).await;

    assert_eq!(report.counts.enriched, 1);
    assert_eq!(report.counts.enrichment_failures, 1);
    let RunOutcome::Notified { listings } = &report.outcome else {
        panic!("expected notified run, got {:?}", report.outcome);
    };
    let enriched = listings
        .iter()
        .find(|l| l.provider_listing_id.as_deref() == Some("101"))
        .unwrap();
    assert_eq!(enriched.description.as_deref(), Some("Dielen, Südbalkon"));
}

#[tokio::test]
async fn fetch_errors_fail_the_run_at_the_fetch_stage() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let notifier = NotificationDispatcher::default();

    let report = pipeline.run(&request(&UnreachableProvider, &notifier)).await;

    match &report.outcome {
        RunOutcome::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Fetch);
            assert!(error.contains("503"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(report.outcome.is_failure());
    assert_eq!(report.provider_id, "immo-down");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn malformed_search_url_fails_before_fetching() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let notifier = NotificationDispatcher::default();
    let provider = fixture("immo-a", two_flats());

    let mut req = request(&provider, &notifier);
    req.search_url = "not a url";
    let report = pipeline.run(&req).await;

    assert!(matches!(report.outcome, RunOutcome::Failed { stage: Stage::BuildUrl, .. }));
    assert_eq!(report.counts.fetched, 0);
}

#[tokio::test]
async fn same_flat_from_a_second_provider_is_dropped_as_duplicate() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let counter = Arc::new(CountingNotifier::default());
    let notifier = NotificationDispatcher::new(vec![counter.clone()]);
    let listing = |title: &str| {
        vec![vec![json!({
            "id": "x1",
            "title": title,
            "price": 1450,
            "address": "Torstraße 7, 10119 Berlin"
        })]]
    };
    let first = fixture("immo-a", listing("Helle 2-Zimmer-Wohnung in Mitte"));
    let second = fixture("immo-b", listing("Helle 2-Zimmer-Wohnung Mitte"));

    assert_eq!(notified(&pipeline.run(&request(&first, &notifier)).await.outcome), 1);
    let report = pipeline.run(&request(&second, &notifier)).await;

    assert_eq!(report.outcome, RunOutcome::NoNewListings { stage: Stage::CrossPlatform });
    assert_eq!(report.counts.persisted, 1);
    assert_eq!(report.counts.cross_platform_duplicates, 1);
    assert_eq!(store.len().await, 2);
    assert_eq!(counter.listings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn republished_listing_supersedes_the_stored_one() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let notifier = NotificationDispatcher::default();
    let flat = |price: u32| {
        vec![vec![json!({
            "id": "77",
            "title": "Altbau mit Balkon",
            "price": price,
            "address": "Musterstr. 12, 10115 Berlin",
            "size": 70,
            "rooms": 3
        })]]
    };

    pipeline.run(&request(&fixture("immo-a", flat(1200)), &notifier)).await;
    let original = store.all_listings().await.remove(0);

    let report = pipeline.run(&request(&fixture("immo-a", flat(1250)), &notifier)).await;
    assert_eq!(notified(&report.outcome), 1);
    assert_eq!(report.counts.version_links, 1);

    let rows = store.all_listings().await;
    let newest = rows.iter().find(|l| l.id != original.id).unwrap();
    assert_eq!(newest.previous_version_id, Some(original.id));
    assert!(!newest.is_superseded);
    assert!(rows.iter().find(|l| l.id == original.id).unwrap().is_superseded);
    let prices: Vec<f64> = newest.change_set.price_history.iter().map(|p| p.price).collect();
    assert_eq!(prices, vec![1200.0, 1250.0]);
}

#[tokio::test]
async fn unmigrated_store_still_persists_and_notifies() {
    let store = Arc::new(MemoryStore::without_versioning());
    let pipeline = Pipeline::new(store.clone());
    let notifier = NotificationDispatcher::default();
    let provider = fixture("immo-a", two_flats());

    let report = pipeline.run(&request(&provider, &notifier)).await;

    assert_eq!(notified(&report.outcome), 2);
    assert_eq!(report.counts.version_links, 0);
    assert!(store.all_listings().await.iter().all(|l| l.fuzzy_identity.is_none()));
}

#[tokio::test]
async fn geocodes_missing_coordinates_and_stores_distances() {
    let store = Arc::new(MemoryStore::new());
    let geocoder = StaticGeocoder::new().with("Musterstr. 12, 10115 Berlin", 52.5310, 13.3840);
    let pipeline = Pipeline::new(store.clone()).with_geocoder(Arc::new(geocoder));
    let notifier = NotificationDispatcher::default();
    let provider = fixture("immo-a", two_flats());

    let mut req = request(&provider, &notifier);
    req.home = Some(Coordinates {
        latitude: 52.5200,
        longitude: 13.4050,
    });
    let report = pipeline.run(&req).await;

    assert_eq!(notified(&report.outcome), 2);
    assert_eq!(report.counts.geocoded, 1);
    assert_eq!(report.counts.distances, 2);
    for listing in store.all_listings().await {
        assert!(listing.latitude.is_some());
        assert!(listing.distance_to_home.is_some_and(|d| d > 0.0));
    }
}

#[tokio::test]
async fn notification_failures_are_counted_not_raised() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(store.clone());
    let counter = Arc::new(CountingNotifier::default());
    let adapters: Vec<Arc<dyn NotificationAdapter>> = vec![Arc::new(BrokenNotifier), counter.clone()];
    let notifier = NotificationDispatcher::new(adapters);
    let provider = fixture("immo-a", two_flats());

    let report = pipeline.run(&request(&provider, &notifier)).await;

    assert_eq!(notified(&report.outcome), 2);
    assert_eq!(report.counts.notification_failures, 1);
    assert_eq!(counter.listings.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sync_service_runs_enabled_jobs_from_the_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("fixtures")).unwrap();
    let file = FixtureFile {
        pages: two_flats(),
        ..Default::default()
    };
    std::fs::write(
        root.join("fixtures/immo-a.json"),
        serde_json::to_string(&file).unwrap(),
    )
    .unwrap();
    std::fs::write(
        root.join("providers.yaml"),
        r#"
providers:
  - id: immo-a
    kind: fixture
    fixture: fixtures/immo-a.json
    required_fields: [title, price]
"#,
    )
    .unwrap();
    std::fs::write(
        root.join("jobs.yaml"),
        r#"
jobs:
  - id: berlin
    providers:
      - id: immo-a
        url: https://immo-a.example/search?city=berlin
      - id: not-registered
        url: https://elsewhere.example/search
    notifications:
      - kind: log
  - id: paused
    enabled: false
    providers:
      - id: immo-a
        url: https://immo-a.example/search?city=potsdam
"#,
    )
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    let service = SyncService::new(SyncConfig::for_workspace(root), store.clone())
        .await
        .unwrap()
        .with_pipeline(|p| p.with_delays(DelayRange::default(), DelayRange::default()));

    let reports = service.run_all_jobs().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].job_id, "berlin");
    assert_eq!(notified(&reports[0].outcome), 2);
    // Disk fixtures always offer details; this one has none.
    assert_eq!(reports[0].counts.enrichment_failures, 2);

    let again = service.run_all_jobs().await.unwrap();
    assert_eq!(again[0].outcome, RunOutcome::NoNewListings { stage: Stage::Dedup });
    assert_eq!(store.known_hashes("berlin", "immo-a").await.unwrap().len(), 2);
}
