//! Run/session cache used by the cross-platform filter to drop listings that
//! another provider already delivered.

use std::time::{Duration, Instant};

use nestwatch_core::parse_address;
use strsim::jaro_winkler;
use tokio::sync::Mutex;

pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, PartialEq)]
struct CacheKey {
    title: String,
    address: String,
    price: Option<i64>,
}

impl CacheKey {
    fn new(title: &str, address: Option<&str>, price: Option<f64>) -> Self {
        Self {
            title: normalize_title(title),
            address: address.map(|a| parse_address(a).normalized).unwrap_or_default(),
            price: price.filter(|p| p.is_finite()).map(|p| p.round() as i64),
        }
    }

    fn is_near_duplicate(&self, other: &CacheKey) -> bool {
        self.address == other.address
            && self.price == other.price
            && jaro_winkler(&self.title, &other.title) >= TITLE_SIMILARITY_THRESHOLD
    }
}

#[derive(Debug)]
struct CacheEntry {
    key: CacheKey,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct SimilarityCache {
    ttl: Duration,
    entries: Mutex<Vec<CacheEntry>>,
}

impl SimilarityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns `true` when a live near-duplicate is cached. Only
    /// non-duplicates are registered.
    pub async fn check_and_add(&self, title: &str, address: Option<&str>, price: Option<f64>) -> bool {
        let key = CacheKey::new(title, address, price);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|e| now.duration_since(e.inserted_at) < self.ttl);
        if entries.iter().any(|e| e.key.is_near_duplicate(&key)) {
            return true;
        }
        entries.push(CacheEntry {
            key,
            inserted_at: now,
        });
        false
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

fn normalize_title(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
