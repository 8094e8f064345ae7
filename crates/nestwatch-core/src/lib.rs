//! Core listing model plus the pure identity and similarity functions for nestwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

pub mod address;
pub mod geo;
pub mod identity;
pub mod similarity;

pub use address::{compare_addresses, parse_address, ParsedAddress};
pub use geo::{calculate_geo_score, haversine_distance, GeoScore};
pub use identity::{compute_fuzzy_identity, compute_property_identity, could_be_same_property};
pub use similarity::{
    compute_similarity, find_similar_listings, Confidence, FactorScore, SimilarMatch,
    SimilarityFactors, SimilarityOptions, SimilarityResult,
};

pub const CRATE_NAME: &str = "nestwatch-core";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Provider-specific listing as fetched, before any identity is computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub provider_id: String,
    pub payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: DateTime<Utc>,
    pub price: f64,
}

/// Free-form change record stored with each listing. `price_history` is kept
/// unique per date and sorted ascending.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub price_history: Vec<PricePoint>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl ChangeSet {
    /// Appends a price point unless one already exists for `date`. Returns
    /// whether the history changed.
    pub fn record_price(&mut self, date: DateTime<Utc>, price: f64) -> bool {
        if self.price_history.iter().any(|p| p.date == date) {
            return false;
        }
        self.price_history.push(PricePoint { date, price });
        self.price_history.sort_by_key(|p| p.date);
        true
    }

    pub fn merge_price_history(&mut self, points: &[PricePoint]) -> bool {
        let mut changed = false;
        for point in points {
            changed |= self.record_price(point.date, point.price);
        }
        changed
    }

    pub fn normalize(&mut self) {
        self.price_history.sort_by_key(|p| p.date);
        self.price_history.dedup_by_key(|p| p.date);
    }
}

/// Read view over listing fields shared by normalized and persisted listings.
pub trait PropertyAttributes {
    fn hash(&self) -> &str;
    fn address(&self) -> Option<&str>;
    fn price(&self) -> Option<f64>;
    fn size(&self) -> Option<f64>;
    fn rooms(&self) -> Option<f64>;
    fn latitude(&self) -> Option<f64>;
    fn longitude(&self) -> Option<f64>;
    fn fuzzy_identity(&self) -> Option<&str>;

    fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude(), self.longitude()) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

/// Normalized listing: stable `hash`, required fields present, blacklist applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListing {
    pub hash: String,
    pub provider_id: String,
    pub provider_listing_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub link: Option<String>,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub rooms: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub image_paths: Vec<String>,
    #[serde(default)]
    pub document_paths: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub property_identity: Option<String>,
    pub fuzzy_identity: Option<String>,
    pub previous_version_id: Option<Uuid>,
    #[serde(default)]
    pub change_set: ChangeSet,
}

impl NewListing {
    pub fn new(
        hash: impl Into<String>,
        provider_id: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            hash: hash.into(),
            provider_id: provider_id.into(),
            provider_listing_id: None,
            title: title.into(),
            description: None,
            address: None,
            link: None,
            price: None,
            size: None,
            rooms: None,
            latitude: None,
            longitude: None,
            image_urls: Vec::new(),
            documents: Vec::new(),
            image_paths: Vec::new(),
            document_paths: Vec::new(),
            published_at: None,
            created_at,
            property_identity: None,
            fuzzy_identity: None,
            previous_version_id: None,
            change_set: ChangeSet::default(),
        }
    }

    /// Whether the named field carries a usable value. Unknown names are looked
    /// up in the free-form change set.
    pub fn has_field(&self, name: &str) -> bool {
        match name {
            "hash" => !self.hash.is_empty(),
            "title" => !self.title.trim().is_empty(),
            "description" => non_blank(self.description.as_deref()),
            "address" => non_blank(self.address.as_deref()),
            "link" => non_blank(self.link.as_deref()),
            "price" => self.price.is_some(),
            "size" => self.size.is_some(),
            "rooms" => self.rooms.is_some(),
            "published_at" => self.published_at.is_some(),
            "coordinates" => self.latitude.is_some() && self.longitude.is_some(),
            "image_urls" => !self.image_urls.is_empty(),
            other => self
                .change_set
                .extra
                .get(other)
                .is_some_and(|v| !v.is_null()),
        }
    }

    pub fn apply_detail(&mut self, patch: DetailPatch) {
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(address) = patch.address {
            self.address = Some(address);
        }
        if patch.price.is_some() {
            self.price = patch.price;
        }
        if patch.size.is_some() {
            self.size = patch.size;
        }
        if patch.rooms.is_some() {
            self.rooms = patch.rooms;
        }
        if let (Some(lat), Some(lng)) = (patch.latitude, patch.longitude) {
            self.latitude = Some(lat);
            self.longitude = Some(lng);
        }
        if patch.published_at.is_some() {
            self.published_at = patch.published_at;
        }
        for url in patch.image_urls {
            if !self.image_urls.contains(&url) {
                self.image_urls.push(url);
            }
        }
        for doc in patch.documents {
            if !self.documents.contains(&doc) {
                self.documents.push(doc);
            }
        }
        self.change_set.extra.extend(patch.extra);
    }

    /// `published_at ?? created_at`, the ordering key for version chains.
    pub fn timeline_at(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.created_at)
    }
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Persisted listing: normalized fields plus identity and lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub job_id: String,
    pub hash: String,
    pub provider_id: String,
    pub provider_listing_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub link: Option<String>,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub rooms: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance_to_home: Option<f64>,
    pub image_urls: Vec<String>,
    pub image_paths: Vec<String>,
    pub document_paths: Vec<String>,
    pub property_identity: Option<String>,
    pub fuzzy_identity: Option<String>,
    pub previous_version_id: Option<Uuid>,
    pub is_superseded: bool,
    pub is_active: bool,
    pub manually_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub change_set: ChangeSet,
}

impl Listing {
    pub fn from_new(id: Uuid, job_id: impl Into<String>, new: NewListing) -> Self {
        Self {
            id,
            job_id: job_id.into(),
            hash: new.hash,
            provider_id: new.provider_id,
            provider_listing_id: new.provider_listing_id,
            title: new.title,
            description: new.description,
            address: new.address,
            link: new.link,
            price: new.price,
            size: new.size,
            rooms: new.rooms,
            latitude: new.latitude,
            longitude: new.longitude,
            distance_to_home: None,
            image_urls: new.image_urls,
            image_paths: new.image_paths,
            document_paths: new.document_paths,
            property_identity: new.property_identity,
            fuzzy_identity: new.fuzzy_identity,
            previous_version_id: new.previous_version_id,
            is_superseded: false,
            is_active: true,
            manually_deleted: false,
            created_at: new.created_at,
            published_at: new.published_at,
            deactivated_at: None,
            change_set: new.change_set,
        }
    }

    pub fn timeline_at(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.created_at)
    }
}

macro_rules! impl_property_attributes {
    ($ty:ty) => {
        impl PropertyAttributes for $ty {
            fn hash(&self) -> &str {
                &self.hash
            }
            fn address(&self) -> Option<&str> {
                self.address.as_deref()
            }
            fn price(&self) -> Option<f64> {
                self.price
            }
            fn size(&self) -> Option<f64> {
                self.size
            }
            fn rooms(&self) -> Option<f64> {
                self.rooms
            }
            fn latitude(&self) -> Option<f64> {
                self.latitude
            }
            fn longitude(&self) -> Option<f64> {
                self.longitude
            }
            fn fuzzy_identity(&self) -> Option<&str> {
                self.fuzzy_identity.as_deref()
            }
        }
    };
}

impl_property_attributes!(NewListing);
impl_property_attributes!(Listing);

/// Extra fields returned by a provider's detail endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetailPatch {
    pub description: Option<String>,
    pub address: Option<String>,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub rooms: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub extra: JsonMap<String, JsonValue>,
}

/// Undirected user-created edge, stored with `listing_id_low < listing_id_high`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualLink {
    pub listing_id_low: Uuid,
    pub listing_id_high: Uuid,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ManualLink {
    pub fn new(a: Uuid, b: Uuid, created_by: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let (low, high) = canonical_pair(a, b);
        Self {
            listing_id_low: low,
            listing_id_high: high,
            created_by: created_by.into(),
            created_at,
        }
    }
}

pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A version link between two batch members that have no surrogate id yet.
/// Resolved to a `previous_version_id` once both hashes are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingVersionEdge {
    pub successor_hash: String,
    pub predecessor_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Version,
    Manual,
}

/// Edge of the version graph. For `Version` edges `a` is the successor and
/// `b` its `previous_version_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub a: Uuid,
    pub b: Uuid,
    pub kind: EdgeKind,
}

impl GraphEdge {
    pub fn other(&self, id: Uuid) -> Option<Uuid> {
        if self.a == id {
            Some(self.b)
        } else if self.b == id {
            Some(self.a)
        } else {
            None
        }
    }
}

/// Case-insensitive whole-word term filter over title and description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blacklist {
    terms: Vec<String>,
}

impl Blacklist {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut terms: Vec<String> = terms
            .into_iter()
            .map(|t| normalize_words(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        terms.sort();
        terms.dedup();
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn union(&self, other: &Blacklist) -> Blacklist {
        Blacklist::new(self.terms.iter().chain(other.terms.iter()))
    }

    pub fn matches(&self, text: &str) -> bool {
        if self.terms.is_empty() {
            return false;
        }
        let padded = format!(" {} ", normalize_words(text));
        self.terms
            .iter()
            .any(|term| padded.contains(&format!(" {term} ")))
    }

    pub fn matches_listing(&self, listing: &NewListing) -> bool {
        self.matches(&listing.title)
            || listing
                .description
                .as_deref()
                .is_some_and(|d| self.matches(d))
    }
}

fn normalize_words(input: &str) -> String {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
