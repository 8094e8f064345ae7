//! Provider, geocoder and notification contracts plus their bundled implementations.

use nestwatch_storage::FetchError;
use thiserror::Error;

pub mod fixture;
pub mod geocode;
pub mod html;
pub mod normalize;
pub mod notify;
pub mod provider;

pub use fixture::{FixtureFile, FixtureProvider};
pub use geocode::{Geocoder, NoopGeocoder, StaticGeocoder};
pub use html::{HtmlProvider, HtmlSelectors};
pub use normalize::{content_hash, detail_patch_from_json, normalize_payload, parse_german_number};
pub use notify::{
    DispatchSummary, LogNotifier, Notification, NotificationAdapter, NotificationConfig,
    NotificationDispatcher, WebhookNotifier,
};
pub use provider::{build_request_url, FetchRequest, Provider, ProviderConfig, ProviderKind, ProviderSettings};

pub const CRATE_NAME: &str = "nestwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid listing payload: {0}")]
    InvalidPayload(String),
    #[error("invalid url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("provider {0} has no detail endpoint")]
    DetailsUnsupported(String),
    #[error("no details for listing {0}")]
    DetailNotFound(String),
    #[error("notification via {adapter} failed: {message}")]
    Notification { adapter: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
