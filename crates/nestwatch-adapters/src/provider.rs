//! The provider contract consumed by the ingestion pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nestwatch_core::{Blacklist, DetailPatch, NewListing, RawListing};
use nestwatch_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::fixture::FixtureProvider;
use crate::html::{HtmlProvider, HtmlSelectors};
use crate::normalize::normalize_payload;
use crate::AdapterError;

/// Everything a provider needs for one fetch. Passed explicitly on every call.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub known_hashes: HashSet<String>,
    pub blacklist: Blacklist,
    /// Disables early pagination termination on already-known pages.
    pub full_fetch: bool,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    /// Field names a normalized listing must carry to survive filtering.
    fn required_fields(&self) -> &[String];

    /// `key=value` query pair applied to the search URL before fetching.
    fn sort_param(&self) -> Option<&str> {
        None
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawListing>, AdapterError>;

    fn normalize(&self, raw: &RawListing) -> Result<NewListing, AdapterError> {
        normalize_payload(raw)
    }

    /// `true` keeps the listing.
    fn filter(&self, listing: &NewListing, blacklist: &Blacklist) -> bool {
        !blacklist.matches_listing(listing)
    }

    fn supports_details(&self) -> bool {
        false
    }

    async fn get_details(&self, listing: &NewListing) -> Result<DetailPatch, AdapterError> {
        Err(AdapterError::DetailsUnsupported(listing.provider_id.clone()))
    }
}

/// Applies an optional `key=value` sort parameter, replacing any existing value for `key`.
pub fn build_request_url(search_url: &str, sort_param: Option<&str>) -> Result<String, AdapterError> {
    let mut url = Url::parse(search_url).map_err(|e| AdapterError::InvalidUrl {
        url: search_url.to_string(),
        message: e.to_string(),
    })?;
    let Some((key, value)) = sort_param.and_then(|p| p.split_once('=')) else {
        return Ok(url.into());
    };
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(key, value);
    Ok(url.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Fixture,
    Html,
}

/// Settings common to every provider kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub sort_param: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            required_fields: vec!["title".to_string()],
            sort_param: None,
        }
    }
}

/// One entry of `providers.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    #[serde(flatten)]
    pub settings: ProviderSettings,
    /// Terms dropped for every job using this provider.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Fixture file, relative to the workspace root.
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    #[serde(default)]
    pub selectors: Option<HtmlSelectors>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl ProviderConfig {
    pub fn build(
        &self,
        workspace_root: &Path,
        http: Arc<HttpFetcher>,
    ) -> Result<Arc<dyn Provider>, AdapterError> {
        match self.kind {
            ProviderKind::Fixture => {
                let fixture = self.fixture.as_ref().ok_or_else(|| {
                    AdapterError::Other(anyhow::anyhow!("provider {} needs a fixture path", self.id))
                })?;
                Ok(Arc::new(FixtureProvider::from_path(
                    self.id.clone(),
                    workspace_root.join(fixture),
                    self.settings.clone(),
                )))
            }
            ProviderKind::Html => {
                let selectors = self.selectors.clone().ok_or_else(|| {
                    AdapterError::Other(anyhow::anyhow!("provider {} needs selectors", self.id))
                })?;
                Ok(Arc::new(HtmlProvider::new(
                    self.id.clone(),
                    self.settings.clone(),
                    selectors,
                    self.max_pages.unwrap_or(1),
                    http,
                )?))
            }
        }
    }

    pub fn blacklist(&self) -> Blacklist {
        Blacklist::new(&self.blacklist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_param_replaces_existing_value() {
        let url = build_request_url(
            "https://immo.example/search?city=berlin&sort=price",
            Some("sort=newest"),
        )
        .unwrap();
        assert_eq!(url, "https://immo.example/search?city=berlin&sort=newest");
    }

    #[test]
    fn url_without_sort_param_is_unchanged() {
        let url = build_request_url("https://immo.example/search?city=berlin", None).unwrap();
        assert_eq!(url, "https://immo.example/search?city=berlin");
        assert!(matches!(
            build_request_url("not a url", None),
            Err(AdapterError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn provider_config_parses_from_yaml_shape() {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "id": "immo-a",
            "kind": "fixture",
            "required_fields": ["title", "price"],
            "fixture": "fixtures/immo-a/listings.json",
            "blacklist": ["Tausch"]
        }))
        .unwrap();
        assert!(config.settings.enabled);
        assert_eq!(config.settings.required_fields, vec!["title", "price"]);
        assert!(config.blacklist().matches("Nur Tausch"));
    }
}
