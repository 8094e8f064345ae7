//! Provider backed by a local JSON file of result pages.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use nestwatch_core::{DetailPatch, NewListing, RawListing};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::normalize::{detail_patch_from_json, normalize_payload};
use crate::provider::{FetchRequest, Provider, ProviderSettings};
use crate::AdapterError;

/// `pages` are result pages in fetch order; `details` are keyed by provider listing id.
/// A detail entry of the form `{"error": "..."}` makes the detail call fail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFile {
    pub pages: Vec<Vec<JsonValue>>,
    #[serde(default)]
    pub details: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone)]
enum Source {
    Path(PathBuf),
    Inline(FixtureFile),
}

#[derive(Debug, Clone)]
pub struct FixtureProvider {
    id: String,
    settings: ProviderSettings,
    source: Source,
}

impl FixtureProvider {
    pub fn from_path(id: impl Into<String>, path: impl Into<PathBuf>, settings: ProviderSettings) -> Self {
        Self {
            id: id.into(),
            settings,
            source: Source::Path(path.into()),
        }
    }

    pub fn from_file(id: impl Into<String>, file: FixtureFile, settings: ProviderSettings) -> Self {
        Self {
            id: id.into(),
            settings,
            source: Source::Inline(file),
        }
    }

    async fn load(&self) -> Result<FixtureFile, AdapterError> {
        match &self.source {
            Source::Inline(file) => Ok(file.clone()),
            Source::Path(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading fixture {}", path.display()))?;
                let file = serde_json::from_str(&text)
                    .with_context(|| format!("parsing fixture {}", path.display()))?;
                Ok(file)
            }
        }
    }

    fn page_is_known(&self, page: &[RawListing], request: &FetchRequest) -> bool {
        !page.is_empty()
            && page.iter().all(|raw| {
                normalize_payload(raw)
                    .map(|l| request.known_hashes.contains(&l.hash))
                    .unwrap_or(false)
            })
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn required_fields(&self) -> &[String] {
        &self.settings.required_fields
    }

    fn sort_param(&self) -> Option<&str> {
        self.settings.sort_param.as_deref()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawListing>, AdapterError> {
        let file = self.load().await?;
        let fetched_at = Utc::now();
        let mut out = Vec::new();

        for (index, page) in file.pages.into_iter().enumerate() {
            let page: Vec<RawListing> = page
                .into_iter()
                .map(|payload| RawListing {
                    provider_id: self.id.clone(),
                    payload,
                    fetched_at,
                })
                .collect();
            let stop = !request.full_fetch && self.page_is_known(&page, request);
            out.extend(page);
            if stop {
                debug!(provider_id = %self.id, page = index, "page fully known, stopping pagination");
                break;
            }
        }
        Ok(out)
    }

    fn supports_details(&self) -> bool {
        match &self.source {
            Source::Inline(file) => !file.details.is_empty(),
            Source::Path(_) => true,
        }
    }

    async fn get_details(&self, listing: &NewListing) -> Result<DetailPatch, AdapterError> {
        let key = listing
            .provider_listing_id
            .clone()
            .unwrap_or_else(|| listing.hash.clone());
        let file = self.load().await?;
        let detail = file
            .details
            .get(&key)
            .ok_or_else(|| AdapterError::DetailNotFound(key.clone()))?;
        if let Some(message) = detail.get("error").and_then(JsonValue::as_str) {
            return Err(AdapterError::Other(anyhow::anyhow!(
                "detail endpoint failed for {key}: {message}"
            )));
        }
        detail_patch_from_json(detail)
    }
}
