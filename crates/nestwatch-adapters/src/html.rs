//! CSS-selector driven provider for plain HTML result pages.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nestwatch_core::{DetailPatch, NewListing, RawListing};
use nestwatch_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;
use url::Url;

use crate::normalize::{detail_patch_from_json, normalize_payload};
use crate::provider::{FetchRequest, Provider, ProviderSettings};
use crate::AdapterError;

/// Field selectors are `css`, `css@attr`, or `@attr` for the item element itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSelectors {
    pub item: String,
    pub title: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub rooms: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Query parameter carrying the 1-based page number.
    #[serde(default)]
    pub page_param: Option<String>,
    #[serde(default)]
    pub detail: Option<DetailSelectors>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSelectors {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub images: Option<String>,
    #[serde(default)]
    pub documents: Option<String>,
}

#[derive(Debug, Clone)]
struct FieldSelector {
    css: Option<Selector>,
    attr: Option<String>,
}

impl FieldSelector {
    fn parse(spec: &str) -> Result<Self, AdapterError> {
        let (css, attr) = match spec.rsplit_once('@') {
            Some((css, attr)) => (css.trim(), Some(attr.trim().to_string())),
            None => (spec.trim(), None),
        };
        let css = if css.is_empty() {
            None
        } else {
            Some(compile(css)?)
        };
        Ok(Self { css, attr })
    }

    fn targets<'a>(&'a self, root: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        match &self.css {
            Some(css) => root.select(css).collect(),
            None => vec![root],
        }
    }

    fn value_of(&self, element: ElementRef<'_>) -> Option<String> {
        let raw = match &self.attr {
            Some(attr) => element.value().attr(attr)?.to_string(),
            None => element.text().collect::<Vec<_>>().join(" "),
        };
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        (!collapsed.is_empty()).then_some(collapsed)
    }

    fn first(&self, root: ElementRef<'_>) -> Option<String> {
        self.targets(root).into_iter().find_map(|e| self.value_of(e))
    }

    fn all(&self, root: ElementRef<'_>) -> Vec<String> {
        self.targets(root)
            .into_iter()
            .filter_map(|e| self.value_of(e))
            .collect()
    }
}

fn compile(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn optional(spec: &Option<String>) -> Result<Option<FieldSelector>, AdapterError> {
    spec.as_deref().map(FieldSelector::parse).transpose()
}

#[derive(Debug, Clone)]
struct Compiled {
    item: Selector,
    title: FieldSelector,
    fields: Vec<(&'static str, FieldSelector)>,
    image: Option<FieldSelector>,
    detail: Vec<(&'static str, FieldSelector, bool)>,
}

pub struct HtmlProvider {
    id: String,
    settings: ProviderSettings,
    page_param: Option<String>,
    max_pages: u32,
    compiled: Compiled,
    http: Arc<HttpFetcher>,
}

impl HtmlProvider {
    pub fn new(
        id: impl Into<String>,
        settings: ProviderSettings,
        selectors: HtmlSelectors,
        max_pages: u32,
        http: Arc<HttpFetcher>,
    ) -> Result<Self, AdapterError> {
        let mut fields = Vec::new();
        for (name, spec) in [
            ("id", &selectors.id),
            ("link", &selectors.link),
            ("price", &selectors.price),
            ("size", &selectors.size),
            ("rooms", &selectors.rooms),
            ("address", &selectors.address),
            ("published_at", &selectors.published_at),
        ] {
            if let Some(field) = optional(spec)? {
                fields.push((name, field));
            }
        }

        let mut detail = Vec::new();
        if let Some(d) = &selectors.detail {
            for (name, spec, many) in [
                ("description", &d.description, false),
                ("address", &d.address, false),
                ("images", &d.images, true),
                ("documents", &d.documents, true),
            ] {
                if let Some(field) = optional(spec)? {
                    detail.push((name, field, many));
                }
            }
        }

        Ok(Self {
            id: id.into(),
            settings,
            page_param: selectors.page_param.clone(),
            max_pages: max_pages.max(1),
            compiled: Compiled {
                item: compile(&selectors.item)?,
                title: FieldSelector::parse(&selectors.title)?,
                fields,
                image: optional(&selectors.image)?,
                detail,
            },
            http,
        })
    }

    /// Extracts one JSON payload per result item. Relative links resolve against `base`.
    pub fn parse_listing_page(&self, html: &str, base: Option<&Url>) -> Vec<JsonValue> {
        let document = Html::parse_document(html);
        let mut out = Vec::new();
        for item in document.select(&self.compiled.item) {
            let Some(title) = self.compiled.title.first(item) else {
                continue;
            };
            let mut payload = JsonMap::new();
            payload.insert("title".into(), JsonValue::String(title));
            for (name, field) in &self.compiled.fields {
                if let Some(value) = field.first(item) {
                    let value = if *name == "link" { absolutize(base, &value) } else { value };
                    payload.insert((*name).into(), JsonValue::String(value));
                }
            }
            if let Some(image) = &self.compiled.image {
                let images: Vec<JsonValue> = image
                    .all(item)
                    .into_iter()
                    .map(|src| JsonValue::String(absolutize(base, &src)))
                    .collect();
                if !images.is_empty() {
                    payload.insert("images".into(), JsonValue::Array(images));
                }
            }
            out.push(JsonValue::Object(payload));
        }
        out
    }

    pub fn parse_detail_page(&self, html: &str, base: Option<&Url>) -> JsonValue {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let mut payload = JsonMap::new();
        for (name, field, many) in &self.compiled.detail {
            if *many {
                let values: Vec<JsonValue> = field
                    .all(root)
                    .into_iter()
                    .map(|v| JsonValue::String(absolutize(base, &v)))
                    .collect();
                if !values.is_empty() {
                    payload.insert((*name).into(), JsonValue::Array(values));
                }
            } else if let Some(value) = field.first(root) {
                payload.insert((*name).into(), JsonValue::String(value));
            }
        }
        JsonValue::Object(payload)
    }

    fn page_url(&self, base: &str, page: u32) -> Result<String, AdapterError> {
        match (&self.page_param, page) {
            (None, _) | (_, 1) => Ok(base.to_string()),
            (Some(param), page) => {
                let mut url = Url::parse(base).map_err(|e| AdapterError::InvalidUrl {
                    url: base.to_string(),
                    message: e.to_string(),
                })?;
                let kept: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != param.as_str())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                url.query_pairs_mut()
                    .clear()
                    .extend_pairs(kept)
                    .append_pair(param, &page.to_string());
                Ok(url.into())
            }
        }
    }
}

fn absolutize(base: Option<&Url>, href: &str) -> String {
    base.and_then(|b| b.join(href).ok())
        .map(String::from)
        .unwrap_or_else(|| href.to_string())
}

#[async_trait]
impl Provider for HtmlProvider {
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
        let base = Url::parse(&request.url).ok();
        let mut out = Vec::new();
        let pages = if self.page_param.is_some() { self.max_pages } else { 1 };

        for page in 1..=pages {
            let url = self.page_url(&request.url, page)?;
            let body = self.http.fetch_text(&self.id, &url).await?;
            let fetched_at = Utc::now();
            let raws: Vec<RawListing> = self
                .parse_listing_page(&body, base.as_ref())
                .into_iter()
                .map(|payload| RawListing {
                    provider_id: self.id.clone(),
                    payload,
                    fetched_at,
                })
                .collect();
            if raws.is_empty() {
                break;
            }
            let known = raws.iter().all(|raw| {
                normalize_payload(raw)
                    .map(|l| request.known_hashes.contains(&l.hash))
                    .unwrap_or(false)
            });
            out.extend(raws);
            if known && !request.full_fetch {
                debug!(provider_id = %self.id, page, "page fully known, stopping pagination");
                break;
            }
        }
        Ok(out)
    }

    fn supports_details(&self) -> bool {
        !self.compiled.detail.is_empty()
    }

    async fn get_details(&self, listing: &NewListing) -> Result<DetailPatch, AdapterError> {
        if self.compiled.detail.is_empty() {
            return Err(AdapterError::DetailsUnsupported(self.id.clone()));
        }
        let link = listing
            .link
            .as_deref()
            .ok_or_else(|| AdapterError::DetailNotFound(listing.hash.clone()))?;
        let body = self.http.fetch_text(&self.id, link).await?;
        let base = Url::parse(link).ok();
        detail_patch_from_json(&self.parse_detail_page(&body, base.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestwatch_storage::HttpClientConfig;

    const RESULTS: &str = r#"
        <ul>
          <li class="result" data-id="a-1">
            <a class="title" href="/expose/a-1">Altbau mit Balkon</a>
            <span class="price">1.250 €</span>
            <span class="size">70 m²</span>
            <span class="rooms">2,5 Zimmer</span>
            <span class="addr">Musterstr. 12, 10115 Berlin</span>
            <img src="/img/a-1.jpg"><img src="https://cdn.example/a-1b.jpg">
          </li>
          <li class="result" data-id="a-2">
            <span class="price">990 €</span>
          </li>
        </ul>"#;

    const DETAIL: &str = r#"
        <div class="desc">  Ruhige   Lage im Hinterhaus </div>
        <a class="doc" href="/docs/grundriss.pdf">Grundriss</a>"#;

    fn provider() -> HtmlProvider {
        let selectors = HtmlSelectors {
            item: "li.result".into(),
            title: "a.title".into(),
            id: Some("@data-id".into()),
            link: Some("a.title@href".into()),
            price: Some(".price".into()),
            size: Some(".size".into()),
            rooms: Some(".rooms".into()),
            address: Some(".addr".into()),
            published_at: None,
            image: Some("img@src".into()),
            page_param: Some("page".into()),
            detail: Some(DetailSelectors {
                description: Some(".desc".into()),
                documents: Some("a.doc@href".into()),
                ..Default::default()
            }),
        };
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        HtmlProvider::new("immo-html", ProviderSettings::default(), selectors, 3, http).unwrap()
    }

    #[test]
    fn result_items_become_payloads() {
        let provider = provider();
        let base = Url::parse("https://immo.example/search").unwrap();
        let payloads = provider.parse_listing_page(RESULTS, Some(&base));
        assert_eq!(payloads.len(), 1, "items without a title are skipped");

        let raw = RawListing {
            provider_id: "immo-html".into(),
            payload: payloads[0].clone(),
            fetched_at: Utc::now(),
        };
        let listing = provider.normalize(&raw).unwrap();
        assert_eq!(listing.provider_listing_id.as_deref(), Some("a-1"));
        assert_eq!(listing.link.as_deref(), Some("https://immo.example/expose/a-1"));
        assert_eq!(listing.price, Some(1250.0));
        assert_eq!(listing.size, Some(70.0));
        assert_eq!(listing.rooms, Some(2.5));
        assert_eq!(
            listing.image_urls,
            vec!["https://immo.example/img/a-1.jpg", "https://cdn.example/a-1b.jpg"]
        );
    }

    #[test]
    fn detail_page_becomes_patch() {
        let provider = provider();
        let base = Url::parse("https://immo.example/expose/a-1").unwrap();
        let patch = detail_patch_from_json(&provider.parse_detail_page(DETAIL, Some(&base))).unwrap();
        assert_eq!(patch.description.as_deref(), Some("Ruhige Lage im Hinterhaus"));
        assert_eq!(patch.documents, vec!["https://immo.example/docs/grundriss.pdf"]);
        assert!(provider.supports_details());
    }

    #[test]
    fn later_pages_carry_the_page_parameter() {
        let provider = provider();
        assert_eq!(
            provider.page_url("https://immo.example/search?city=berlin", 1).unwrap(),
            "https://immo.example/search?city=berlin"
        );
        assert_eq!(
            provider.page_url("https://immo.example/search?city=berlin&page=1", 2).unwrap(),
            "https://immo.example/search?city=berlin&page=2"
        );
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = HtmlSelectors {
            item: "li[".into(),
            title: "a".into(),
            id: None,
            link: None,
            price: None,
            size: None,
            rooms: None,
            address: None,
            published_at: None,
            image: None,
            page_param: None,
            detail: None,
        };
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let err = HtmlProvider::new("x", ProviderSettings::default(), selectors, 1, http)
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::Selector { .. }));
    }
}
