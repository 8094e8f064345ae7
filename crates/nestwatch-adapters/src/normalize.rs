//! Raw payload to [`NewListing`] conversion shared by the bundled providers.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use nestwatch_core::{DetailPatch, NewListing, RawListing};
use regex::Regex;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::AdapterError;

const HASH_HEX_LEN: usize = 16;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d.,]*").expect("number pattern compiles"));
static DOT_THOUSANDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(?:\.\d{3})+$").expect("thousands pattern compiles"));

const KNOWN_KEYS: &[&str] = &[
    "id",
    "title",
    "description",
    "address",
    "link",
    "url",
    "price",
    "size",
    "living_space",
    "rooms",
    "latitude",
    "lat",
    "longitude",
    "lng",
    "lon",
    "published_at",
    "date",
    "images",
    "image_urls",
    "documents",
];

/// Parses the first number in `text`, accepting German formatting
/// (`1.250,50 €`, `70 m²`, `2,5 Zimmer`) as well as plain `1250.5`.
pub fn parse_german_number(text: &str) -> Option<f64> {
    let token = NUMBER_RE
        .find(text)?
        .as_str()
        .trim_end_matches(['.', ',']);
    let last_dot = token.rfind('.');
    let last_comma = token.rfind(',');
    let cleaned = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if dot > comma => token.replace(',', ""),
        (_, Some(_)) => token.replace('.', "").replace(',', "."),
        (Some(_), None) if DOT_THOUSANDS_RE.is_match(token) => token.replace('.', ""),
        _ => token.to_string(),
    };
    cleaned.parse().ok()
}

/// Stable per-provider listing hash: `provider|id or link|title|price`.
pub fn content_hash(provider_id: &str, key: Option<&str>, title: &str, price: Option<f64>) -> String {
    let price = price.map(|p| p.to_string()).unwrap_or_default();
    let digest = Sha256::digest(
        format!("{provider_id}|{}|{}|{price}", key.unwrap_or(""), title.trim()).as_bytes(),
    );
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_HEX_LEN);
    hex
}

fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_german_number(s),
        _ => None,
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn first<'a>(object: &'a JsonMap<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|k| object.get(*k))
        .find(|v| !v.is_null())
}

fn json_strings(value: Option<&JsonValue>) -> Vec<String> {
    value
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().filter_map(json_text).collect())
        .unwrap_or_default()
}

fn address_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Object(parts) => {
            let street = parts.get("street").and_then(json_text);
            let locality = [parts.get("zip"), parts.get("city")]
                .into_iter()
                .flatten()
                .filter_map(json_text)
                .collect::<Vec<_>>()
                .join(" ");
            let joined = street
                .into_iter()
                .chain((!locality.is_empty()).then_some(locality))
                .collect::<Vec<_>>()
                .join(", ");
            (!joined.is_empty()).then_some(joined)
        }
        other => json_text(other),
    }
}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0),
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            ["%Y-%m-%d", "%d.%m.%Y"]
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        }
        _ => None,
    }
}

/// Maps a JSON object payload onto a [`NewListing`]. Unrecognized keys are kept
/// in the change set so providers can require them by name.
pub fn normalize_payload(raw: &RawListing) -> Result<NewListing, AdapterError> {
    let object = raw
        .payload
        .as_object()
        .ok_or_else(|| AdapterError::InvalidPayload("payload is not an object".into()))?;
    let title = first(object, &["title"])
        .and_then(json_text)
        .ok_or_else(|| AdapterError::InvalidPayload("missing title".into()))?;

    let provider_listing_id = first(object, &["id"]).and_then(json_text);
    let link = first(object, &["link", "url"]).and_then(json_text);
    let price = first(object, &["price"]).and_then(json_number);
    let hash = content_hash(
        &raw.provider_id,
        provider_listing_id.as_deref().or(link.as_deref()),
        &title,
        price,
    );

    let mut listing = NewListing::new(hash, raw.provider_id.clone(), title, raw.fetched_at);
    listing.provider_listing_id = provider_listing_id;
    listing.link = link;
    listing.price = price;
    listing.description = first(object, &["description"]).and_then(json_text);
    listing.address = first(object, &["address"]).and_then(address_text);
    listing.size = first(object, &["size", "living_space"]).and_then(json_number);
    listing.rooms = first(object, &["rooms"]).and_then(json_number);
    listing.latitude = first(object, &["latitude", "lat"]).and_then(json_number);
    listing.longitude = first(object, &["longitude", "lng", "lon"]).and_then(json_number);
    listing.published_at = first(object, &["published_at", "date"]).and_then(parse_timestamp);
    listing.image_urls = json_strings(first(object, &["images", "image_urls"]));
    listing.documents = json_strings(first(object, &["documents"]));
    listing.change_set.extra = object
        .iter()
        .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(listing)
}

/// Detail endpoint payload to [`DetailPatch`], using the same key aliases as listings.
pub fn detail_patch_from_json(payload: &JsonValue) -> Result<DetailPatch, AdapterError> {
    let object = payload
        .as_object()
        .ok_or_else(|| AdapterError::InvalidPayload("detail payload is not an object".into()))?;
    Ok(DetailPatch {
        description: first(object, &["description"]).and_then(json_text),
        address: first(object, &["address"]).and_then(address_text),
        price: first(object, &["price"]).and_then(json_number),
        size: first(object, &["size", "living_space"]).and_then(json_number),
        rooms: first(object, &["rooms"]).and_then(json_number),
        latitude: first(object, &["latitude", "lat"]).and_then(json_number),
        longitude: first(object, &["longitude", "lng", "lon"]).and_then(json_number),
        published_at: first(object, &["published_at", "date"]).and_then(parse_timestamp),
        image_urls: json_strings(first(object, &["images", "image_urls"])),
        documents: json_strings(first(object, &["documents"])),
        extra: object
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(payload: JsonValue) -> RawListing {
        RawListing {
            provider_id: "immo-a".into(),
            payload,
            fetched_at: DateTime::parse_from_rfc3339("2026-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn german_number_formats() {
        assert_eq!(parse_german_number("1.250,50 €"), Some(1250.5));
        assert_eq!(parse_german_number("70 m²"), Some(70.0));
        assert_eq!(parse_german_number("2,5 Zimmer"), Some(2.5));
        assert_eq!(parse_german_number("1.250 €"), Some(1250.0));
        assert_eq!(parse_german_number("Kaltmiete: 980."), Some(980.0));
        assert_eq!(parse_german_number("1,250.75"), Some(1250.75));
        assert_eq!(parse_german_number("2.5"), Some(2.5));
        assert_eq!(parse_german_number("auf Anfrage"), None);
    }

    #[test]
    fn content_hash_is_stable_and_short() {
        let a = content_hash("immo-a", Some("42"), "Altbau", Some(900.0));
        assert_eq!(a, content_hash("immo-a", Some("42"), " Altbau ", Some(900.0)));
        assert_eq!(a.len(), 16);
        assert_ne!(a, content_hash("immo-a", Some("42"), "Altbau", Some(950.0)));
        assert_ne!(a, content_hash("immo-b", Some("42"), "Altbau", Some(900.0)));
    }

    #[test]
    fn payload_maps_known_and_extra_fields() {
        let listing = normalize_payload(&raw(json!({
            "id": 42,
            "title": "Helle 2-Zimmer-Wohnung",
            "price": "1.250 €",
            "size": "70 m²",
            "rooms": "2,5",
            "address": {"street": "Musterstr. 12", "zip": "10115", "city": "Berlin"},
            "lat": 52.53,
            "lng": 13.38,
            "published_at": "2026-04-30",
            "images": ["https://cdn.example/1.jpg"],
            "energy_class": "B"
        })))
        .unwrap();

        assert_eq!(listing.provider_listing_id.as_deref(), Some("42"));
        assert_eq!(listing.price, Some(1250.0));
        assert_eq!(listing.size, Some(70.0));
        assert_eq!(listing.rooms, Some(2.5));
        assert_eq!(listing.address.as_deref(), Some("Musterstr. 12, 10115 Berlin"));
        assert_eq!(listing.published_at.unwrap().to_rfc3339(), "2026-04-30T00:00:00+00:00");
        assert_eq!(listing.image_urls.len(), 1);
        assert!(listing.has_field("energy_class"));
        assert!(!listing.change_set.extra.contains_key("lat"));
        assert_eq!(listing.created_at, raw(json!({})).fetched_at);
    }

    #[test]
    fn detail_payload_becomes_patch() {
        let patch = detail_patch_from_json(&json!({
            "description": "Ruhige Lage",
            "documents": ["https://cdn.example/expose.pdf"],
            "heating": "Fernwärme"
        }))
        .unwrap();
        assert_eq!(patch.description.as_deref(), Some("Ruhige Lage"));
        assert_eq!(patch.documents.len(), 1);
        assert_eq!(patch.price, None);
        assert!(patch.extra.contains_key("heating"));
    }

    #[test]
    fn payload_without_title_is_rejected() {
        assert!(matches!(
            normalize_payload(&raw(json!({"price": 900}))),
            Err(AdapterError::InvalidPayload(_))
        ));
        assert!(normalize_payload(&raw(json!(["not", "an", "object"]))).is_err());
    }
}
