//! Address to coordinate lookup.

use std::collections::HashMap;

use async_trait::async_trait;
use nestwatch_core::address::parse_address;
use nestwatch_core::Coordinates;
use serde::Deserialize;

use crate::AdapterError;

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the address is unknown.
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, AdapterError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGeocoder;

#[async_trait]
impl Geocoder for NoopGeocoder {
    async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, AdapterError> {
        Ok(None)
    }
}

/// Fixed lookup table keyed by normalized address, so spelling variants of
/// the same street resolve alike.
#[derive(Debug, Default, Clone)]
pub struct StaticGeocoder {
    entries: HashMap<String, Coordinates>,
}

#[derive(Debug, Deserialize)]
struct StaticEntry {
    address: String,
    latitude: f64,
    longitude: f64,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: &str, latitude: f64, longitude: f64) -> Self {
        self.insert(address, Coordinates { latitude, longitude });
        self
    }

    pub fn insert(&mut self, address: &str, coordinates: Coordinates) {
        self.entries.insert(key(address), coordinates);
    }

    /// Loads `[{address, latitude, longitude}]` from JSON.
    pub fn from_json(text: &str) -> Result<Self, AdapterError> {
        let entries: Vec<StaticEntry> = serde_json::from_str(text)
            .map_err(|e| AdapterError::InvalidPayload(format!("geocoder table: {e}")))?;
        let mut geocoder = Self::new();
        for entry in entries {
            geocoder.insert(
                &entry.address,
                Coordinates {
                    latitude: entry.latitude,
                    longitude: entry.longitude,
                },
            );
        }
        Ok(geocoder)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn key(address: &str) -> String {
    let parsed = parse_address(address);
    if parsed.normalized.is_empty() {
        address.trim().to_lowercase()
    } else {
        parsed.normalized
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, AdapterError> {
        Ok(self.entries.get(&key(address)).copied())
    }
}
