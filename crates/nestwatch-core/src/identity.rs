//! Strict and fuzzy property identities plus the conservative
//! same-property predicate used for automatic re-listing detection.

use sha2::{Digest, Sha256};

use crate::address::parse_address;
use crate::geo::{distance_between, valid_coordinates};
use crate::PropertyAttributes;

pub const IDENTITY_HEX_LEN: usize = 16;

/// Grid size in degrees for the fuzzy geo cell (~30 m of latitude).
pub const GEO_CELL_DEGREES: f64 = 0.0003;
pub const SIZE_BUCKET: f64 = 3.0;
pub const PRICE_BUCKET_RATIO: f64 = 0.02;
pub const MIN_PRICE_BUCKET: f64 = 10.0;
pub const MIN_FUZZY_FACTORS: usize = 4;

pub const SAME_PROPERTY_SIZE_TOLERANCE: f64 = 0.05;
pub const SAME_PROPERTY_PRICE_TOLERANCE: f64 = 0.05;
pub const SAME_PROPERTY_ACCEPT_M: f64 = 30.0;
pub const SAME_PROPERTY_REJECT_M: f64 = 200.0;

/// Hash of the normalized address tokens plus the exact size. `None` when the
/// address yields no tokens or the size is unknown.
pub fn compute_property_identity<L: PropertyAttributes + ?Sized>(listing: &L) -> Option<String> {
    let address = listing.address()?;
    let size = listing.size().filter(|s| s.is_finite())?;
    let parsed = parse_address(address);

    let mut tokens: Vec<String> = [
        parsed.zip_code.map(|v| format!("zip:{v}")),
        parsed.street.map(|v| format!("street:{v}")),
        parsed.house_number.map(|v| format!("hn:{v}")),
        parsed.city.map(|v| format!("city:{v}")),
    ]
    .into_iter()
    .flatten()
    .collect();
    if tokens.is_empty() {
        return None;
    }
    tokens.push(format!("size:{size}"));
    Some(digest_tokens(tokens))
}

/// The bucketed factors available for a listing, unsorted.
pub fn fuzzy_factors<L: PropertyAttributes + ?Sized>(listing: &L) -> Vec<String> {
    let mut tokens = Vec::with_capacity(6);

    if let Some(c) = valid_coordinates(listing.coordinates()) {
        tokens.push(format!(
            "geo:{}:{}",
            (c.latitude / GEO_CELL_DEGREES).round() as i64,
            (c.longitude / GEO_CELL_DEGREES).round() as i64
        ));
    }
    if let Some(address) = listing.address() {
        let parsed = parse_address(address);
        if let Some(zip) = parsed.zip_code {
            tokens.push(format!("zip:{zip}"));
        }
        if let Some(hn) = parsed.house_number {
            tokens.push(format!("hn:{hn}"));
        }
    }
    if let Some(size) = positive(listing.size()) {
        tokens.push(format!("size:{}", (size / SIZE_BUCKET).round() as i64 * SIZE_BUCKET as i64));
    }
    if let Some(rooms) = positive(listing.rooms()) {
        tokens.push(format!("rooms:{rooms}"));
    }
    if let Some(price) = positive(listing.price()) {
        tokens.push(format!("price:{}", price_bucket(price)));
    }
    tokens
}

/// Hash of at least four bucketed factors; fewer factors yield `None`.
pub fn compute_fuzzy_identity<L: PropertyAttributes + ?Sized>(listing: &L) -> Option<String> {
    let tokens = fuzzy_factors(listing);
    if tokens.len() < MIN_FUZZY_FACTORS {
        return None;
    }
    Some(digest_tokens(tokens))
}

/// Geometric 2% buckets; below the price where 2% is narrower than
/// `MIN_PRICE_BUCKET`, fixed-width buckets.
fn price_bucket(price: f64) -> String {
    let threshold = MIN_PRICE_BUCKET / PRICE_BUCKET_RATIO;
    if price < threshold {
        format!("l{}", (price / MIN_PRICE_BUCKET).round() as i64)
    } else {
        format!("g{}", (price.ln() / (1.0 + PRICE_BUCKET_RATIO).ln()).round() as i64)
    }
}

/// Conservative AND-chain. Any missing size, rooms or price rejects; so do
/// conflicting ZIP or house numbers. Geo decides outside the 30–200 m band,
/// fuzzy identity equality inside it (or when coordinates are unavailable).
pub fn could_be_same_property<A, B>(l1: &A, l2: &B) -> bool
where
    A: PropertyAttributes + ?Sized,
    B: PropertyAttributes + ?Sized,
{
    if !l1.hash().is_empty() && l1.hash() == l2.hash() {
        return true;
    }

    let (Some(s1), Some(s2)) = (l1.size(), l2.size()) else {
        return false;
    };
    if relative_difference(s1, s2) > SAME_PROPERTY_SIZE_TOLERANCE {
        return false;
    }

    let (Some(r1), Some(r2)) = (l1.rooms(), l2.rooms()) else {
        return false;
    };
    if (r1 - r2).abs() > f64::EPSILON {
        return false;
    }

    let (Some(p1), Some(p2)) = (l1.price(), l2.price()) else {
        return false;
    };
    if relative_difference(p1, p2) > SAME_PROPERTY_PRICE_TOLERANCE {
        return false;
    }

    if let (Some(a1), Some(a2)) = (l1.address(), l2.address()) {
        let (p1, p2) = (parse_address(a1), parse_address(a2));
        if conflicts(p1.zip_code.as_deref(), p2.zip_code.as_deref())
            || conflicts(p1.house_number.as_deref(), p2.house_number.as_deref())
        {
            return false;
        }
    }

    let distance = match (l1.coordinates(), l2.coordinates()) {
        (Some(c1), Some(c2)) => distance_between(c1, c2),
        _ => None,
    };
    match distance {
        Some(d) if d <= SAME_PROPERTY_ACCEPT_M => true,
        Some(d) if d > SAME_PROPERTY_REJECT_M => false,
        _ => {
            let f1 = fuzzy_of(l1);
            let f2 = fuzzy_of(l2);
            matches!((f1, f2), (Some(a), Some(b)) if a == b)
        }
    }
}

fn fuzzy_of<L: PropertyAttributes + ?Sized>(listing: &L) -> Option<String> {
    listing
        .fuzzy_identity()
        .map(str::to_string)
        .or_else(|| compute_fuzzy_identity(listing))
}

fn conflicts(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a != b)
}

/// `|a - b| / max(|a|, |b|)`, 0 for equal values.
pub fn relative_difference(a: f64, b: f64) -> f64 {
    let max = a.abs().max(b.abs());
    if max == 0.0 {
        return 0.0;
    }
    (a - b).abs() / max
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

fn digest_tokens(mut tokens: Vec<String>) -> String {
    tokens.sort();
    let mut hasher = Sha256::new();
    hasher.update(tokens.join("|").as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(IDENTITY_HEX_LEN);
    hex
}
