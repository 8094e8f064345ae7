//! Five-factor similarity scoring for human-reviewed cross-platform linking.
//!
//! The tolerances here are deliberately looser than the ones in
//! [`crate::identity`]; a score only ever feeds a review decision.

use serde::{Deserialize, Serialize};

use crate::address::compare_addresses;
use crate::geo::{distance_between, score_for_distance};
use crate::identity::{could_be_same_property, relative_difference};
use crate::{Listing, PropertyAttributes};

pub const ADDRESS_WEIGHT: u32 = 40;
pub const SIZE_WEIGHT: u32 = 20;
pub const GEO_WEIGHT: u32 = 20;
pub const ROOMS_WEIGHT: u32 = 10;
pub const PRICE_WEIGHT: u32 = 10;

/// `(max relative difference, share of the factor weight)`.
const SIZE_BANDS: &[(f64, f64)] = &[(0.05, 1.0), (0.10, 0.8), (0.20, 0.5)];
const PRICE_BANDS: &[(f64, f64)] = &[(0.05, 1.0), (0.10, 0.8), (0.15, 0.5)];
const ROOMS_BANDS: &[(f64, f64)] = &[(0.05, 1.0), (0.10, 0.8), (0.20, 0.5)];

const HIGH_THRESHOLD: u32 = 80;
const MEDIUM_THRESHOLD: u32 = 60;
const LOW_THRESHOLD: u32 = 40;
const STRONG_GEO_M: f64 = 50.0;
const STRONG_ADDRESS: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub points: u32,
    pub max_points: u32,
    pub available: bool,
    pub detail: Option<String>,
}

impl FactorScore {
    fn unavailable(max_points: u32) -> Self {
        Self {
            points: 0,
            max_points,
            available: false,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityFactors {
    pub address: FactorScore,
    pub size: FactorScore,
    pub geo: FactorScore,
    pub rooms: FactorScore,
    pub price: FactorScore,
}

impl SimilarityFactors {
    pub fn all(&self) -> [&FactorScore; 5] {
        [&self.address, &self.size, &self.geo, &self.rooms, &self.price]
    }

    pub fn available_count(&self) -> usize {
        self.all().iter().filter(|f| f.available).count()
    }

    pub fn total(&self) -> u32 {
        self.all().iter().map(|f| f.points.min(f.max_points)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub score: u32,
    pub confidence: Confidence,
    pub factors: SimilarityFactors,
    pub recommendation: String,
    /// Verdict of the stricter automatic-linking predicate.
    pub same_property: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityOptions {
    pub min_score: u32,
    pub max_results: usize,
}

impl Default for SimilarityOptions {
    fn default() -> Self {
        Self {
            min_score: LOW_THRESHOLD,
            max_results: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub listing: Listing,
    pub similarity: SimilarityResult,
}

pub fn compute_similarity<A, B>(l1: &A, l2: &B) -> SimilarityResult
where
    A: PropertyAttributes + ?Sized,
    B: PropertyAttributes + ?Sized,
{
    let mut address_sub = None;
    let address = match (non_blank(l1.address()), non_blank(l2.address())) {
        (Some(a), Some(b)) => {
            let sub = compare_addresses(a, b);
            address_sub = Some(sub);
            FactorScore {
                points: ((sub * ADDRESS_WEIGHT) as f64 / 100.0).round() as u32,
                max_points: ADDRESS_WEIGHT,
                available: true,
                detail: Some(format!("address match {sub}/100")),
            }
        }
        _ => FactorScore::unavailable(ADDRESS_WEIGHT),
    };

    let mut geo_distance = None;
    let geo = match (l1.coordinates(), l2.coordinates()) {
        (Some(c1), Some(c2)) => match distance_between(c1, c2) {
            Some(distance) => {
                geo_distance = Some(distance);
                FactorScore {
                    points: score_for_distance(distance).min(GEO_WEIGHT),
                    max_points: GEO_WEIGHT,
                    available: true,
                    detail: Some(format!("{distance:.1} m apart")),
                }
            }
            None => FactorScore::unavailable(GEO_WEIGHT),
        },
        _ => FactorScore::unavailable(GEO_WEIGHT),
    };

    let factors = SimilarityFactors {
        address,
        size: tiered_factor(l1.size(), l2.size(), SIZE_WEIGHT, SIZE_BANDS),
        geo,
        rooms: tiered_factor(l1.rooms(), l2.rooms(), ROOMS_WEIGHT, ROOMS_BANDS),
        price: tiered_factor(l1.price(), l2.price(), PRICE_WEIGHT, PRICE_BANDS),
    };

    let score = factors.total().min(100);
    let confidence = classify(score, factors.available_count(), geo_distance, address_sub);

    SimilarityResult {
        score,
        confidence,
        recommendation: recommendation_for(score).to_string(),
        same_property: could_be_same_property(l1, l2),
        factors,
    }
}

/// Ranks `candidates` against `target`, skipping the target itself (by id or
/// hash), dropping scores below `min_score` and keeping the best `max_results`.
pub fn find_similar_listings(
    target: &Listing,
    candidates: &[Listing],
    options: SimilarityOptions,
) -> Vec<SimilarMatch> {
    let mut matches: Vec<SimilarMatch> = candidates
        .iter()
        .filter(|c| c.id != target.id && c.hash != target.hash)
        .map(|c| SimilarMatch {
            similarity: compute_similarity(target, c),
            listing: c.clone(),
        })
        .filter(|m| m.similarity.score >= options.min_score)
        .collect();
    matches.sort_by(|a, b| b.similarity.score.cmp(&a.similarity.score));
    matches.truncate(options.max_results);
    matches
}

fn tiered_factor(a: Option<f64>, b: Option<f64>, weight: u32, bands: &[(f64, f64)]) -> FactorScore {
    let (Some(a), Some(b)) = (a, b) else {
        return FactorScore::unavailable(weight);
    };
    if !a.is_finite() || !b.is_finite() {
        return FactorScore::unavailable(weight);
    }
    let diff = relative_difference(a, b);
    let share = bands
        .iter()
        .find(|(max, _)| diff <= *max)
        .map(|(_, share)| *share)
        .unwrap_or(0.0);
    FactorScore {
        points: (weight as f64 * share).round() as u32,
        max_points: weight,
        available: true,
        detail: Some(format!("{:.1}% difference", diff * 100.0)),
    }
}

fn classify(
    score: u32,
    available: usize,
    geo_distance: Option<f64>,
    address_sub: Option<u32>,
) -> Confidence {
    let mut confidence = if score >= HIGH_THRESHOLD {
        Confidence::High
    } else if score >= MEDIUM_THRESHOLD {
        Confidence::Medium
    } else if score >= LOW_THRESHOLD {
        Confidence::Low
    } else {
        Confidence::None
    };

    if let (Some(distance), Some(sub)) = (geo_distance, address_sub) {
        if distance <= STRONG_GEO_M && sub >= STRONG_ADDRESS && score >= MEDIUM_THRESHOLD {
            confidence = Confidence::High;
        }
    }

    match available {
        0 | 1 => confidence.min(Confidence::Low),
        2 => confidence.min(Confidence::Medium),
        _ => confidence,
    }
}

fn recommendation_for(score: u32) -> &'static str {
    match score {
        90.. => "Almost certainly the same property; safe to link",
        80..=89 => "Very likely the same property; linking recommended",
        70..=79 => "Likely the same property; review details before linking",
        60..=69 => "Possibly the same property; compare photos and details manually",
        40..=59 => "Weak similarity; probably a different property",
        _ => "Different property",
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewListing;
    use chrono::Utc;
    use uuid::Uuid;

    fn base(hash: &str) -> NewListing {
        let mut l = NewListing::new(hash, "fixture", "Helle 3-Zimmer-Wohnung", Utc::now());
        l.address = Some("Musterstr. 12, 10115 Berlin".into());
        l.size = Some(100.0);
        l.rooms = Some(3.0);
        l.price = Some(1000.0);
        l.latitude = Some(52.5200);
        l.longitude = Some(13.4050);
        l
    }

    #[test]
    fn mixed_factor_pair_scores_75_with_medium_confidence() {
        let a = base("a");
        let mut b = base("b");
        b.address = Some("Musterstraße 12, 10115 Berlin".into());
        b.size = Some(97.0);
        b.price = Some(1120.0);
        b.latitude = Some(52.5245);

        let result = compute_similarity(&a, &b);
        assert_eq!(result.factors.address.points, 40);
        assert_eq!(result.factors.size.points, 20);
        assert_eq!(result.factors.geo.points, 0);
        assert!(result.factors.geo.available);
        assert_eq!(result.factors.rooms.points, 10);
        assert_eq!(result.factors.price.points, 5);
        assert_eq!(result.score, 75);
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(
            result.recommendation,
            "Likely the same property; review details before linking"
        );
        assert!(!result.same_property);
    }

    #[test]
    fn identical_listings_score_100_high() {
        let result = compute_similarity(&base("a"), &base("b"));
        assert_eq!(result.score, 100);
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.same_property);
    }

    #[test]
    fn strong_geo_and_address_elevate_to_high() {
        let a = base("a");
        let mut b = base("b");
        b.size = Some(120.0);
        b.price = Some(1300.0);
        b.rooms = Some(4.0);
        let result = compute_similarity(&a, &b);
        assert!(result.score >= 60 && result.score < 80, "score {}", result.score);
        assert_eq!(result.confidence, Confidence::High);
    }

    #[test]
    fn few_available_factors_cap_confidence() {
        let mut a = NewListing::new("a", "p", "x", Utc::now());
        let mut b = NewListing::new("b", "p", "y", Utc::now());
        a.size = Some(50.0);
        b.size = Some(50.0);
        a.rooms = Some(2.0);
        b.rooms = Some(2.0);
        let result = compute_similarity(&a, &b);
        assert_eq!(result.factors.available_count(), 2);
        assert_eq!(result.score, 30);
        assert!(result.confidence <= Confidence::Medium);

        a.address = Some("Musterstr. 12, 10115 Berlin".into());
        b.address = Some("Musterstr. 12, 10115 Berlin".into());
        a.rooms = None;
        let result = compute_similarity(&a, &b);
        assert_eq!(result.factors.available_count(), 2);
        assert_eq!(result.score, 60);
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[test]
    fn score_stays_within_bounds_for_sparse_and_dense_pairs() {
        let empty = NewListing::new("e", "p", "x", Utc::now());
        let pairs = [
            compute_similarity(&empty, &empty.clone()),
            compute_similarity(&base("a"), &empty),
            compute_similarity(&base("a"), &base("b")),
        ];
        for result in pairs {
            assert!(result.score <= 100);
            for factor in result.factors.all() {
                assert!(factor.points <= factor.max_points);
            }
            assert_eq!(result.score, result.factors.total());
        }
    }

    fn persisted(new: NewListing) -> Listing {
        Listing::from_new(Uuid::new_v4(), "job", new)
    }

    #[test]
    fn find_similar_excludes_self_filters_and_ranks() {
        let target = persisted(base("t"));
        let mut same_hash = base("t");
        same_hash.price = Some(1000.0);
        let mut weak = base("w");
        weak.address = Some("Beispielweg 3, 80331 München".into());
        weak.latitude = Some(48.137);
        weak.longitude = Some(11.575);
        let mut close = base("c");
        close.price = Some(1080.0);

        let candidates = vec![
            target.clone(),
            persisted(same_hash),
            persisted(weak),
            persisted(close),
            persisted(base("exact")),
        ];
        let matches = find_similar_listings(
            &target,
            &candidates,
            SimilarityOptions {
                min_score: 60,
                max_results: 5,
            },
        );
        let hashes: Vec<_> = matches.iter().map(|m| m.listing.hash.as_str()).collect();
        assert_eq!(hashes, vec!["exact", "c"]);
        assert!(matches[0].similarity.score >= matches[1].similarity.score);

        let top = find_similar_listings(
            &target,
            &candidates,
            SimilarityOptions {
                min_score: 0,
                max_results: 1,
            },
        );
        assert_eq!(top.len(), 1);
    }
}
