//! Free-text German-style address parsing and comparison.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ZIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bDE?-\s?)?\b(\d{5})\b").expect("zip pattern compiles")
});

static HOUSE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*?[^\d\s])\s*(\d{1,4}\s?[a-z]?(?:\s?[-–/]\s?\d{1,4}\s?[a-z]?)?)$")
        .expect("house number pattern compiles")
});

static DISTRICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]*)\)").expect("district pattern compiles"));

/// Street-name prefixes that carry no identifying information.
const DIRECTIONAL_PREFIXES: &[&str] = &[
    "am", "an", "auf", "beim", "hinter", "im", "in", "unter", "vor", "zum", "zur",
];
const ARTICLES: &[&str] = &["das", "dem", "den", "der", "die"];

/// Abbreviations expanded when they end a word (`musterstr.` → `musterstrasse`).
/// `str` is expanded even without the trailing dot.
const SUFFIX_ABBREVIATIONS: &[(&str, &str, bool)] = &[
    ("str", "strasse", false),
    ("pl", "platz", true),
    ("ch", "chaussee", true),
];

/// Abbreviations expanded only as whole words.
const WORD_ABBREVIATIONS: &[(&str, &str)] = &[
    ("st", "sankt"),
    ("gr", "gross"),
    ("kl", "klein"),
    ("dr", "doktor"),
    ("prof", "professor"),
];

const STREET_SUFFIXES: &[&str] = &[
    "strasse", "str", "weg", "platz", "allee", "ring", "gasse", "damm", "ufer", "chaussee", "steig",
    "pfad", "markt",
];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedAddress {
    pub normalized: String,
    pub zip_code: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub street: Option<String>,
    pub house_number: Option<String>,
}

impl ParsedAddress {
    /// Leading digits of the house number, e.g. `12` for `12-14` or `12a`.
    pub fn house_number_base(&self) -> Option<&str> {
        let hn = self.house_number.as_deref()?;
        let end = hn
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(hn.len());
        (end > 0).then(|| &hn[..end])
    }
}

pub fn parse_address(text: &str) -> ParsedAddress {
    let text = text.trim();
    if text.is_empty() {
        return ParsedAddress::default();
    }

    let mut district = DISTRICT_RE
        .captures(text)
        .and_then(|c| non_empty(fold(&c[1])));
    let working = DISTRICT_RE.replace_all(text, " ");

    let mut zip_code = None;
    let mut city_raw: Option<String> = None;
    let mut rest: Vec<String> = Vec::new();

    for segment in working.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if zip_code.is_none() {
            if let Some((whole, zip)) = ZIP_RE
                .captures(segment)
                .and_then(|caps| Some((caps.get(0)?, caps.get(1)?)))
            {
                zip_code = Some(zip.as_str().to_string());
                let before = segment[..whole.start()].trim();
                let after = segment[whole.end()..].trim();
                if !after.is_empty() {
                    city_raw = Some(after.to_string());
                }
                if !before.is_empty() {
                    rest.push(before.to_string());
                }
                continue;
            }
        }
        rest.push(segment.to_string());
    }

    let mut street_raw: Option<String> = None;
    let mut house_number = None;
    if let Some(idx) = rest.iter().position(|s| HOUSE_NUMBER_RE.is_match(s)) {
        let segment = rest.remove(idx);
        if let Some(caps) = HOUSE_NUMBER_RE.captures(&segment) {
            street_raw = Some(caps[1].to_string());
            house_number = Some(normalize_house_number(&caps[2]));
        }
    } else if rest.first().is_some_and(|s| looks_like_street(s)) {
        street_raw = Some(rest.remove(0));
    }

    if city_raw.is_none() {
        city_raw = rest.pop();
    }

    let mut city = None;
    if let Some(raw) = city_raw {
        let (name, suffix) = split_city_district(&raw);
        city = non_empty(fold(name));
        if district.is_none() {
            district = suffix.and_then(|s| non_empty(fold(s)));
        }
    }

    let street = street_raw.and_then(|s| non_empty(normalize_street(&s)));

    let normalized = [
        street.as_deref(),
        house_number.as_deref(),
        zip_code.as_deref(),
        city.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");

    ParsedAddress {
        normalized,
        zip_code,
        city,
        district,
        street,
        house_number,
    }
}

/// Scores two free-text addresses 0–100: ZIP 25, city 15, street up to 40,
/// house number 20 (10 for a matching range base). Missing parts score 0.
pub fn compare_addresses(a: &str, b: &str) -> u32 {
    compare_parsed(&parse_address(a), &parse_address(b))
}

pub fn compare_parsed(a: &ParsedAddress, b: &ParsedAddress) -> u32 {
    let mut score = 0;
    if let (Some(za), Some(zb)) = (&a.zip_code, &b.zip_code) {
        if za == zb {
            score += 25;
        }
    }
    if let (Some(ca), Some(cb)) = (&a.city, &b.city) {
        if ca == cb {
            score += 15;
        }
    }
    if let (Some(sa), Some(sb)) = (&a.street, &b.street) {
        score += (street_similarity(sa, sb) * 40.0).round() as u32;
    }
    if let (Some(ha), Some(hb)) = (&a.house_number, &b.house_number) {
        if ha == hb {
            score += 20;
        } else if a.house_number_base().is_some() && a.house_number_base() == b.house_number_base()
        {
            score += 10;
        }
    }
    score.min(100)
}

/// Token-containment / prefix-overlap ratio between two normalized streets.
fn street_similarity(a: &str, b: &str) -> f64 {
    let ca: String = a.split_whitespace().collect();
    let cb: String = b.split_whitespace().collect();
    if ca.is_empty() || cb.is_empty() {
        return 0.0;
    }
    if ca == cb {
        return 1.0;
    }

    let (shorter, longer) = if ca.chars().count() <= cb.chars().count() {
        (&ca, &cb)
    } else {
        (&cb, &ca)
    };
    let short_len = shorter.chars().count() as f64;
    let long_len = longer.chars().count() as f64;

    let containment = if short_len >= 4.0 && longer.contains(shorter.as_str()) {
        0.7 + 0.3 * (short_len / long_len)
    } else {
        0.0
    };

    let prefix = ca
        .chars()
        .zip(cb.chars())
        .take_while(|(x, y)| x == y)
        .count() as f64;
    let prefix_ratio = prefix / long_len;

    containment.max(prefix_ratio)
}

/// Lower-cases and transliterates umlauts and `ß`.
pub fn fold(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.trim().to_lowercase().chars() {
        match ch {
            'ä' => out.push_str("ae"),
            'ö' => out.push_str("oe"),
            'ü' => out.push_str("ue"),
            'ß' => out.push_str("ss"),
            c => out.push(c),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_street(input: &str) -> String {
    let folded = fold(input).replace(['-', '/'], " ");
    let mut words: Vec<String> = folded
        .split_whitespace()
        .map(expand_abbreviation)
        .filter(|w| !w.is_empty())
        .collect();

    if words.len() > 1 && DIRECTIONAL_PREFIXES.contains(&words[0].as_str()) {
        words.remove(0);
        if words.len() > 1 && ARTICLES.contains(&words[0].as_str()) {
            words.remove(0);
        }
    }

    words.join(" ")
}

fn expand_abbreviation(word: &str) -> String {
    let had_dot = word.ends_with('.');
    let bare = word.trim_matches(|c: char| !c.is_alphanumeric());

    for (abbr, expansion) in WORD_ABBREVIATIONS {
        if bare == *abbr {
            return (*expansion).to_string();
        }
    }
    for (abbr, expansion, needs_dot) in SUFFIX_ABBREVIATIONS {
        if bare.ends_with(abbr) && (had_dot || !needs_dot) {
            let stem = &bare[..bare.len() - abbr.len()];
            return format!("{stem}{expansion}");
        }
    }
    bare.to_string()
}

fn normalize_house_number(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '–' || c == '/' { '-' } else { c })
        .collect()
}

fn looks_like_street(segment: &str) -> bool {
    let normalized = normalize_street(segment);
    normalized
        .split_whitespace()
        .any(|w| STREET_SUFFIXES.iter().any(|s| w.ends_with(s)))
}

fn split_city_district(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('-') {
        Some((city, district)) if !city.trim().is_empty() && !district.trim().is_empty() => {
            (city.trim(), Some(district.trim()))
        }
        _ => (raw.trim(), None),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_street_number_zip_and_city() {
        let parsed = parse_address("Musterstr. 12, 10115 Berlin");
        assert_eq!(parsed.street.as_deref(), Some("musterstrasse"));
        assert_eq!(parsed.house_number.as_deref(), Some("12"));
        assert_eq!(parsed.zip_code.as_deref(), Some("10115"));
        assert_eq!(parsed.city.as_deref(), Some("berlin"));
        assert_eq!(parsed.normalized, "musterstrasse 12 10115 berlin");
    }

    #[test]
    fn abbreviation_and_umlaut_variants_normalize_identically() {
        let a = parse_address("Musterstr. 12, 10115 Berlin");
        let b = parse_address("Musterstraße 12, 10115 Berlin");
        assert_eq!(a, b);
    }

    #[test]
    fn zip_prefix_and_hyphenated_district() {
        let parsed = parse_address("D-10115 Berlin-Mitte");
        assert_eq!(parsed.zip_code.as_deref(), Some("10115"));
        assert_eq!(parsed.city.as_deref(), Some("berlin"));
        assert_eq!(parsed.district.as_deref(), Some("mitte"));
        assert_eq!(parsed.street, None);
    }

    #[test]
    fn parenthetical_district_and_directional_prefix() {
        let parsed = parse_address("Am Kupfergraben 6a (Mitte), 10117 Berlin");
        assert_eq!(parsed.street.as_deref(), Some("kupfergraben"));
        assert_eq!(parsed.house_number.as_deref(), Some("6a"));
        assert_eq!(parsed.district.as_deref(), Some("mitte"));
        assert_eq!(parsed.city.as_deref(), Some("berlin"));
    }

    #[test]
    fn house_number_ranges_keep_their_base() {
        let parsed = parse_address("Königsallee 12 - 14, 40212 Düsseldorf");
        assert_eq!(parsed.house_number.as_deref(), Some("12-14"));
        assert_eq!(parsed.house_number_base(), Some("12"));
        assert_eq!(parsed.street.as_deref(), Some("koenigsallee"));
        assert_eq!(parsed.city.as_deref(), Some("duesseldorf"));
    }

    #[test]
    fn empty_input_yields_empty_parse() {
        assert_eq!(parse_address("   "), ParsedAddress::default());
    }

    #[test]
    fn identical_addresses_score_full_marks() {
        assert_eq!(
            compare_addresses("Musterstr. 12, 10115 Berlin", "Musterstraße 12, 10115 Berlin"),
            100
        );
    }

    #[test]
    fn range_base_match_scores_partial_house_points() {
        let score = compare_addresses("Hauptstr. 12, 10115 Berlin", "Hauptstraße 12-14, 10115 Berlin");
        assert_eq!(score, 25 + 15 + 40 + 10);
    }

    #[test]
    fn missing_parts_contribute_nothing() {
        assert_eq!(compare_addresses("10115 Berlin", "Musterstraße 12"), 0);
        assert_eq!(compare_addresses("", "Musterstraße 12, 10115 Berlin"), 0);
        assert_eq!(compare_addresses("10115 Berlin", "10115 Berlin"), 40);
    }

    #[test]
    fn different_streets_in_same_city_score_low() {
        let score = compare_addresses("Musterstraße 12, 10115 Berlin", "Beispielweg 3, 10115 Berlin");
        assert!(score < 50, "score was {score}");
    }
}
