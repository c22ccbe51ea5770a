// Device resolver - raw vendor text to catalog display name
// Ranked strategy table instead of chained if/else: each strategy is a
// pure scoring function, independently testable, evaluated over the whole
// active catalog. Deterministic for a given snapshot.

use serde::{Deserialize, Serialize};

use crate::catalog::{canonicalize, Device, DeviceCatalog};

// ============================================================================
// MATCH STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    /// Canonical forms are equal.
    Exact,

    /// Code shaped LETTERS+DIGITS with fewer than 3 digits, digits padded
    /// to 3: "FMC3" -> "FMC003".
    DigitPad,

    /// Code shaped LETTERS+DIGITS with more than 3 digits, truncated to
    /// the first 3: "FMC9202" -> "FMC920".
    DigitTruncate,

    /// Raw canonical starts with the catalog canonical. The longest
    /// matching catalog entry wins, so "FMC920" beats "FMC9" for
    /// "FMC9202MAUWU".
    Prefix,

    /// Catalog canonical starts with the raw canonical - truncated vendor
    /// strings. Lowest band.
    ReversePrefix,
}

impl MatchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::DigitPad => "digit-pad",
            MatchStrategy::DigitTruncate => "digit-truncate",
            MatchStrategy::Prefix => "prefix",
            MatchStrategy::ReversePrefix => "reverse-prefix",
        }
    }
}

// Score bands. A strategy's score never crosses into the band above it,
// so the ranking in the table is absolute.
const SCORE_EXACT: u32 = 1000;
const SCORE_DIGIT_PAD: u32 = 900;
const SCORE_DIGIT_TRUNCATE: u32 = 850;
const SCORE_PREFIX_BASE: u32 = 600;
const SCORE_REVERSE_PREFIX_BASE: u32 = 400;

/// Minimum score for a match to count. Everything at or above the
/// reverse-prefix band passes; a strategy returning None never matches.
pub const MATCH_THRESHOLD: u32 = SCORE_REVERSE_PREFIX_BASE;

// Prefix strategies need a minimum stem to say anything at all.
const MIN_PREFIX_LEN: usize = 3;

// ============================================================================
// RESOLUTION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    Matched {
        display_name: String,
        strategy: MatchStrategy,
        score: u32,
    },
    Unresolved,
}

impl Resolution {
    pub fn display_name(&self) -> Option<&str> {
        match self {
            Resolution::Matched { display_name, .. } => Some(display_name),
            Resolution::Unresolved => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Matched { .. })
    }
}

// ============================================================================
// STRATEGY TABLE
// ============================================================================

type ScoreFn = fn(&str, &str) -> Option<u32>;

/// Ranked strategy table. Order documents the ranking; the actual
/// precedence is carried by the score bands, so evaluating all entries
/// and taking the maximum is equivalent to trying them in order.
const STRATEGIES: &[(MatchStrategy, ScoreFn)] = &[
    (MatchStrategy::Exact, score_exact),
    (MatchStrategy::DigitPad, score_digit_pad),
    (MatchStrategy::DigitTruncate, score_digit_truncate),
    (MatchStrategy::Prefix, score_prefix),
    (MatchStrategy::ReversePrefix, score_reverse_prefix),
];

fn score_exact(raw_canon: &str, device_canon: &str) -> Option<u32> {
    (raw_canon == device_canon).then_some(SCORE_EXACT)
}

fn score_digit_pad(raw_canon: &str, device_canon: &str) -> Option<u32> {
    let (letters, digits) = split_device_code(raw_canon)?;
    if digits.len() >= 3 {
        return None;
    }
    let padded = format!("{}{:0>3}", letters, digits);
    (padded == device_canon).then_some(SCORE_DIGIT_PAD)
}

fn score_digit_truncate(raw_canon: &str, device_canon: &str) -> Option<u32> {
    let (letters, digits) = split_device_code(raw_canon)?;
    if digits.len() <= 3 {
        return None;
    }
    let truncated = format!("{}{}", letters, &digits[..3]);
    (truncated == device_canon).then_some(SCORE_DIGIT_TRUNCATE)
}

fn score_prefix(raw_canon: &str, device_canon: &str) -> Option<u32> {
    if device_canon.len() < MIN_PREFIX_LEN || raw_canon == device_canon {
        return None;
    }
    // Longer catalog canonical => higher score, so the most specific
    // entry wins over an ambiguous shorter prefix.
    raw_canon
        .starts_with(device_canon)
        .then(|| SCORE_PREFIX_BASE + device_canon.len() as u32)
}

fn score_reverse_prefix(raw_canon: &str, device_canon: &str) -> Option<u32> {
    if raw_canon.len() < MIN_PREFIX_LEN || raw_canon == device_canon {
        return None;
    }
    device_canon
        .starts_with(raw_canon)
        .then(|| SCORE_REVERSE_PREFIX_BASE + raw_canon.len() as u32)
}

/// Split a canonical code into (leading letters, following digits).
/// Trailing text after the digit run is ignored: "FMC9202MAUWU" splits as
/// ("FMC", "9202"). Returns None unless both parts are non-empty.
fn split_device_code(canon: &str) -> Option<(&str, &str)> {
    let letters_end = canon.find(|c: char| !c.is_ascii_alphabetic())?;
    if letters_end == 0 {
        return None;
    }

    let rest = &canon[letters_end..];
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }

    Some((&canon[..letters_end], &rest[..digits_end]))
}

// ============================================================================
// RESOLVE
// ============================================================================

/// Resolve a raw vendor device string against a catalog snapshot.
///
/// Pure over its inputs: two calls with the same string and snapshot
/// return the same result. Ties are broken by score, then by catalog
/// canonical length (more specific wins), then by canonical name - never
/// by iteration order.
pub fn resolve(raw: &str, catalog: &DeviceCatalog) -> Resolution {
    let raw_canon = canonicalize(raw);
    if raw_canon.is_empty() {
        return Resolution::Unresolved;
    }

    let mut best: Option<(u32, MatchStrategy, &Device)> = None;

    for device in catalog.active() {
        for (strategy, score_fn) in STRATEGIES {
            let Some(score) = score_fn(&raw_canon, &device.canonical_name) else {
                continue;
            };
            if score < MATCH_THRESHOLD {
                continue;
            }

            let better = match best {
                None => true,
                Some((best_score, _, best_device)) => {
                    (
                        score,
                        device.canonical_name.len(),
                        std::cmp::Reverse(device.canonical_name.as_str()),
                    ) > (
                        best_score,
                        best_device.canonical_name.len(),
                        std::cmp::Reverse(best_device.canonical_name.as_str()),
                    )
                }
            };
            if better {
                best = Some((score, *strategy, device));
            }
        }
    }

    match best {
        Some((score, strategy, device)) => Resolution::Matched {
            display_name: device.display_name.clone(),
            strategy,
            score,
        },
        None => Resolution::Unresolved,
    }
}

/// Convenience wrapper returning just the display name.
pub fn resolve_display(raw: &str, catalog: &DeviceCatalog) -> Option<String> {
    match resolve(raw, catalog) {
        Resolution::Matched { display_name, .. } => Some(display_name),
        Resolution::Unresolved => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: i64, name: &str) -> Device {
        Device {
            id,
            canonical_name: canonicalize(name),
            display_name: name.to_string(),
            active: true,
            units_per_serial: 1,
        }
    }

    fn catalog(names: &[&str]) -> DeviceCatalog {
        DeviceCatalog::new(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| device(i as i64 + 1, n))
                .collect(),
        )
    }

    #[test]
    fn test_exact_match() {
        let cat = catalog(&["FMC920", "CV200"]);
        let res = resolve("fmc-920", &cat);

        assert_eq!(res.display_name(), Some("FMC920"));
        assert!(matches!(
            res,
            Resolution::Matched { strategy: MatchStrategy::Exact, .. }
        ));
    }

    #[test]
    fn test_digit_pad_strategy() {
        // "FMC3" pads to "FMC003"
        let cat = catalog(&["FMC003"]);
        let res = resolve("FMC3", &cat);

        assert_eq!(res.display_name(), Some("FMC003"));
        assert!(matches!(
            res,
            Resolution::Matched { strategy: MatchStrategy::DigitPad, .. }
        ));
    }

    #[test]
    fn test_digit_truncate_strategy() {
        // "FMC9202" truncates to "FMC920"
        let cat = catalog(&["FMC920"]);
        let res = resolve("FMC9202", &cat);

        assert_eq!(res.display_name(), Some("FMC920"));
        assert!(matches!(
            res,
            Resolution::Matched { strategy: MatchStrategy::DigitTruncate, .. }
        ));
    }

    #[test]
    fn test_truncate_ignores_trailing_letters() {
        // Full block cell prefix, digits followed by more text
        let cat = catalog(&["FMC920"]);
        let res = resolve("FMC9202MAUWU", &cat);

        assert_eq!(res.display_name(), Some("FMC920"));
    }

    #[test]
    fn test_prefix_prefers_longest_catalog_entry() {
        // Both FMC9 and FMC920 are prefixes of the raw string; the longer,
        // more specific entry must win.
        let cat = catalog(&["FMC9", "FMC920"]);
        let res = resolve("FMC920XYZT", &cat);

        assert_eq!(res.display_name(), Some("FMC920"));
        assert!(matches!(
            res,
            Resolution::Matched { strategy: MatchStrategy::Prefix, .. }
        ));
    }

    #[test]
    fn test_reverse_prefix_for_truncated_vendor_string() {
        let cat = catalog(&["CV200XEU"]);
        let res = resolve("CV200", &cat);

        assert_eq!(res.display_name(), Some("CV200XEU"));
        assert!(matches!(
            res,
            Resolution::Matched { strategy: MatchStrategy::ReversePrefix, .. }
        ));
    }

    #[test]
    fn test_unresolved_below_threshold() {
        let cat = catalog(&["FMC920"]);
        assert_eq!(resolve("TOTALLYUNKNOWN", &cat), Resolution::Unresolved);
        assert_eq!(resolve("", &cat), Resolution::Unresolved);
        // Two-char stem is too short for prefix matching
        assert_eq!(resolve("FM", &cat), Resolution::Unresolved);
    }

    #[test]
    fn test_inactive_devices_never_match() {
        let mut dev = device(1, "FMC920");
        dev.active = false;
        let cat = DeviceCatalog::new(vec![dev]);

        assert_eq!(resolve("FMC920", &cat), Resolution::Unresolved);
    }

    #[test]
    fn test_resolver_is_deterministic() {
        let cat = catalog(&["FMC920", "FMC9", "CV200", "CV200XEU"]);
        for raw in ["FMC9202MAUWU", "CV200", "FMC3", "junk"] {
            assert_eq!(resolve(raw, &cat), resolve(raw, &cat));
        }
        assert!(resolve("CV200", &cat).is_resolved());
        assert!(!resolve("junk", &cat).is_resolved());
    }

    #[test]
    fn test_exact_beats_prefix() {
        let cat = catalog(&["FMC9", "FMC920"]);
        let res = resolve("FMC9", &cat);

        // FMC9 is exact for one entry and a reverse prefix of the other
        assert_eq!(res.display_name(), Some("FMC9"));
        assert!(matches!(
            res,
            Resolution::Matched { strategy: MatchStrategy::Exact, .. }
        ));
    }

    #[test]
    fn test_split_device_code() {
        assert_eq!(split_device_code("FMC9202MAUWU"), Some(("FMC", "9202")));
        assert_eq!(split_device_code("FMC3"), Some(("FMC", "3")));
        assert_eq!(split_device_code("920FMC"), None);
        assert_eq!(split_device_code("FMC"), None);
        assert_eq!(split_device_code(""), None);
    }
}
