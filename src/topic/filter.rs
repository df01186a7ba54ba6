//! Filter normalization and segment matching
//!
//! Subscription filters are normalized to a canonical form before
//! compilation, so syntactically different but equivalent filters share one
//! matcher key. Matching is segment-wise and total: the filter and topic are
//! split on `/` and compared level by level, with explicit handling for `+`
//! and a trailing `#` instead of a rewritten regular expression.
//!
//! Dialect rules:
//! - runs of the same wildcard inside a level collapse (`++` means `+`)
//! - repeated `/#` suffixes collapse to a single one
//! - `#` and `+` adjacent without a separator are rejected
//! - `+` matches exactly one non-empty level; a trailing `+` may also be
//!   absent entirely
//! - a trailing `#` matches its own level and everything after, or nothing
//! - a filter whose first level is a wildcard never matches `$`-topics

use std::fmt;

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::protocol::ProtocolError;

/// One compiled filter level
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Literal level, compared byte-for-byte
    Literal(CompactString),
    /// `+` - exactly one non-empty level
    Single,
    /// Trailing `+` - one non-empty level, optionally absent
    TrailingSingle,
    /// Trailing `#` - this level and everything after, optionally absent
    Multi,
}

/// A compiled topic filter
///
/// Equality and hashing go through the canonical filter string, so two
/// filters that normalize identically are the same matcher key.
#[derive(Debug, Clone)]
pub struct FilterPattern {
    canonical: Box<str>,
    segments: SmallVec<[Segment; 8]>,
}

impl PartialEq for FilterPattern {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for FilterPattern {}

impl std::hash::Hash for FilterPattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for FilterPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FilterPattern {
    /// Normalize and compile a filter string
    pub fn parse(filter: &str) -> Result<Self, ProtocolError> {
        let canonical = normalize(filter)?;
        let segments = compile(&canonical);
        Ok(Self {
            canonical: canonical.into_boxed_str(),
            segments,
        })
    }

    /// Canonical filter string (the matcher key)
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Whether this filter contains any wildcard level
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Evaluate the filter against a published topic name
    pub fn matches(&self, topic: &str) -> bool {
        // Wildcard-first filters never match $-topics
        if topic.starts_with('$') && !matches!(self.segments.first(), Some(Segment::Literal(_))) {
            return false;
        }

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let mut ti = 0;

        for segment in &self.segments {
            match segment {
                Segment::Multi => return true,
                Segment::Single => {
                    if ti >= levels.len() || levels[ti].is_empty() {
                        return false;
                    }
                    ti += 1;
                }
                Segment::TrailingSingle => {
                    // Absent level is a match
                    if ti >= levels.len() {
                        return true;
                    }
                    if levels[ti].is_empty() {
                        return false;
                    }
                    ti += 1;
                }
                Segment::Literal(lit) => {
                    if ti >= levels.len() || levels[ti] != lit.as_str() {
                        return false;
                    }
                    ti += 1;
                }
            }
        }

        ti == levels.len()
    }
}

/// Normalize a filter string to its canonical form
///
/// Collapses repeated wildcards, collapses repeated `/#` suffixes and
/// rejects levels mixing wildcards with other characters.
pub fn normalize(filter: &str) -> Result<String, ProtocolError> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidFilter("filter cannot be empty"));
    }
    if filter.len() > 65535 {
        return Err(ProtocolError::InvalidFilter("filter exceeds maximum length"));
    }
    if filter.contains('\0') {
        return Err(ProtocolError::InvalidFilter(
            "filter cannot contain null character",
        ));
    }

    let mut levels: SmallVec<[&str; 8]> = SmallVec::new();
    for level in filter.split('/') {
        levels.push(collapse_level(level)?);
    }

    // Collapse repeated /# suffixes: a/#/# means a/#
    while levels.len() >= 2
        && levels[levels.len() - 1] == "#"
        && levels[levels.len() - 2] == "#"
    {
        levels.pop();
    }

    // After suffix collapsing, # is only meaningful as the last level
    if levels[..levels.len() - 1].iter().any(|l| *l == "#") {
        return Err(ProtocolError::InvalidFilter(
            "multi-level wildcard must be the last level",
        ));
    }

    Ok(levels.join("/"))
}

/// Collapse wildcard runs within one level and reject malformed mixes
fn collapse_level(level: &str) -> Result<&str, ProtocolError> {
    let has_plus = level.contains('+');
    let has_hash = level.contains('#');

    if has_plus && has_hash {
        return Err(ProtocolError::InvalidFilter(
            "wildcards must be separated by a level separator",
        ));
    }
    if has_plus {
        if level.bytes().all(|b| b == b'+') {
            return Ok("+");
        }
        return Err(ProtocolError::InvalidFilter(
            "single-level wildcard must occupy entire level",
        ));
    }
    if has_hash {
        if level.bytes().all(|b| b == b'#') {
            return Ok("#");
        }
        return Err(ProtocolError::InvalidFilter(
            "multi-level wildcard must occupy entire level",
        ));
    }
    Ok(level)
}

fn compile(canonical: &str) -> SmallVec<[Segment; 8]> {
    let levels: SmallVec<[&str; 8]> = canonical.split('/').collect();
    // A `+` followed only by empty levels is still the last non-empty
    // segment and gets the trailing treatment
    let last_meaningful = levels
        .iter()
        .rposition(|level| !level.is_empty())
        .unwrap_or(levels.len() - 1);

    levels
        .iter()
        .enumerate()
        .map(|(i, level)| match *level {
            "#" => Segment::Multi,
            "+" if i == last_meaningful => Segment::TrailingSingle,
            "+" => Segment::Single,
            lit => Segment::Literal(CompactString::new(lit)),
        })
        .collect()
}

/// Validate a topic name used in PUBLISH (no wildcards allowed)
pub fn validate_topic(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopic("topic cannot be empty"));
    }
    if topic.len() > 65535 {
        return Err(ProtocolError::InvalidTopic("topic exceeds maximum length"));
    }
    if topic.contains('\0') {
        return Err(ProtocolError::InvalidTopic(
            "topic cannot contain null character",
        ));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(ProtocolError::InvalidTopic(
            "topic cannot contain wildcards",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a/++/b", "a/+/b" ; "repeated plus collapses")]
    #[test_case("a/###", "a/#" ; "repeated hash collapses")]
    #[test_case("a/#/#", "a/#" ; "repeated hash suffix collapses")]
    #[test_case("a/#/#/#", "a/#" ; "deep hash suffix collapses")]
    #[test_case("a/+/c", "a/+/c" ; "already canonical")]
    #[test_case("#", "#" ; "bare multi")]
    #[test_case("+", "+" ; "bare single")]
    fn test_normalize(filter: &str, expected: &str) {
        assert_eq!(normalize(filter).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("+#" ; "adjacent wildcards")]
    #[test_case("#+" ; "adjacent wildcards reversed")]
    #[test_case("a/+#/b" ; "adjacent wildcards mid filter")]
    #[test_case("a+" ; "plus with literal")]
    #[test_case("a#" ; "hash with literal")]
    #[test_case("a/#/b" ; "hash not last")]
    #[test_case("a/\0" ; "null character")]
    fn test_normalize_rejects(filter: &str) {
        assert!(normalize(filter).is_err());
    }

    #[test]
    fn test_normalize_idempotent() {
        for filter in ["a/++/b", "x/#/#", "###", "+/+/+", "dev/+"] {
            let once = normalize(filter).unwrap();
            assert_eq!(normalize(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_equivalent_filters_share_key() {
        let a = FilterPattern::parse("a/++/c").unwrap();
        let b = FilterPattern::parse("a/+/c").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test_case("a/b/c", "a/b/c", true ; "exact")]
    #[test_case("a/b/c", "a/+/c", true ; "single wildcard")]
    #[test_case("a//c", "a/+/c", false ; "single requires non-empty")]
    #[test_case("a/b", "a/+", true ; "trailing single present")]
    #[test_case("a", "a/+", true ; "trailing single absent")]
    #[test_case("a/", "a/+", false ; "trailing single empty level")]
    #[test_case("a", "a/+/", true ; "trailing single before empty suffix absent")]
    #[test_case("a/b/", "a/+/", true ; "trailing single before empty suffix present")]
    #[test_case("a/b", "a/+/", false ; "empty suffix requires empty level")]
    #[test_case("a/b/c", "a/+", false ; "trailing single too deep")]
    #[test_case("a/b/c/d", "a/#", true ; "multi deep")]
    #[test_case("a", "a/#", true ; "multi parent")]
    #[test_case("b/c", "a/#", false ; "multi wrong root")]
    #[test_case("anything/at/all", "#", true ; "bare multi")]
    #[test_case("$sys/uptime", "#", false ; "multi skips dollar topics")]
    #[test_case("$sys/uptime", "+/uptime", false ; "single skips dollar topics")]
    #[test_case("$sys/uptime", "$sys/+", true ; "literal dollar prefix matches")]
    #[test_case("a/b", "a", false ; "no partial match")]
    #[test_case("a", "a/b", false ; "filter longer than topic")]
    fn test_matches(topic: &str, filter: &str, expected: bool) {
        let pattern = FilterPattern::parse(filter).unwrap();
        assert_eq!(pattern.matches(topic), expected, "{} vs {}", topic, filter);
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("fleet/truck-7/telemetry").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("fleet/+/telemetry").is_err());
        assert!(validate_topic("fleet/#").is_err());
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            /// Matching depends only on the canonical form of the filter.
            #[test]
            fn match_is_function_of_canonical(
                filter in "[a-c+#/]{1,16}",
                topic in "[a-c/]{1,16}",
            ) {
                if let Ok(canonical) = normalize(&filter) {
                    let original = FilterPattern::parse(&filter).unwrap();
                    let reparsed = FilterPattern::parse(&canonical).unwrap();
                    prop_assert_eq!(reparsed.canonical(), original.canonical());
                    prop_assert_eq!(original.matches(&topic), reparsed.matches(&topic));
                }
            }

            #[test]
            fn normalize_is_idempotent(filter in "[a-c+#/]{1,16}") {
                if let Ok(once) = normalize(&filter) {
                    prop_assert_eq!(normalize(&once).unwrap(), once);
                }
            }
        }
    }
}
