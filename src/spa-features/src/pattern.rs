//! URL pattern matching and specificity scoring.
//!
//! Patterns are regular expressions tested against the full page URL. When
//! several features match the same URL, [`specificity`] orders them so that
//! narrower patterns are processed first by the resolver.
//!
//! The score is a heuristic over the pattern *source text*, not a formal
//! measure of generality. A long pattern full of wildcards can still outscore
//! a short exact one.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::{FeatureError, Result};

/// Bonus for patterns that pin down a query string with an escaped `?`.
const QUERY_BONUS: f64 = 10.0;

/// Penalty per `.*` wildcard.
const MATCH_ANY_PENALTY: f64 = 2.0;

/// Penalty per unescaped `+`.
const ONE_OR_MORE_PENALTY: f64 = 1.0;

/// Pattern length is divided by this and added as a tie-breaker.
const LENGTH_DIVISOR: f64 = 20.0;

/// Compute the specificity score of a pattern source.
///
/// - `+1` per path separator (`/` or `\/`)
/// - `+10` if the source contains an escaped `?`
/// - `-2` per `.*`
/// - `-1` per `+` that is not escaped
/// - `+len/20`
///
/// Pure and deterministic; the URL being matched plays no part.
pub fn specificity(source: &str) -> f64 {
    let chars: Vec<char> = source.chars().collect();
    let mut separators = 0usize;
    let mut pins_query = false;
    let mut match_any = 0usize;
    let mut one_or_more = 0usize;

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                match chars.get(i + 1) {
                    Some('/') => separators += 1,
                    Some('?') => pins_query = true,
                    _ => {}
                }
                // Skip the escaped character.
                i += 2;
                continue;
            }
            '/' => separators += 1,
            '.' if chars.get(i + 1) == Some(&'*') => {
                match_any += 1;
                i += 2;
                continue;
            }
            '+' => one_or_more += 1,
            _ => {}
        }
        i += 1;
    }

    let mut score = separators as f64;
    if pins_query {
        score += QUERY_BONUS;
    }
    score -= MATCH_ANY_PENALTY * match_any as f64;
    score -= ONE_OR_MORE_PENALTY * one_or_more as f64;
    score + chars.len() as f64 / LENGTH_DIVISOR
}

/// Captured groups of a successful pattern match.
///
/// Index 0 is the whole match. Groups that did not participate are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    groups: Vec<Option<String>>,
    named: BTreeMap<String, String>,
}

impl MatchResult {
    /// The full matched text.
    pub fn full(&self) -> &str {
        self.get(0).unwrap_or_default()
    }

    /// Get a positional group.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    /// Get a named group.
    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    /// All positional groups, including the whole match at index 0.
    pub fn groups(&self) -> &[Option<String>] {
        &self.groups
    }

    /// Number of positional groups, including the whole match.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no groups were captured.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A compiled URL pattern.
#[derive(Clone)]
pub struct UrlPattern {
    regex: Regex,
    specificity: f64,
}

impl UrlPattern {
    /// Compile a pattern.
    pub fn new(source: &str) -> std::result::Result<Self, regex::Error> {
        let regex = Regex::new(source)?;
        Ok(Self {
            specificity: specificity(regex.as_str()),
            regex,
        })
    }

    /// Compile a pattern on behalf of a feature, mapping the error.
    pub fn compile(feature: &str, source: &str) -> Result<Self> {
        Self::new(source).map_err(|e| FeatureError::invalid_pattern(feature, e.to_string()))
    }

    /// Pattern source text.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Precomputed specificity of this pattern.
    pub fn specificity(&self) -> f64 {
        self.specificity
    }

    /// Test the pattern against a URL.
    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    /// Match a URL and capture its groups.
    pub fn captures(&self, url: &str) -> Option<MatchResult> {
        let caps = self.regex.captures(url)?;

        let groups = caps
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect();

        let named = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();

        Some(MatchResult { groups, named })
    }

    /// Specificity if the pattern matches the URL.
    pub fn score(&self, url: &str) -> Option<f64> {
        self.is_match(url).then_some(self.specificity)
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlPattern")
            .field("source", &self.as_str())
            .field("specificity", &self.specificity)
            .finish()
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_separator_baseline() {
        // 3 separators + 7/20
        assert!(approx(specificity("/a/b/cd"), 3.0 + 7.0 / 20.0));
        // Escaped separators count too
        assert!(approx(specificity(r"\/a\/b"), 2.0 + 6.0 / 20.0));
    }

    #[test]
    fn test_query_bonus() {
        let plain = specificity(r"/search");
        let pinned = specificity(r"/search\?q=");
        assert!(pinned - plain > 10.0);
    }

    #[test]
    fn test_unescaped_question_mark_is_not_a_query() {
        // `s?` is an optional quantifier, not a query delimiter
        assert!(approx(specificity("/cards?"), 1.0 + 7.0 / 20.0));
    }

    #[test]
    fn test_wildcard_penalties() {
        assert!(approx(specificity("/a/.*"), 2.0 - 2.0 + 5.0 / 20.0));
        assert!(approx(specificity(r"/a/\w+"), 2.0 - 1.0 + 6.0 / 20.0));
        // Escaped plus is a literal
        assert!(approx(specificity(r"/a\+b"), 1.0 + 5.0 / 20.0));
        // Escaped dot followed by star is not a match-anything wildcard
        assert!(approx(specificity(r"/a\.*"), 1.0 + 5.0 / 20.0));
    }

    #[test]
    fn test_longer_segment_pattern_scores_higher() {
        let cards = specificity(r"/cards/(\w+)");
        let summary = specificity(r"/cards/(\w+)/summary");
        assert!(summary > cards);
    }

    #[test]
    fn test_deterministic() {
        let source = r"/boards/(\d+)/cards/.*";
        assert_eq!(specificity(source), specificity(source));
    }

    #[test]
    fn test_captures() {
        let pattern = UrlPattern::new(r"/cards/(\w+)").unwrap();
        let result = pattern
            .captures("https://example.com/cards/42/summary")
            .unwrap();

        assert_eq!(result.full(), "/cards/42");
        assert_eq!(result.get(1), Some("42"));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_named_captures() {
        let pattern = UrlPattern::new(r"/boards/(?P<board>\d+)(?:/(?P<tab>\w+))?").unwrap();
        let result = pattern.captures("https://example.com/boards/7").unwrap();

        assert_eq!(result.name("board"), Some("7"));
        assert_eq!(result.name("tab"), None);
        assert_eq!(result.get(2), None);
    }

    #[test]
    fn test_no_match() {
        let pattern = UrlPattern::new(r"/cards/\d+").unwrap();
        assert!(pattern.captures("https://example.com/boards/1").is_none());
        assert_eq!(pattern.score("https://example.com/boards/1"), None);
    }

    #[test]
    fn test_score_on_match() {
        let pattern = UrlPattern::new(r"/cards/").unwrap();
        assert_eq!(
            pattern.score("https://example.com/cards/1"),
            Some(pattern.specificity())
        );
    }

    #[test]
    fn test_compile_error() {
        let err = UrlPattern::compile("broken", r"/cards/(\w+").unwrap_err();
        assert!(matches!(err, FeatureError::InvalidPattern { ref feature, .. } if feature == "broken"));
    }
}
