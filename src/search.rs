//! Package search over the in-memory snapshot.
//!
//! Scoring is pluggable behind [`RelevanceScorer`]: the default fuzzy
//! scorer normalizes a matcher score against the query's self-match score so
//! relevance lands in `0.0..=1.0` regardless of query length, with a cutoff
//! below which a candidate is not a match at all. A plain substring scorer
//! is available for exact lookups.

use std::sync::Mutex;

use nucleo_matcher::pattern::{CaseMatching, Normalization, Pattern};
use nucleo_matcher::{Config, Matcher, Utf32Str};

use crate::normalize::CanonicalPackage;

/// Default minimum normalized score for a fuzzy match.
pub const DEFAULT_FUZZY_CUTOFF: f64 = 0.7;

/// Maximum number of results a search returns.
pub const MAX_RESULTS: usize = 100;

const NAME_WEIGHT: f64 = 1.5;
const DESCRIPTION_WEIGHT: f64 = 0.8;

/// Scores how well `candidate` matches `query`, in `0.0..=1.0`.
/// `None` means no match.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, query: &str, candidate: &str) -> Option<f64>;
}

/// Fuzzy scorer with a relative cutoff.
pub struct FuzzyScorer {
    matcher: Mutex<Matcher>,
    cutoff: f64,
}

impl FuzzyScorer {
    pub fn new(cutoff: f64) -> Self {
        Self {
            matcher: Mutex::new(Matcher::new(Config::DEFAULT)),
            cutoff,
        }
    }
}

impl Default for FuzzyScorer {
    fn default() -> Self {
        Self::new(DEFAULT_FUZZY_CUTOFF)
    }
}

impl RelevanceScorer for FuzzyScorer {
    fn score(&self, query: &str, candidate: &str) -> Option<f64> {
        let pattern = Pattern::parse(query, CaseMatching::Ignore, Normalization::Smart);
        let mut matcher = self.matcher.lock().expect("matcher lock");

        let mut buf = Vec::new();
        let raw = pattern.score(Utf32Str::new(candidate, &mut buf), &mut matcher)? as f64;

        let mut self_buf = Vec::new();
        let ceiling = pattern.score(Utf32Str::new(query, &mut self_buf), &mut matcher)? as f64;
        if ceiling <= 0.0 {
            return None;
        }

        let normalized = (raw / ceiling).min(1.0);
        (normalized >= self.cutoff).then_some(normalized)
    }
}

/// Tiered exact-substring scorer: exact, prefix, contains.
pub struct SubstringScorer;

impl RelevanceScorer for SubstringScorer {
    fn score(&self, query: &str, candidate: &str) -> Option<f64> {
        let query = query.to_lowercase();
        let candidate = candidate.to_lowercase();
        if candidate == query {
            Some(1.0)
        } else if candidate.starts_with(&query) {
            Some(0.9)
        } else if candidate.contains(&query) {
            Some(0.75)
        } else {
            None
        }
    }
}

/// One search hit, borrowing from the snapshot.
pub struct ScoredPackage<'a> {
    pub package: &'a CanonicalPackage,
    pub relevance: f64,
}

/// Ranks `packages` against `query`.
///
/// Name matches weigh more than description matches; the combined score is
/// capped at `1.0`. An empty query returns everything at full relevance.
/// Ties keep the input (name) order.
pub fn search_packages<'a>(
    packages: &'a [CanonicalPackage],
    query: &str,
    scorer: &dyn RelevanceScorer,
    limit: usize,
) -> Vec<ScoredPackage<'a>> {
    let query = query.trim();
    if query.is_empty() {
        return packages
            .iter()
            .take(limit)
            .map(|package| ScoredPackage { package, relevance: 1.0 })
            .collect();
    }

    let mut hits: Vec<ScoredPackage<'a>> = packages
        .iter()
        .filter_map(|package| {
            let name_score = scorer
                .score(query, &package.name)
                .map(|s| s * NAME_WEIGHT);
            let description_score = scorer
                .score(query, &package.description)
                .map(|s| s * DESCRIPTION_WEIGHT);
            let best = match (name_score, description_score) {
                (Some(n), Some(d)) => n.max(d),
                (Some(n), None) => n,
                (None, Some(d)) => d,
                (None, None) => return None,
            };
            Some(ScoredPackage { package, relevance: best.min(1.0) })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(name: &str, description: &str) -> CanonicalPackage {
        CanonicalPackage {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            latest_official_version: Some("1.0.0".to_string()),
            latest_version: "1.0.0".to_string(),
            author: "NA".to_string(),
            description: description.to_string(),
            fhir_version: "4.0.1".to_string(),
            url: "unknown".to_string(),
            canonical: "unknown".to_string(),
            registry: None,
            dependencies: Vec::new(),
            all_versions: Vec::new(),
            version_count: 0,
            last_updated: "2024-06-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn fuzzy_scorer_gives_full_score_for_exact_match() {
        let scorer = FuzzyScorer::default();
        assert_eq!(scorer.score("hl7.fhir.au.core", "hl7.fhir.au.core"), Some(1.0));
    }

    #[test]
    fn fuzzy_scorer_rejects_unrelated_candidates() {
        let scorer = FuzzyScorer::default();
        assert_eq!(scorer.score("qqqq", "hl7.fhir.au.core"), None);
    }

    #[test]
    fn fuzzy_scorer_is_case_insensitive() {
        let scorer = FuzzyScorer::default();
        assert!(scorer.score("AU.CORE", "hl7.fhir.au.core").is_some());
    }

    #[test]
    fn substring_scorer_tiers() {
        let scorer = SubstringScorer;
        assert_eq!(scorer.score("core", "core"), Some(1.0));
        assert_eq!(scorer.score("core", "core-package"), Some(0.9));
        assert_eq!(scorer.score("core", "hl7.fhir.au.core"), Some(0.75));
        assert_eq!(scorer.score("core", "terminology"), None);
    }

    #[test]
    fn empty_query_returns_everything_at_full_relevance() {
        let packages = vec![package("a", ""), package("b", ""), package("c", "")];
        let hits = search_packages(&packages, "  ", &SubstringScorer, MAX_RESULTS);
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.relevance == 1.0));
    }

    #[test]
    fn name_matches_outrank_description_matches() {
        let packages = vec![
            package("terminology.pkg", "core concepts explained"),
            package("au.core", "terminology for australia"),
        ];

        let hits = search_packages(&packages, "core", &SubstringScorer, MAX_RESULTS);

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].package.name, "au.core");
        assert!(hits[0].relevance > hits[1].relevance);
    }

    #[test]
    fn relevance_is_capped_at_one() {
        let packages = vec![package("core", "core")];
        let hits = search_packages(&packages, "core", &SubstringScorer, MAX_RESULTS);
        assert_eq!(hits[0].relevance, 1.0);
    }

    #[test]
    fn limit_truncates_after_ranking() {
        let packages: Vec<_> = (0..5).map(|i| package(&format!("core.{i}"), "")).collect();
        let hits = search_packages(&packages, "core", &SubstringScorer, 2);
        assert_eq!(hits.len(), 2);
    }
}
