//! Package aggregation: collapses raw feed entries into canonical package
//! records.
//!
//! Multiple feeds publish overlapping records for the same logical package,
//! one per release or one per package depending on the source. Grouping is
//! case-insensitive on the name portion before `#`; each group merges its
//! version histories and elects the entry carrying the highest version to
//! donate the scalar metadata.

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::feed::types::{Dependency, NameField, RawEntry, Scalar};
use crate::version::{ComparableVersion, is_official, parse_version};

/// One known version of a package. Immutable once produced; duplicates by
/// version string are suppressed with the first-seen `pubDate` kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    #[serde(rename = "pubDate")]
    pub pub_date: String,
}

/// The canonical record for one logical package, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPackage {
    /// Display name; last non-empty raw name in the group wins.
    pub name: String,
    /// Latest absolute version, pre-release and CI suffixes included.
    pub version: String,
    /// Latest version in strict `MAJOR.MINOR.PATCH[-prerelease]` form.
    pub latest_official_version: Option<String>,
    /// `latest_official_version` when present, `version` otherwise.
    pub latest_version: String,
    pub author: String,
    pub description: String,
    pub fhir_version: String,
    pub url: String,
    pub canonical: String,
    /// URL of the feed that produced the winning entry, when known.
    pub registry: Option<String>,
    pub dependencies: Vec<Dependency>,
    /// Deduplicated version history, sorted by raw `pubDate` string
    /// descending. String order, not date order, is the contract.
    pub all_versions: Vec<VersionEntry>,
    pub version_count: i64,
    /// Normalization timestamp, UTC ISO-8601.
    pub last_updated: String,
}

/// Counters for entries the aggregator had to drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    /// Raw entries with neither a name nor an id.
    pub skipped_raw: usize,
    /// Grouped entries with no resolvable version string.
    pub skipped_entries: usize,
    /// Distinct package names seen during grouping.
    pub groups: usize,
}

/// Normalizes one batch of raw entries into canonical packages, sorted by
/// name case-insensitively. `now` stamps `last_updated`; callers pass a
/// single instant per sync cycle.
pub fn normalize_entries(
    entries: Vec<RawEntry>,
    now: DateTime<Utc>,
) -> (Vec<CanonicalPackage>, NormalizeStats) {
    let mut stats = NormalizeStats::default();

    let mut grouped: IndexMap<String, Vec<RawEntry>> = IndexMap::new();
    for entry in entries {
        let raw_name = entry.raw_name();
        let name_part = raw_name
            .split('#')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if !name_part.is_empty() {
            grouped.entry(name_part).or_default().push(entry);
        } else if entry.id.as_ref().and_then(Scalar::non_empty).is_none() {
            stats.skipped_raw += 1;
            warn!("skipping raw package entry with no name or id");
        }
    }
    stats.groups = grouped.len();
    info!(
        "grouped {} unique package names, skipped {} raw entries",
        stats.groups, stats.skipped_raw
    );

    let now_iso = now.to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut packages = Vec::with_capacity(grouped.len());

    for (name_key, group) in grouped {
        let mut all_versions: Vec<VersionEntry> = Vec::new();
        let mut seen_versions: Vec<String> = Vec::new();
        for entry in &group {
            for raw_version in entry.versions.entries() {
                let Some(version) = raw_version.version.as_deref().filter(|v| !v.is_empty())
                else {
                    continue;
                };
                if seen_versions.iter().any(|v| v == version) {
                    continue;
                }
                seen_versions.push(version.to_string());
                all_versions.push(VersionEntry {
                    version: version.to_string(),
                    pub_date: raw_version
                        .pub_date
                        .clone()
                        .unwrap_or_else(|| "NA".to_string()),
                });
            }
        }

        let mut display_name = name_key.clone();
        let mut latest_absolute: Option<(ComparableVersion, usize, String)> = None;
        let mut latest_official: Option<(ComparableVersion, String)> = None;

        for (idx, entry) in group.iter().enumerate() {
            let Some(version_str) = entry.resolve_version() else {
                warn!(
                    "skipping entry for {}: no resolvable version",
                    entry.raw_name()
                );
                stats.skipped_entries += 1;
                continue;
            };

            let current_name = entry
                .raw_name()
                .split('#')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            if !current_name.is_empty() && current_name != name_key {
                display_name = current_name;
            }

            let parsed = parse_version(&version_str);
            // Strict greater-than: an exact tie keeps the first-seen winner.
            let absolute_wins = match &latest_absolute {
                None => true,
                Some((best, _, _)) => parsed.is_greater_than(best),
            };
            if absolute_wins {
                latest_absolute = Some((parsed.clone(), idx, version_str.clone()));
            }

            if is_official(&version_str) {
                let official_wins = match &latest_official {
                    None => true,
                    Some((best, _)) => parsed.is_greater_than(best),
                };
                if official_wins {
                    latest_official = Some((parsed, version_str));
                }
            }
        }

        let Some((_, winner_idx, absolute_version)) = latest_absolute else {
            warn!("no entry with a resolvable version for package '{name_key}'");
            stats.skipped_entries += group.len();
            continue;
        };
        let winner = &group[winner_idx];
        let official_version = latest_official.map(|(_, v)| v);

        let author = winner
            .author
            .as_ref()
            .and_then(NameField::non_empty)
            .or_else(|| winner.publisher.as_ref().and_then(NameField::non_empty))
            .unwrap_or_else(|| "NA".to_string());
        let fhir_version = winner
            .resolve_fhir_version()
            .unwrap_or_else(|| "NA".to_string());
        let url = winner
            .url
            .as_ref()
            .and_then(Scalar::non_empty)
            .or_else(|| winner.link.as_ref().and_then(Scalar::non_empty))
            .unwrap_or_else(|| "unknown".to_string());
        let canonical = winner
            .canonical
            .as_ref()
            .and_then(Scalar::non_empty)
            .unwrap_or_else(|| url.clone());
        let dependencies = winner
            .dependencies
            .as_ref()
            .map(|d| d.normalize())
            .unwrap_or_default();

        all_versions.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));
        let latest_version = official_version
            .clone()
            .unwrap_or_else(|| absolute_version.clone());
        if official_version.is_none() {
            debug!("no official version found for package '{display_name}'");
        }

        packages.push(CanonicalPackage {
            name: display_name,
            version: absolute_version,
            latest_official_version: official_version,
            latest_version,
            author: author.trim().to_string(),
            description: winner
                .description
                .as_ref()
                .and_then(Scalar::non_empty)
                .unwrap_or_default(),
            fhir_version: fhir_version.trim().to_string(),
            url: url.trim().to_string(),
            canonical: canonical.trim().to_string(),
            registry: winner.registry.as_ref().and_then(Scalar::non_empty),
            dependencies,
            version_count: all_versions.len() as i64,
            all_versions,
            last_updated: now_iso.clone(),
        });
    }

    info!(
        "normalization complete: {} packages, {} entries skipped",
        packages.len(),
        stats.skipped_entries
    );
    packages.sort_by_key(|p| p.name.to_lowercase());
    (packages, stats)
}
