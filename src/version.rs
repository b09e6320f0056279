//! Version normalization and ordering for FHIR IG package versions.
//!
//! FHIR IG feeds publish versions that are mostly-but-not-quite semver:
//! `1.1.0-preview`, `0.1.0-ballot2`, `2.0.0-rc3`, bare `1.0` and so on.
//! `parse_version` maps these onto a normalized comparable form and
//! `compare_versions` defines the ordering used to pick a package's latest
//! version. The ordering is load-bearing: cached data depends on it, so the
//! rules here must not drift.

use std::sync::LazyLock;

use regex::Regex;

/// Sentinel that sorts below every real version.
const LOWEST: &str = "0.0.0a0";

static DOTTED_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*$").expect("valid regex"));

/// Strict `MAJOR.MINOR.PATCH` with an optional `-prerelease` suffix. Versions
/// matching this are eligible to be a package's "latest official" version.
static OFFICIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+(?:-[a-zA-Z0-9.]+)?$").expect("valid regex"));

/// A version string in normalized comparable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparableVersion(String);

impl ComparableVersion {
    /// The lowest possible version; everything real sorts above it.
    pub fn lowest() -> Self {
        Self(LOWEST.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `self` is strictly greater than `other`.
    pub fn is_greater_than(&self, other: &Self) -> bool {
        compare_versions(&self.0, &other.0)
    }
}

/// Parses a raw version string into comparable form.
///
/// `MAJOR.MINOR.PATCH` strings pass through unchanged. A closed set of
/// pre-release suffixes maps onto ordering tiers below the bare base version:
/// alpha (`dev`, `snapshot`, `ci-build`, `snapshot1`, `snapshot3`,
/// `draft-final`), beta (`draft`, `ballot`, `preview`, `ballot2`) and release
/// candidates (`rc*`, keeping the numeric part). An unrecognized suffix is
/// dropped, and anything without a dotted-numeric prefix resolves to the
/// `0.0.0a0` sentinel.
pub fn parse_version(raw: &str) -> ComparableVersion {
    if raw.is_empty() {
        return ComparableVersion::lowest();
    }
    let lowered = raw.to_lowercase();
    let (base, suffix) = match lowered.split_once('-') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (lowered.as_str(), None),
    };

    if !DOTTED_NUMERIC.is_match(base) {
        return ComparableVersion::lowest();
    }

    let normalized = match suffix {
        Some("dev" | "snapshot" | "ci-build" | "snapshot1" | "snapshot3" | "draft-final") => {
            format!("{base}a0")
        }
        Some("draft" | "ballot" | "preview" | "ballot2") => format!("{base}b0"),
        Some(s) if s.starts_with("rc") => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                format!("{base}rc0")
            } else {
                format!("{base}rc{digits}")
            }
        }
        _ => base.to_string(),
    };
    ComparableVersion(normalized)
}

/// Returns true if `a` is strictly greater than `b`.
///
/// Both are split on dots, the shorter side padded with `"0"`. Components
/// compare numerically on their leading digit run; a numeric tie is broken by
/// the trailing alphabetic suffix compared lexically, where having *no*
/// suffix outranks having any suffix (`"1.0" > "1.0rc1"`). Equal vectors are
/// not greater.
pub fn compare_versions(a: &str, b: &str) -> bool {
    let a_parts: Vec<&str> = a.split('.').collect();
    let b_parts: Vec<&str> = b.split('.').collect();
    let len = a_parts.len().max(b_parts.len());

    for i in 0..len {
        let pa = a_parts.get(i).copied().unwrap_or("0");
        let pb = b_parts.get(i).copied().unwrap_or("0");

        let (na, sa) = split_component(pa);
        let (nb, sb) = split_component(pb);

        match (na, nb) {
            (Some(na), Some(nb)) => {
                if na != nb {
                    return na > nb;
                }
            }
            // Not representable as numbers; decide lexically on the whole
            // component. parse_version never emits these, so this only
            // guards hand-fed input.
            _ => {
                if pa != pb {
                    return pa > pb;
                }
                continue;
            }
        }

        if sa != sb {
            if sa.is_empty() {
                return true;
            }
            if sb.is_empty() {
                return false;
            }
            return sa > sb;
        }
    }
    false
}

/// Whether a raw version string counts as an "official" release.
pub fn is_official(raw: &str) -> bool {
    OFFICIAL.is_match(raw)
}

/// Splits a component into its leading digit run and trailing suffix.
fn split_component(component: &str) -> (Option<u64>, &str) {
    let digits_end = component
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(component.len());
    let (digits, suffix) = component.split_at(digits_end);
    (digits.parse().ok(), suffix)
}
