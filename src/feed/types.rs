//! Raw feed record types.
//!
//! Feeds disagree about almost every field shape: authors arrive as strings
//! or objects, dependencies as mappings, `name@version` strings or objects,
//! version fields as scalars or lists. Each of those shapes gets a small
//! untagged enum with an explicit fallback order instead of ad-hoc
//! `Value` poking.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

/// One remote feed source. Routing input only, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Feed {
    pub name: String,
    pub url: String,
}

/// A value that should be a string but might be anything.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Other(Value),
}

impl Scalar {
    /// Display form: strings pass through, anything else renders as JSON.
    pub fn display(&self) -> String {
        match self {
            Scalar::Text(s) => s.clone(),
            Scalar::Other(v) => v.to_string(),
        }
    }

    /// Display form of a non-empty value; `null` and `""` count as absent.
    pub fn non_empty(&self) -> Option<String> {
        match self {
            Scalar::Text(s) if s.is_empty() => None,
            Scalar::Text(s) => Some(s.clone()),
            Scalar::Other(Value::Null) => None,
            Scalar::Other(v) => Some(v.to_string()),
        }
    }
}

/// An author/publisher field: a plain string, an object with a `name`, or
/// some other value rendered as-is.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NameField {
    Text(String),
    Object(serde_json::Map<String, Value>),
    Other(Value),
}

impl NameField {
    /// Resolves to a display string, or `None` when effectively empty.
    pub fn non_empty(&self) -> Option<String> {
        match self {
            NameField::Text(s) if s.is_empty() => None,
            NameField::Text(s) => Some(s.clone()),
            NameField::Object(map) if map.is_empty() => None,
            NameField::Object(map) => match map.get("name").and_then(Value::as_str) {
                Some(name) => Some(name.to_string()),
                None => Some(Value::Object(map.clone()).to_string()),
            },
            NameField::Other(Value::Null) => None,
            NameField::Other(v) => Some(v.to_string()),
        }
    }
}

/// A field that may be a single string or a list of values.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<Value>),
    Other(Value),
}

impl StringOrList {
    /// First usable string: the scalar itself, or the list's first element
    /// when that element is a non-empty string. Trimmed.
    pub fn first_string(&self) -> Option<String> {
        let raw = match self {
            StringOrList::One(s) => Some(s.as_str()),
            StringOrList::Many(items) => items.first().and_then(Value::as_str),
            StringOrList::Other(_) => None,
        }?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// A normalized package dependency.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

/// The dependency list in any of its observed wire forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependencyField {
    Map(IndexMap<String, Value>),
    List(Vec<Value>),
    Other(Value),
}

impl DependencyField {
    /// Normalizes to `{name, version}` pairs.
    ///
    /// Mappings become one pair per key; list items may be `name@version`
    /// strings, bare-name strings (version `"N/A"`), or objects carrying
    /// both `name` and `version`. Any other item shape is dropped.
    pub fn normalize(&self) -> Vec<Dependency> {
        match self {
            DependencyField::Map(map) => map
                .iter()
                .map(|(name, version)| Dependency {
                    name: name.clone(),
                    version: value_display(version),
                })
                .collect(),
            DependencyField::List(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(match s.split_once('@') {
                        Some((name, version)) => Dependency {
                            name: name.to_string(),
                            version: version.to_string(),
                        },
                        None => Dependency {
                            name: s.clone(),
                            version: "N/A".to_string(),
                        },
                    }),
                    Value::Object(obj) => {
                        let name = obj.get("name")?;
                        let version = obj.get("version")?;
                        Some(Dependency {
                            name: value_display(name),
                            version: value_display(version),
                        })
                    }
                    _ => None,
                })
                .collect(),
            DependencyField::Other(_) => Vec::new(),
        }
    }
}

fn value_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One entry of a raw record's `versions` sub-list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawVersion {
    pub version: Option<String>,
    #[serde(rename = "pubDate")]
    pub pub_date: Option<String>,
}

/// A `versions` element that may not be an object at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MaybeVersion {
    Entry(RawVersion),
    Other(Value),
}

impl MaybeVersion {
    pub fn as_entry(&self) -> Option<&RawVersion> {
        match self {
            MaybeVersion::Entry(v) => Some(v),
            MaybeVersion::Other(_) => None,
        }
    }
}

/// The `versions` field, which some feeds emit as something other than a
/// list. A non-list value is preserved and simply yields no entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VersionsField {
    List(Vec<MaybeVersion>),
    Other(Value),
}

impl Default for VersionsField {
    fn default() -> Self {
        VersionsField::List(Vec::new())
    }
}

impl VersionsField {
    pub fn entries(&self) -> impl Iterator<Item = &RawVersion> {
        let items = match self {
            VersionsField::List(items) => items.as_slice(),
            VersionsField::Other(_) => &[],
        };
        items.iter().filter_map(MaybeVersion::as_entry)
    }

    /// Whether the fetcher should synthesize a version history from the
    /// entry's own scalar fields.
    pub fn needs_synthesis(&self) -> bool {
        match self {
            VersionsField::List(items) => items.is_empty(),
            VersionsField::Other(Value::Null) => true,
            VersionsField::Other(Value::String(s)) => s.is_empty(),
            VersionsField::Other(_) => false,
        }
    }
}

/// One unnormalized record from a feed. Ephemeral: raw entries exist only
/// between fetch and normalization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawEntry {
    pub name: Option<Scalar>,
    pub title: Option<Scalar>,
    pub id: Option<Scalar>,
    pub version: Option<StringOrList>,
    #[serde(rename = "latestVersion")]
    pub latest_version: Option<StringOrList>,
    pub author: Option<NameField>,
    pub publisher: Option<NameField>,
    #[serde(rename = "fhirVersion")]
    pub fhir_version: Option<StringOrList>,
    #[serde(rename = "fhirVersions")]
    pub fhir_versions: Option<StringOrList>,
    #[serde(rename = "fhir_version")]
    pub fhir_version_alt: Option<StringOrList>,
    pub url: Option<Scalar>,
    pub link: Option<Scalar>,
    pub canonical: Option<Scalar>,
    pub description: Option<Scalar>,
    pub dependencies: Option<DependencyField>,
    #[serde(rename = "pubDate")]
    pub pub_date: Option<Scalar>,
    pub published: Option<Scalar>,
    /// The feed URL this entry came from; filled in by the fetcher.
    pub registry: Option<Scalar>,
    pub versions: VersionsField,
}

impl RawEntry {
    /// The raw name: `name` preferred, `title` as fallback, `""` otherwise.
    /// May still embed a `#version` suffix.
    pub fn raw_name(&self) -> String {
        self.name
            .as_ref()
            .and_then(Scalar::non_empty)
            .or_else(|| self.title.as_ref().and_then(Scalar::non_empty))
            .unwrap_or_default()
    }

    /// Resolves this entry's own version string: the `version` field, then
    /// `latestVersion`, then the `#`-suffix of the raw name.
    pub fn resolve_version(&self) -> Option<String> {
        if let Some(v) = self.version.as_ref().and_then(StringOrList::first_string) {
            return Some(v);
        }
        if let Some(v) = self
            .latest_version
            .as_ref()
            .and_then(StringOrList::first_string)
        {
            return Some(v);
        }
        let raw_name = self.raw_name();
        match raw_name.split_once('#') {
            Some((_, suffix)) if !suffix.trim().is_empty() => Some(suffix.trim().to_string()),
            _ => None,
        }
    }

    /// FHIR version tag, checked across the three key spellings feeds use.
    pub fn resolve_fhir_version(&self) -> Option<String> {
        [
            self.fhir_version.as_ref(),
            self.fhir_versions.as_ref(),
            self.fhir_version_alt.as_ref(),
        ]
        .into_iter()
        .flatten()
        .find_map(StringOrList::first_string)
    }
}
