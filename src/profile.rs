//! Profile (StructureDefinition) extraction from package archives.
//!
//! A package archive is a gzipped tar whose `package/` directory holds one
//! JSON file per conformance resource. Listing scans only files named after
//! StructureDefinitions; lookup scans every JSON member so profiles with
//! unconventional file names still resolve. Malformed members are skipped,
//! not fatal.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read package archive: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary of one profile, as returned by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub url: String,
}

/// Lists the profiles defined in the archive at `path`.
pub fn list_profiles(path: &Path) -> Result<Vec<ProfileMetadata>, ProfileError> {
    let mut profiles = Vec::new();
    for_each_json_member(path, |member, resource| {
        if !member.contains("StructureDefinition") {
            return true;
        }
        if resource.get("resourceType").and_then(Value::as_str) != Some("StructureDefinition") {
            return true;
        }
        profiles.push(ProfileMetadata {
            name: string_field(&resource, "name"),
            description: string_field(&resource, "description"),
            version: string_field(&resource, "version"),
            url: string_field(&resource, "url"),
        });
        true
    })?;
    debug!("found {} profiles in {}", profiles.len(), path.display());
    Ok(profiles)
}

/// Finds one profile by name, id, or trailing URL segment. The `text`
/// narrative is nulled out when `include_narrative` is false.
pub fn find_profile(
    path: &Path,
    profile_id: &str,
    include_narrative: bool,
) -> Result<Option<Value>, ProfileError> {
    let mut found = None;
    for_each_json_member(path, |_, mut resource| {
        if resource.get("resourceType").and_then(Value::as_str) != Some("StructureDefinition") {
            return true;
        }
        if !profile_matches(&resource, profile_id) {
            return true;
        }
        if !include_narrative
            && let Some(obj) = resource.as_object_mut()
            && obj.contains_key("text")
        {
            obj.insert("text".to_string(), Value::Null);
        }
        found = Some(resource);
        false
    })?;
    Ok(found)
}

fn profile_matches(resource: &Value, profile_id: &str) -> bool {
    let matches_field = |key: &str| resource.get(key).and_then(Value::as_str) == Some(profile_id);
    matches_field("name")
        || matches_field("id")
        || resource
            .get("url")
            .and_then(Value::as_str)
            .is_some_and(|url| url.ends_with(&format!("/{profile_id}")))
}

/// Walks every `.json` member of the archive, handing its path and parsed
/// body to `visit`. A `false` return stops the walk early.
fn for_each_json_member(
    path: &Path,
    mut visit: impl FnMut(&str, Value) -> bool,
) -> Result<(), ProfileError> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let member = entry.path()?.to_string_lossy().into_owned();
        if !member.ends_with(".json") {
            continue;
        }
        let mut body = String::new();
        if entry.read_to_string(&mut body).is_err() {
            warn!("skipping non-UTF-8 archive member {member}");
            continue;
        }
        let resource: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping malformed JSON member {member}: {e}");
                continue;
            }
        };
        if !visit(&member, resource) {
            break;
        }
    }
    Ok(())
}

fn string_field(resource: &Value, key: &str) -> String {
    resource
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
