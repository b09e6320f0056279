//! Request handlers.
//!
//! Client-supplied identifiers are validated before any I/O happens.
//! Search and status degrade gracefully to the last committed snapshot;
//! only the profile endpoints hard-fail when an archive cannot be
//! retrieved or read.

use std::sync::{Arc, LazyLock};

use axum::Json;
use axum::extract::{Path, Query, State};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::artifact::ArtifactError;
use crate::normalize::{CanonicalPackage, VersionEntry};
use crate::profile::{self, ProfileMetadata};
use crate::search::{FuzzyScorer, MAX_RESULTS, RelevanceScorer, SubstringScorer, search_packages};
use crate::server::error::ApiError;
use crate::server::AppState;

static IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.\-_]+$").expect("valid regex"));

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
    pub scorer: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IgSearchResult {
    pub id: String,
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(rename = "Author")]
    pub author: String,
    pub fhir_version: String,
    #[serde(rename = "Latest_Version")]
    pub latest_version: String,
    pub version_count: i64,
    pub all_versions: Vec<VersionEntry>,
    pub relevance: f64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub packages: Vec<IgSearchResult>,
    pub total: usize,
    pub last_cached_timestamp: Option<String>,
    pub fetch_failed: bool,
    pub is_fetching: bool,
}

#[derive(Debug, Serialize)]
pub struct RefreshStatus {
    pub last_refresh: Option<String>,
    pub package_count: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct VersionParam {
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileParams {
    pub version: Option<String>,
    /// Profiles ship with their narrative; clients opt out explicitly.
    #[serde(default = "default_include_narrative")]
    pub include_narrative: bool,
}

fn default_include_narrative() -> bool {
    true
}

pub async fn search_igs(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let scorer: Box<dyn RelevanceScorer> = match params.scorer.as_deref() {
        None | Some("fuzzy") => Box::new(FuzzyScorer::new(state.search_cutoff)),
        Some("substring") => Box::new(SubstringScorer),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "Unknown scorer '{other}'. Use 'fuzzy' or 'substring'."
            )));
        }
    };
    info!("searching IGs with query: {}", params.query);

    let mut is_fetching = false;
    if state.sync.snapshot().is_none() {
        if state.sync.ensure_loaded().await.is_err() {
            return Err(ApiError::internal("Failed to load the package cache."));
        }
        if state.sync.snapshot().is_none() {
            // Nothing cached at all yet; fetch synchronously once.
            is_fetching = true;
            if let Err(e) = state.sync.refresh().await {
                warn!("on-demand refresh during search failed: {e}");
            }
        }
    }

    let status = state.sync.status();
    let snapshot = state.sync.snapshot();
    let (packages, timestamp): (&[CanonicalPackage], Option<String>) = match &snapshot {
        Some(snap) => (snap.packages.as_slice(), snap.timestamp.clone()),
        None => (&[], None),
    };

    let results: Vec<IgSearchResult> =
        search_packages(packages, &params.query, scorer.as_ref(), MAX_RESULTS)
            .into_iter()
            .map(|hit| IgSearchResult {
                id: hit.package.name.clone(),
                name: hit.package.name.clone(),
                description: hit.package.description.clone(),
                url: hit.package.url.clone(),
                author: hit.package.author.clone(),
                fhir_version: hit.package.fhir_version.clone(),
                latest_version: hit.package.latest_version.clone(),
                version_count: hit.package.version_count,
                all_versions: hit.package.all_versions.clone(),
                relevance: hit.relevance,
            })
            .collect();

    Ok(Json(SearchResponse {
        total: results.len(),
        packages: results,
        last_cached_timestamp: timestamp,
        fetch_failed: snapshot.is_none() || !status.errors.is_empty(),
        is_fetching: is_fetching || status.fetch_in_progress,
    }))
}

pub async fn refresh_status(State(state): State<AppState>) -> Json<RefreshStatus> {
    let status = state.sync.status();
    let package_count = state
        .sync
        .snapshot()
        .map(|s| s.packages.len())
        .unwrap_or_default();
    Json(RefreshStatus {
        last_refresh: status.last_refresh,
        package_count,
        errors: status.errors,
    })
}

pub async fn refresh_cache(State(state): State<AppState>) -> Json<RefreshStatus> {
    info!("forcing cache refresh via API");
    if let Err(e) = state.sync.refresh().await {
        warn!("forced refresh failed: {e}");
    }
    refresh_status(State(state)).await
}

pub async fn list_ig_profiles(
    State(state): State<AppState>,
    Path(ig_id): Path<String>,
    Query(params): Query<VersionParam>,
) -> Result<Json<Vec<ProfileMetadata>>, ApiError> {
    let target = resolve_target(&state, &ig_id, params.version).await?;

    let cache_key = target.cache_key();
    if let Some(profiles) = state.profile_cache.lock().expect("cache lock").get(&cache_key) {
        info!("returning cached profiles for {cache_key}");
        return Ok(Json(profiles.as_ref().clone()));
    }

    let archive = fetch_archive(&state, &target).await?;
    let profiles = tokio::task::spawn_blocking(move || profile::list_profiles(&archive))
        .await
        .map_err(|e| ApiError::internal(format!("Failed to extract profiles: {e}")))?
        .map_err(|e| ApiError::internal(format!("Failed to extract profiles: {e}")))?;

    state
        .profile_cache
        .lock()
        .expect("cache lock")
        .insert(cache_key, Arc::new(profiles.clone()));
    Ok(Json(profiles))
}

pub async fn get_ig_profile(
    State(state): State<AppState>,
    Path((ig_id, profile_id)): Path<(String, String)>,
    Query(params): Query<ProfileParams>,
) -> Result<Json<Value>, ApiError> {
    if !IDENT.is_match(&profile_id) {
        return Err(ApiError::bad_request("Invalid profile ID format."));
    }
    let target = resolve_target(&state, &ig_id, params.version).await?;

    let archive = fetch_archive(&state, &target).await?;
    let include_narrative = params.include_narrative;
    let profile_key = profile_id.clone();
    let found = tokio::task::spawn_blocking(move || {
        profile::find_profile(&archive, &profile_key, include_narrative)
    })
    .await
    .map_err(|e| ApiError::internal(format!("Failed to extract profile: {e}")))?
    .map_err(|e| ApiError::internal(format!("Failed to extract profile: {e}")))?;

    match found {
        Some(resource) => Ok(Json(json!({ "resource": resource }))),
        None => Err(ApiError::not_found(format!(
            "Profile '{profile_id}' not found in IG '{}' (version: {}).",
            target.name, target.version
        ))),
    }
}

/// A validated package + version pair ready for archive retrieval.
struct Target {
    name: String,
    version: String,
    version_was_requested: bool,
    canonical: Option<String>,
    registry: Option<String>,
}

impl Target {
    fn cache_key(&self) -> String {
        if self.version_was_requested {
            format!("{}#{}", self.name, self.version)
        } else {
            format!("{}#latest", self.name)
        }
    }
}

/// Parses and validates an `ig_id`, resolves the package from the snapshot
/// and picks the version to serve. An explicit `version` query parameter
/// wins over a `#`-suffix in the id.
async fn resolve_target(
    state: &AppState,
    ig_id: &str,
    version_param: Option<String>,
) -> Result<Target, ApiError> {
    let (name, embedded_version) = match ig_id.split_once('#') {
        Some((name, version)) => (name.to_string(), Some(version.to_string())),
        None => (ig_id.to_string(), None),
    };
    let requested_version = version_param.or(embedded_version);

    if name.is_empty() || !IDENT.is_match(&name) {
        return Err(ApiError::bad_request(
            "Invalid IG name. Use format like 'hl7.fhir.au.core'.",
        ));
    }
    if let Some(version) = &requested_version
        && !IDENT.is_match(version)
    {
        return Err(ApiError::bad_request(
            "Invalid version format. Use format like '1.1.0-preview'.",
        ));
    }

    if state.sync.snapshot().is_none() && state.sync.ensure_loaded().await.is_err() {
        return Err(ApiError::internal("Failed to load the package cache."));
    }
    let Some(snapshot) = state.sync.snapshot() else {
        return Err(ApiError::internal(
            "Package cache is empty. Please refresh the cache.",
        ));
    };

    let package = find_package(&snapshot.packages, &name)
        .ok_or_else(|| ApiError::not_found(format!("IG '{name}' not found.")))?;

    let version = match &requested_version {
        Some(version) => {
            if !package.all_versions.iter().any(|v| &v.version == version) {
                return Err(ApiError::not_found(format!(
                    "Version '{version}' not found for IG '{name}'."
                )));
            }
            version.clone()
        }
        None => package.latest_version.clone(),
    };

    Ok(Target {
        name,
        version,
        version_was_requested: requested_version.is_some(),
        canonical: Some(package.canonical.clone()),
        registry: package.registry.clone(),
    })
}

fn find_package<'a>(
    packages: &'a [CanonicalPackage],
    name: &str,
) -> Option<&'a CanonicalPackage> {
    packages.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

async fn fetch_archive(
    state: &AppState,
    target: &Target,
) -> Result<std::path::PathBuf, ApiError> {
    state
        .artifacts
        .ensure_archive(
            &target.name,
            &target.version,
            target.canonical.as_deref(),
            target.registry.as_deref(),
        )
        .await
        .map_err(|e| match e {
            ArtifactError::Exhausted { not_found: true, .. } => ApiError::not_found(format!(
                "Package for IG '{}' (version: {}) not found.",
                target.name, target.version
            )),
            other => ApiError::internal(format!("Failed to fetch package: {other}")),
        })
}
