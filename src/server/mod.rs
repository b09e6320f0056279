//! HTTP API: package search, profile listing and retrieval, refresh status
//! and forced refresh.

pub mod error;
pub mod routes;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::routing::{get, post};

use crate::artifact::ArtifactFetcher;
use crate::profile::ProfileMetadata;
use crate::sync::SyncService;

/// Shared handler state. Clones are cheap; everything inside is shared.
#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
    pub artifacts: Arc<ArtifactFetcher>,
    /// Extracted profile lists keyed by `name#version` (literal `latest`
    /// when no version was requested).
    pub profile_cache: Arc<Mutex<HashMap<String, Arc<Vec<ProfileMetadata>>>>>,
    pub search_cutoff: f64,
}

impl AppState {
    pub fn new(sync: Arc<SyncService>, artifacts: Arc<ArtifactFetcher>, search_cutoff: f64) -> Self {
        Self {
            sync,
            artifacts,
            profile_cache: Arc::new(Mutex::new(HashMap::new())),
            search_cutoff,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/igs/search", get(routes::search_igs))
        .route("/igs/{ig_id}/profiles", get(routes::list_ig_profiles))
        .route("/igs/{ig_id}/profiles/{profile_id}", get(routes::get_ig_profile))
        .route("/status", get(routes::refresh_status))
        .route("/refresh-cache", post(routes::refresh_cache))
        .with_state(state)
}
