//! Sync orchestration: index load, bounded-concurrency feed fan-out,
//! normalization and the atomic store swap.
//!
//! A sync cycle is all-or-nothing with respect to the cache: the in-memory
//! snapshot and the database only change after a cycle has committed.
//! Individual feed failures degrade the cycle (recorded per feed, the rest
//! proceeds); an empty feed index or a total fan-out failure aborts it.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::feed::index::FeedIndexError;
use crate::feed::{Feed, FeedFetcher, FeedIndex};
use crate::normalize::{CanonicalPackage, normalize_entries};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no package feeds available from the registry index")]
    NoFeeds,

    #[error("every feed failed; keeping the previous cache generation")]
    AllFeedsFailed,

    #[error(transparent)]
    Index(#[from] FeedIndexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mutable sync state reported by the status endpoint.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub last_refresh: Option<String>,
    pub errors: Vec<String>,
    pub fetch_in_progress: bool,
}

/// One committed generation of packages, shared without copying.
#[derive(Clone)]
pub struct Snapshot {
    pub packages: Arc<Vec<CanonicalPackage>>,
    pub timestamp: Option<String>,
}

/// How a committed cycle went.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Succeeded { packages: usize },
    PartiallyFailed { packages: usize, failed_feeds: usize },
}

pub struct SyncService {
    store: Store,
    index: FeedIndex,
    fetcher: FeedFetcher,
    batch_size: usize,
    max_concurrent_feeds: usize,
    status: RwLock<SyncStatus>,
    snapshot: RwLock<Option<Snapshot>>,
    // Serializes whole cycles; concurrent refresh requests queue up.
    sync_lock: Mutex<()>,
}

impl SyncService {
    pub fn new(
        store: Store,
        index: FeedIndex,
        fetcher: FeedFetcher,
        batch_size: usize,
        max_concurrent_feeds: usize,
    ) -> Self {
        Self {
            store,
            index,
            fetcher,
            batch_size,
            max_concurrent_feeds: max_concurrent_feeds.max(1),
            status: RwLock::new(SyncStatus::default()),
            snapshot: RwLock::new(None),
            sync_lock: Mutex::new(()),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().expect("status lock").clone()
    }

    /// The current committed snapshot, if one has been loaded.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.read().expect("snapshot lock").clone()
    }

    /// Runs one full sync cycle.
    ///
    /// On an aborted cycle (no feeds, all feeds failed, store failure) the
    /// previous snapshot and database generation stay in place.
    pub async fn refresh(&self) -> Result<SyncOutcome, SyncError> {
        let _guard = self.sync_lock.lock().await;
        {
            let mut status = self.status.write().expect("status lock");
            status.fetch_in_progress = true;
            status.errors.clear();
        }
        let result = self.run_cycle().await;
        self.status.write().expect("status lock").fetch_in_progress = false;
        if let Err(e) = &result {
            error!("sync cycle aborted: {e}");
        }
        result
    }

    async fn run_cycle(&self) -> Result<SyncOutcome, SyncError> {
        let feeds = match self.index.load().await {
            Ok(feeds) => feeds,
            Err(e) => {
                self.record_error(format!("failed to load feed index: {e}"));
                return Err(e.into());
            }
        };
        if feeds.is_empty() {
            self.record_error("no package feeds found in the registry index".to_string());
            return Err(SyncError::NoFeeds);
        }
        info!("starting sync cycle over {} feeds", feeds.len());

        let now = Utc::now();
        let results: Vec<(Feed, Result<_, _>)> = futures::stream::iter(feeds)
            .map(|feed| async move {
                let result = self.fetcher.fetch(&feed).await;
                (feed, result)
            })
            .buffered(self.max_concurrent_feeds)
            .collect()
            .await;

        let mut packages: Vec<CanonicalPackage> = Vec::new();
        let mut failed_feeds = 0usize;
        for (feed, result) in results {
            match result {
                Ok(entries) => {
                    let (normalized, stats) = normalize_entries(entries, now);
                    info!(
                        "feed {}: {} packages ({} entries skipped)",
                        feed.name,
                        normalized.len(),
                        stats.skipped_entries
                    );
                    packages.extend(normalized);
                }
                Err(e) => {
                    failed_feeds += 1;
                    self.record_error(format!("failed to process feed {}: {e}", feed.name));
                }
            }
        }
        if packages.is_empty() && failed_feeds > 0 {
            return Err(SyncError::AllFeedsFailed);
        }

        self.store
            .replace_all(&packages, now, self.batch_size)
            .await?;

        // Duplicate names across feeds collapse in the store; reload so the
        // snapshot matches what was committed.
        let committed = self.store.load_all().await?;
        let count = committed.len();
        let timestamp = now.to_rfc3339();
        *self.snapshot.write().expect("snapshot lock") = Some(Snapshot {
            packages: Arc::new(committed),
            timestamp: Some(timestamp.clone()),
        });
        self.status.write().expect("status lock").last_refresh = Some(timestamp);

        if failed_feeds > 0 {
            warn!("sync cycle committed with {failed_feeds} failed feeds");
            Ok(SyncOutcome::PartiallyFailed { packages: count, failed_feeds })
        } else {
            info!("sync cycle committed: {count} packages");
            Ok(SyncOutcome::Succeeded { packages: count })
        }
    }

    /// Populates the snapshot from the database without fetching anything.
    pub async fn ensure_loaded(&self) -> Result<(), SyncError> {
        if self.snapshot().is_some() {
            return Ok(());
        }
        let packages = self.store.load_all().await?;
        if packages.is_empty() {
            return Ok(());
        }
        let timestamp = self.store.last_fetch_timestamp().await?;
        info!("loaded {} packages from the local cache", packages.len());
        {
            let mut guard = self.snapshot.write().expect("snapshot lock");
            if guard.is_none() {
                *guard = Some(Snapshot {
                    packages: Arc::new(packages),
                    timestamp: timestamp.clone(),
                });
            }
        }
        // Seed the scheduler clock so a fresh on-disk cache does not trigger
        // an immediate refresh.
        let mut status = self.status.write().expect("status lock");
        if status.last_refresh.is_none() {
            status.last_refresh = timestamp;
        }
        Ok(())
    }

    /// Refreshes when the cached data is older than `max_age`; otherwise
    /// serves what is already on disk.
    pub async fn refresh_if_stale(&self, max_age: Duration) -> Result<(), SyncError> {
        if self.store.is_stale(max_age).await? {
            info!("cache is stale, refreshing");
            self.refresh().await?;
        } else {
            info!("cache is fresh, loading from disk");
            self.ensure_loaded().await?;
        }
        Ok(())
    }

    fn record_error(&self, message: String) {
        warn!("{message}");
        self.status.write().expect("status lock").errors.push(message);
    }
}

/// Periodic background refresh.
///
/// The wake time is recomputed from the last successful refresh on every
/// iteration, so a forced refresh through the API pushes the next scheduled
/// one out by a full interval. A failed cycle waits a full interval before
/// the next attempt rather than retrying immediately.
pub async fn run_scheduler(service: Arc<SyncService>, interval: Duration) {
    loop {
        let remaining = time_until_due(service.status().last_refresh.as_deref(), interval);
        if let Some(remaining) = remaining {
            tokio::time::sleep(remaining).await;
            // A forced refresh may have landed while we slept.
            if time_until_due(service.status().last_refresh.as_deref(), interval).is_some() {
                continue;
            }
        }
        match service.refresh().await {
            Ok(outcome) => info!("scheduled sync finished: {outcome:?}"),
            Err(e) => {
                error!("scheduled sync failed: {e}");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Time left before the next refresh is due, `None` when due now.
fn time_until_due(last_refresh: Option<&str>, interval: Duration) -> Option<Duration> {
    let last = DateTime::parse_from_rfc3339(last_refresh?).ok()?;
    let age = Utc::now().signed_duration_since(last.with_timezone(&Utc));
    let age = age.to_std().ok()?;
    let remaining = interval.checked_sub(age)?;
    (!remaining.is_zero()).then_some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(3600);

    fn rfc3339_ago(minutes: i64) -> String {
        (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339()
    }

    #[test]
    fn refresh_is_due_immediately_without_a_prior_run() {
        assert_eq!(time_until_due(None, INTERVAL), None);
    }

    #[test]
    fn unparsable_last_refresh_makes_refresh_due() {
        assert_eq!(time_until_due(Some("not-a-timestamp"), INTERVAL), None);
    }

    #[test]
    fn stale_last_refresh_is_due_now() {
        let old = rfc3339_ago(120);
        assert_eq!(time_until_due(Some(&old), INTERVAL), None);
    }

    #[test]
    fn forced_refresh_pushes_the_next_scheduled_run_out() {
        // One minute before the scheduled run was due.
        let almost_due = rfc3339_ago(59);
        let remaining =
            time_until_due(Some(&almost_due), INTERVAL).expect("not due yet");
        assert!(remaining <= Duration::from_secs(60));

        // A forced refresh updates the last-refresh timestamp; the scheduler
        // recomputes and waits out a fresh interval instead of firing.
        let just_forced = rfc3339_ago(0);
        let remaining =
            time_until_due(Some(&just_forced), INTERVAL).expect("rescheduled");
        assert!(remaining > Duration::from_secs(3500));
    }
}
