//! SQLite persistence for canonical packages.
//!
//! The store holds exactly one generation of data: each successful sync
//! replaces the whole `packages` table and stamps `registry_cache_info` in
//! the same transaction, so readers never observe a half-written refresh.
//! Nested fields (`dependencies`, `all_versions`) are stored as JSON text.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::feed::types::Dependency;
use crate::normalize::{CanonicalPackage, VersionEntry};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS packages (
    package_name TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    latest_official_version TEXT,
    latest_version TEXT NOT NULL,
    author TEXT NOT NULL,
    description TEXT NOT NULL,
    fhir_version TEXT NOT NULL,
    url TEXT NOT NULL,
    canonical TEXT NOT NULL,
    registry TEXT,
    dependencies TEXT NOT NULL,
    all_versions TEXT NOT NULL,
    version_count INTEGER NOT NULL,
    last_updated TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS registry_cache_info (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_fetch TEXT NOT NULL
);
"#;

/// Handle to the package database. Cheap to clone; the pool is shared.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema exists. WAL keeps readers unblocked during the sync write.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(60));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!("opened package database at {}", path.display());
        Ok(Self { pool })
    }

    /// Replaces the entire package table with `packages` and records
    /// `fetched_at`, all in one transaction. Inserts run in chunks of
    /// `batch_size`; a duplicate name within one generation keeps the later
    /// row.
    pub async fn replace_all(
        &self,
        packages: &[CanonicalPackage],
        fetched_at: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM packages").execute(&mut *tx).await?;

        for chunk in packages.chunks(batch_size.max(1)) {
            for pkg in chunk {
                sqlx::query(
                    r#"
                    INSERT INTO packages (
                        package_name, version, latest_official_version,
                        latest_version, author, description, fhir_version,
                        url, canonical, registry, dependencies, all_versions,
                        version_count, last_updated
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(package_name) DO UPDATE SET
                        version = excluded.version,
                        latest_official_version = excluded.latest_official_version,
                        latest_version = excluded.latest_version,
                        author = excluded.author,
                        description = excluded.description,
                        fhir_version = excluded.fhir_version,
                        url = excluded.url,
                        canonical = excluded.canonical,
                        registry = excluded.registry,
                        dependencies = excluded.dependencies,
                        all_versions = excluded.all_versions,
                        version_count = excluded.version_count,
                        last_updated = excluded.last_updated
                    "#,
                )
                .bind(&pkg.name)
                .bind(&pkg.version)
                .bind(&pkg.latest_official_version)
                .bind(&pkg.latest_version)
                .bind(&pkg.author)
                .bind(&pkg.description)
                .bind(&pkg.fhir_version)
                .bind(&pkg.url)
                .bind(&pkg.canonical)
                .bind(&pkg.registry)
                .bind(serde_json::to_string(&pkg.dependencies)?)
                .bind(serde_json::to_string(&pkg.all_versions)?)
                .bind(pkg.version_count)
                .bind(&pkg.last_updated)
                .execute(&mut *tx)
                .await?;
            }
            debug!("wrote batch of {} packages", chunk.len());
        }

        sqlx::query(
            "INSERT INTO registry_cache_info (id, last_fetch) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET last_fetch = excluded.last_fetch",
        )
        .bind(fetched_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("stored {} packages", packages.len());
        Ok(())
    }

    /// Loads every package, ordered by name case-insensitively.
    pub async fn load_all(&self) -> Result<Vec<CanonicalPackage>, StoreError> {
        type Row = (
            String,         // package_name
            String,         // version
            Option<String>, // latest_official_version
            String,         // latest_version
            String,         // author
            String,         // description
            String,         // fhir_version
            String,         // url
            String,         // canonical
            Option<String>, // registry
            String,         // dependencies (JSON)
            String,         // all_versions (JSON)
            i64,            // version_count
            String,         // last_updated
        );

        let rows: Vec<Row> = sqlx::query_as(
            "SELECT package_name, version, latest_official_version, latest_version,
                    author, description, fhir_version, url, canonical, registry,
                    dependencies, all_versions, version_count, last_updated
             FROM packages ORDER BY package_name COLLATE NOCASE",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut packages = Vec::with_capacity(rows.len());
        for row in rows {
            let dependencies: Vec<Dependency> = serde_json::from_str(&row.10)?;
            let all_versions: Vec<VersionEntry> = serde_json::from_str(&row.11)?;
            packages.push(CanonicalPackage {
                name: row.0,
                version: row.1,
                latest_official_version: row.2,
                latest_version: row.3,
                author: row.4,
                description: row.5,
                fhir_version: row.6,
                url: row.7,
                canonical: row.8,
                registry: row.9,
                dependencies,
                all_versions,
                version_count: row.12,
                last_updated: row.13,
            });
        }
        Ok(packages)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM packages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// The timestamp of the last completed sync, if any.
    pub async fn last_fetch_timestamp(&self) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_fetch FROM registry_cache_info WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(ts,)| ts))
    }

    /// Whether the cached data is older than `max_age` (or absent).
    ///
    /// An empty table is always stale. A missing or unparsable fetch
    /// timestamp falls back to the newest `last_updated` value; if neither
    /// parses the data counts as stale.
    pub async fn is_stale(&self, max_age: Duration) -> Result<bool, StoreError> {
        if self.count().await? == 0 {
            return Ok(true);
        }

        let mut timestamp = self.last_fetch_timestamp().await?;
        if timestamp.is_none() {
            let row: Option<(Option<String>,)> =
                sqlx::query_as("SELECT MAX(last_updated) FROM packages")
                    .fetch_optional(&self.pool)
                    .await?;
            timestamp = row.and_then(|(ts,)| ts);
        }

        let Some(raw) = timestamp else {
            return Ok(true);
        };
        let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) else {
            warn!("unparsable cache timestamp '{raw}', treating cache as stale");
            return Ok(true);
        };

        let age = Utc::now().signed_duration_since(parsed.with_timezone(&Utc));
        Ok(age.num_seconds() < 0 || age.to_std().map_or(true, |age| age > max_age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn package(name: &str, version: &str) -> CanonicalPackage {
        CanonicalPackage {
            name: name.to_string(),
            version: version.to_string(),
            latest_official_version: Some(version.to_string()),
            latest_version: version.to_string(),
            author: "HL7".to_string(),
            description: "a test package".to_string(),
            fhir_version: "4.0.1".to_string(),
            url: format!("https://example.org/{name}"),
            canonical: format!("https://example.org/{name}"),
            registry: Some("https://example.org/rssfeed".to_string()),
            dependencies: vec![Dependency {
                name: "hl7.fhir.r4.core".to_string(),
                version: "4.0.1".to_string(),
            }],
            all_versions: vec![VersionEntry {
                version: version.to_string(),
                pub_date: "2024-01-01".to_string(),
            }],
            version_count: 1,
            last_updated: "2024-06-01T00:00:00+00:00".to_string(),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(&dir.path().join("packages.db")).await.unwrap()
    }

    #[tokio::test]
    async fn replace_all_round_trips_packages() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let packages = vec![package("hl7.fhir.au.core", "1.0.0"), package("pkg.b", "2.0.0")];
        store.replace_all(&packages, Utc::now(), 10).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, packages);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replace_all_discards_the_previous_generation() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .replace_all(&[package("old.pkg", "1.0.0")], Utc::now(), 10)
            .await
            .unwrap();
        store
            .replace_all(&[package("new.pkg", "2.0.0")], Utc::now(), 10)
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "new.pkg");
    }

    #[tokio::test]
    async fn duplicate_names_within_a_generation_keep_the_later_row() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut first = package("pkg.a", "1.0.0");
        first.author = "first feed".to_string();
        let mut second = package("pkg.a", "1.0.0");
        second.author = "second feed".to_string();

        store.replace_all(&[first, second], Utc::now(), 10).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].author, "second feed");
    }

    #[tokio::test]
    async fn load_all_orders_names_case_insensitively() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .replace_all(
                &[package("Zeta", "1.0.0"), package("alpha", "1.0.0"), package("Beta", "1.0.0")],
                Utc::now(),
                2,
            )
            .await
            .unwrap();

        let names: Vec<String> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alpha", "Beta", "Zeta"]);
    }

    #[tokio::test]
    async fn empty_store_is_stale() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        assert!(store.is_stale(Duration::from_secs(3600)).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_store_is_not_stale() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .replace_all(&[package("pkg.a", "1.0.0")], Utc::now(), 10)
            .await
            .unwrap();

        assert!(!store.is_stale(Duration::from_secs(3600)).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.last_fetch_timestamp().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn old_fetch_timestamp_is_stale() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        store
            .replace_all(&[package("pkg.a", "1.0.0")], two_hours_ago, 10)
            .await
            .unwrap();

        assert!(store.is_stale(Duration::from_secs(3600)).await.unwrap());
        assert!(!store.is_stale(Duration::from_secs(3 * 3600)).await.unwrap());
    }
}
