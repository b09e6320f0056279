//! End-to-end sync cycle tests against mock feed servers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mockito::{Server, ServerGuard};
use tempfile::TempDir;

use fhir_ig_registry::feed::fetcher::RetryPolicy;
use fhir_ig_registry::feed::{FeedFetcher, FeedIndex};
use fhir_ig_registry::normalize::{CanonicalPackage, VersionEntry};
use fhir_ig_registry::store::Store;
use fhir_ig_registry::sync::{SyncError, SyncOutcome, SyncService};

async fn build_service(server: &ServerGuard, store: Store) -> Arc<SyncService> {
    let client = reqwest::Client::new();
    let index = FeedIndex::new(
        client.clone(),
        &format!("{}/package-feeds.json", server.url()),
        Duration::from_secs(5),
    );
    let fetcher = FeedFetcher::new(
        client,
        RetryPolicy {
            attempts: 1,
            delay: Duration::from_millis(1),
        },
        Duration::from_secs(5),
    );
    Arc::new(SyncService::new(store, index, fetcher, 10, 4))
}

fn seed_package(name: &str) -> CanonicalPackage {
    CanonicalPackage {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        latest_official_version: Some("1.0.0".to_string()),
        latest_version: "1.0.0".to_string(),
        author: "NA".to_string(),
        description: String::new(),
        fhir_version: "4.0.1".to_string(),
        url: "unknown".to_string(),
        canonical: "unknown".to_string(),
        registry: None,
        dependencies: Vec::new(),
        all_versions: vec![VersionEntry {
            version: "1.0.0".to_string(),
            pub_date: "2024-01-01".to_string(),
        }],
        version_count: 1,
        last_updated: "2024-06-01T00:00:00+00:00".to_string(),
    }
}

fn index_body(server: &ServerGuard, paths: &[(&str, &str)]) -> String {
    let feeds: Vec<String> = paths
        .iter()
        .map(|(name, path)| format!(r#"{{"name": "{name}", "url": "{}{path}"}}"#, server.url()))
        .collect();
    format!(r#"{{"feeds": [{}]}}"#, feeds.join(","))
}

#[tokio::test]
async fn empty_feed_index_aborts_without_touching_the_store() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/package-feeds.json")
        .with_status(200)
        .with_body(r#"{"feeds": []}"#)
        .create_async()
        .await;

    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(&temp_dir.path().join("test.db")).await.unwrap();
    store
        .replace_all(&[seed_package("previous.generation")], Utc::now(), 10)
        .await
        .unwrap();

    let service = build_service(&server, store.clone()).await;
    let result = service.refresh().await;

    assert!(matches!(result, Err(SyncError::NoFeeds)));
    let status = service.status();
    assert_eq!(status.errors.len(), 1);
    assert!(!status.fetch_in_progress);
    // The previous generation stays authoritative.
    let remaining = store.load_all().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "previous.generation");
}

#[tokio::test]
async fn one_failing_feed_does_not_abort_the_cycle() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/package-feeds.json")
        .with_status(200)
        .with_body(index_body(
            &server,
            &[("good-a", "/feed-a"), ("broken", "/feed-b"), ("good-c", "/feed-c")],
        ))
        .create_async()
        .await;
    server
        .mock("GET", "/feed-a")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"packages": [{"name": "pkg.a", "version": "1.0.0",
                "versions": [{"version": "1.0.0", "pubDate": "2024-01-01"}]}]}"#,
        )
        .create_async()
        .await;
    server.mock("GET", "/feed-b").with_status(500).create_async().await;
    server
        .mock("GET", "/feed-c")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"packages": [{"name": "pkg.c", "version": "2.0.0",
                "versions": [{"version": "2.0.0", "pubDate": "2024-02-02"}]}]}"#,
        )
        .create_async()
        .await;

    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(&temp_dir.path().join("test.db")).await.unwrap();
    let service = build_service(&server, store.clone()).await;

    let outcome = service.refresh().await.unwrap();

    assert_eq!(outcome, SyncOutcome::PartiallyFailed { packages: 2, failed_feeds: 1 });
    let status = service.status();
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].contains("broken"));
    assert!(status.last_refresh.is_some());

    let names: Vec<String> = store
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["pkg.a", "pkg.c"]);
}

#[tokio::test]
async fn full_cycle_merges_json_and_rss_feeds() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/package-feeds.json")
        .with_status(200)
        .with_body(index_body(&server, &[("json", "/feed.json"), ("rss", "/rssfeed")]))
        .create_async()
        .await;
    server
        .mock("GET", "/feed.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"packages": [{"name": "hl7.fhir.au.core", "version": "1.0.0",
                "author": "HL7 Australia",
                "versions": [{"version": "1.0.0", "pubDate": "2023-01-01"}]}]}"#,
        )
        .create_async()
        .await;
    server
        .mock("GET", "/rssfeed")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(
            r#"<rss version="2.0"><channel>
                <item>
                    <title>hl7.fhir.us.core#6.1.0</title>
                    <link>https://example.org/us-core</link>
                    <pubDate>2024-01-01</pubDate>
                </item>
            </channel></rss>"#,
        )
        .create_async()
        .await;

    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(&temp_dir.path().join("test.db")).await.unwrap();
    let service = build_service(&server, store.clone()).await;

    let outcome = service.refresh().await.unwrap();

    assert_eq!(outcome, SyncOutcome::Succeeded { packages: 2 });
    let snapshot = service.snapshot().expect("snapshot committed");
    assert_eq!(snapshot.packages.len(), 2);

    let packages = store.load_all().await.unwrap();
    assert_eq!(packages[0].name, "hl7.fhir.au.core");
    assert_eq!(packages[0].author, "HL7 Australia");
    assert_eq!(packages[1].name, "hl7.fhir.us.core");
    assert_eq!(packages[1].version, "6.1.0");
    assert_eq!(
        packages[1].registry.as_deref(),
        Some(format!("{}/rssfeed", server.url()).as_str())
    );
}

#[tokio::test]
async fn every_feed_failing_preserves_the_previous_generation() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/package-feeds.json")
        .with_status(200)
        .with_body(index_body(&server, &[("only", "/feed")]))
        .create_async()
        .await;
    server.mock("GET", "/feed").with_status(500).create_async().await;

    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(&temp_dir.path().join("test.db")).await.unwrap();
    store
        .replace_all(&[seed_package("previous.generation")], Utc::now(), 10)
        .await
        .unwrap();

    let service = build_service(&server, store.clone()).await;
    let result = service.refresh().await;

    assert!(matches!(result, Err(SyncError::AllFeedsFailed)));
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn fresh_disk_cache_is_served_without_any_fetch() {
    let mut server = Server::new_async().await;
    let index_mock = server
        .mock("GET", "/package-feeds.json")
        .expect(0)
        .create_async()
        .await;

    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(&temp_dir.path().join("test.db")).await.unwrap();
    store
        .replace_all(&[seed_package("cached.pkg")], Utc::now(), 10)
        .await
        .unwrap();

    let service = build_service(&server, store).await;
    service
        .refresh_if_stale(Duration::from_secs(3600))
        .await
        .unwrap();

    index_mock.assert_async().await;
    let snapshot = service.snapshot().expect("snapshot loaded from disk");
    assert_eq!(snapshot.packages.len(), 1);
    assert_eq!(snapshot.packages[0].name, "cached.pkg");
    assert!(service.status().last_refresh.is_some());
}
