//! Package archive (`.tgz`) retrieval.
//!
//! A package's archive can live in several places depending on which
//! registry published it, so retrieval walks a fixed fallback chain:
//! the package's own canonical URL when it points straight at an archive,
//! then the primary registry's directory and `package.tgz` forms, then the
//! package's source feed host. Downloads land in a local directory and are
//! never re-fetched once present.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not retrieve archive for {name}#{version}: {detail}")]
    Exhausted {
        name: String,
        version: String,
        detail: String,
        /// True when the last attempted source answered 404, meaning the
        /// package release does not exist rather than being unreachable.
        not_found: bool,
    },
}

pub struct ArtifactFetcher {
    client: reqwest::Client,
    download_dir: PathBuf,
    registry_base_url: String,
    fallback_registry_url: String,
    timeout: Duration,
}

impl ArtifactFetcher {
    pub fn new(
        client: reqwest::Client,
        download_dir: PathBuf,
        registry_base_url: &str,
        fallback_registry_url: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            download_dir,
            registry_base_url: registry_base_url.trim_end_matches('/').to_string(),
            fallback_registry_url: fallback_registry_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Local path the archive for `name#version` is stored at.
    pub fn local_path(&self, name: &str, version: &str) -> PathBuf {
        let file_name = format!("{name}-{version}.tgz").replace('/', "_");
        self.download_dir.join(file_name)
    }

    /// Ensures the archive for `name#version` is present locally, walking
    /// the source chain until one succeeds. `canonical` and `registry` come
    /// from the package's cached metadata.
    pub async fn ensure_archive(
        &self,
        name: &str,
        version: &str,
        canonical: Option<&str>,
        registry: Option<&str>,
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.local_path(name, version);
        if path.exists() {
            debug!("archive for {name}#{version} already downloaded");
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.download_dir).await?;

        let mut last_detail = String::from("no archive sources available");
        let mut last_status: Option<StatusCode> = None;

        for source in self.sources(name, version, canonical, registry) {
            match self.try_download(&source, &path).await {
                Ok(()) => {
                    info!("downloaded {name}#{version} from {}", source.url);
                    return Ok(path);
                }
                Err(AttemptError::Rejected { status, detail }) => {
                    debug!("source {} rejected: {detail}", source.url);
                    last_detail = detail;
                    last_status = status;
                }
            }
        }

        warn!("all archive sources exhausted for {name}#{version}");
        Err(ArtifactError::Exhausted {
            name: name.to_string(),
            version: version.to_string(),
            detail: last_detail,
            not_found: last_status == Some(StatusCode::NOT_FOUND),
        })
    }

    fn sources(
        &self,
        name: &str,
        version: &str,
        canonical: Option<&str>,
        registry: Option<&str>,
    ) -> Vec<Source> {
        let mut sources = Vec::with_capacity(4);

        // The canonical URL only counts when it points straight at this
        // release's archive.
        if let Some(canonical) = canonical
            && canonical.ends_with(&format!("{version}/package.tgz"))
        {
            sources.push(Source {
                url: canonical.to_string(),
                require_archive_headers: false,
            });
        }

        // Some registries serve the archive from the bare directory URL and
        // an HTML listing otherwise; the headers decide which one we got.
        sources.push(Source {
            url: format!("{}/{name}/{version}/", self.registry_base_url),
            require_archive_headers: true,
        });
        sources.push(Source {
            url: format!("{}/{name}/{version}/package.tgz", self.registry_base_url),
            require_archive_headers: false,
        });

        let feed_base = registry
            .map(|r| r.trim_end_matches('/').trim_end_matches("/rssfeed").to_string())
            .map(|r| r.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.fallback_registry_url.clone());
        sources.push(Source {
            url: format!("{feed_base}/{name}/{version}/package.tgz"),
            require_archive_headers: false,
        });

        sources
    }

    async fn try_download(&self, source: &Source, path: &Path) -> Result<(), AttemptError> {
        let response = self
            .client
            .get(&source.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AttemptError::Rejected {
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Rejected {
                status: Some(status),
                detail: format!("{} answered {status}", source.url),
            });
        }

        if source.require_archive_headers && !looks_like_archive(&response) {
            return Err(AttemptError::Rejected {
                status: Some(status),
                detail: format!("{} did not serve an archive", source.url),
            });
        }

        let bytes = response.bytes().await.map_err(|e| AttemptError::Rejected {
            status: None,
            detail: e.to_string(),
        })?;
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|e| AttemptError::Rejected {
                status: None,
                detail: format!("failed to write {}: {e}", path.display()),
            })?;
        Ok(())
    }
}

struct Source {
    url: String,
    require_archive_headers: bool,
}

enum AttemptError {
    Rejected {
        status: Option<StatusCode>,
        detail: String,
    },
}

/// Whether the response headers mark the body as a tarball rather than an
/// HTML directory listing.
fn looks_like_archive(response: &reqwest::Response) -> bool {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    if content_type.contains("tar") || content_type.contains("gzip") {
        return true;
    }
    response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|d| d.contains(".tgz") || d.contains(".tar.gz"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use tempfile::tempdir;

    fn fetcher(server: &Server, dir: &tempfile::TempDir) -> ArtifactFetcher {
        ArtifactFetcher::new(
            reqwest::Client::new(),
            dir.path().to_path_buf(),
            &server.url(),
            &format!("{}/fallback", server.url()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn existing_archive_is_served_without_any_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let fetcher = fetcher(&server, &dir);

        let path = fetcher.local_path("pkg.a", "1.0.0");
        std::fs::write(&path, b"cached").unwrap();

        let resolved = fetcher
            .ensure_archive("pkg.a", "1.0.0", None, None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(resolved, path);
    }

    #[tokio::test]
    async fn canonical_archive_url_is_tried_first() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/canonical/pkg.a/1.0.0/package.tgz")
            .with_status(200)
            .with_body("tarball-bytes")
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let fetcher = fetcher(&server, &dir);

        let canonical = format!("{}/canonical/pkg.a/1.0.0/package.tgz", server.url());
        let path = fetcher
            .ensure_archive("pkg.a", "1.0.0", Some(&canonical), None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(std::fs::read(&path).unwrap(), b"tarball-bytes");
    }

    #[tokio::test]
    async fn directory_url_needs_archive_headers() {
        let mut server = Server::new_async().await;
        // HTML listing on the directory form, real archive on package.tgz.
        server
            .mock("GET", "/pkg.a/1.0.0/")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>listing</html>")
            .create_async()
            .await;
        let mock = server
            .mock("GET", "/pkg.a/1.0.0/package.tgz")
            .with_status(200)
            .with_body("tarball-bytes")
            .create_async()
            .await;
        let dir = tempdir().unwrap();

        let path = fetcher(&server, &dir)
            .ensure_archive("pkg.a", "1.0.0", None, None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(std::fs::read(&path).unwrap(), b"tarball-bytes");
    }

    #[tokio::test]
    async fn directory_url_with_tar_content_type_is_accepted() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/pkg.a/1.0.0/")
            .with_status(200)
            .with_header("content-type", "application/x-tar")
            .with_body("tarball-bytes")
            .create_async()
            .await;
        let dir = tempdir().unwrap();

        let path = fetcher(&server, &dir)
            .ensure_archive("pkg.a", "1.0.0", None, None)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"tarball-bytes");
    }

    #[tokio::test]
    async fn source_feed_host_is_the_last_resort() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/pkg.a/1.0.0/").with_status(404).create_async().await;
        server
            .mock("GET", "/pkg.a/1.0.0/package.tgz")
            .with_status(404)
            .create_async()
            .await;
        let mock = server
            .mock("GET", "/feed/pkg.a/1.0.0/package.tgz")
            .with_status(200)
            .with_body("tarball-bytes")
            .create_async()
            .await;
        let dir = tempdir().unwrap();

        let registry = format!("{}/feed/rssfeed", server.url());
        let path = fetcher(&server, &dir)
            .ensure_archive("pkg.a", "1.0.0", None, Some(&registry))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(std::fs::read(&path).unwrap(), b"tarball-bytes");
    }

    #[tokio::test]
    async fn exhausted_chain_reports_not_found_on_trailing_404() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/pkg.a/9.9.9/").with_status(404).create_async().await;
        server
            .mock("GET", "/pkg.a/9.9.9/package.tgz")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/fallback/pkg.a/9.9.9/package.tgz")
            .with_status(404)
            .create_async()
            .await;
        let dir = tempdir().unwrap();

        let err = fetcher(&server, &dir)
            .ensure_archive("pkg.a", "9.9.9", None, None)
            .await
            .unwrap_err();

        match err {
            ArtifactError::Exhausted { not_found, .. } => assert!(not_found),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exhausted_chain_without_404_is_not_a_missing_release() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/pkg.a/1.0.0/").with_status(500).create_async().await;
        server
            .mock("GET", "/pkg.a/1.0.0/package.tgz")
            .with_status(500)
            .create_async()
            .await;
        server
            .mock("GET", "/fallback/pkg.a/1.0.0/package.tgz")
            .with_status(503)
            .create_async()
            .await;
        let dir = tempdir().unwrap();

        let err = fetcher(&server, &dir)
            .ensure_archive("pkg.a", "1.0.0", None, None)
            .await
            .unwrap_err();

        match err {
            ArtifactError::Exhausted { not_found, .. } => assert!(!not_found),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn local_path_replaces_slashes() {
        let dir = tempdir().unwrap();
        let fetcher = ArtifactFetcher::new(
            reqwest::Client::new(),
            dir.path().to_path_buf(),
            "https://packages.example.org",
            "https://fallback.example.org",
            Duration::from_secs(5),
        );
        let path = fetcher.local_path("scoped/pkg", "1.0.0");
        assert_eq!(path.file_name().unwrap(), "scoped_pkg-1.0.0.tgz");
    }
}
