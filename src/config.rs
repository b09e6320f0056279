//! Service configuration.
//!
//! Everything tunable comes in through CLI flags or environment variables;
//! the data directory falls back to the XDG data dir when not set.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::feed::fetcher::RetryPolicy;
use crate::feed::index::DEFAULT_INDEX_URL;

#[derive(Debug, Parser)]
#[command(name = "fhir-ig-registry", version, about)]
pub struct Config {
    /// Port the HTTP API listens on.
    #[arg(long, env = "IG_REGISTRY_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory for the database and downloaded package archives.
    #[arg(long, env = "IG_REGISTRY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// URL of the master feed index.
    #[arg(long, env = "IG_REGISTRY_FEED_INDEX_URL", default_value = DEFAULT_INDEX_URL)]
    pub feed_index_url: String,

    /// Primary registry for package archive downloads.
    #[arg(
        long,
        env = "IG_REGISTRY_BASE_URL",
        default_value = "https://packages.fhir.org"
    )]
    pub registry_base_url: String,

    /// Registry tried last when a package's own feed host is unknown.
    #[arg(
        long,
        env = "IG_REGISTRY_FALLBACK_URL",
        default_value = "https://packages.simplifier.net"
    )]
    pub fallback_registry_url: String,

    /// Cache age beyond which startup triggers a refresh, in seconds.
    #[arg(long, env = "IG_REGISTRY_MAX_CACHE_AGE_SECS", default_value_t = 4 * 3600)]
    pub max_cache_age_secs: u64,

    /// Interval between scheduled background refreshes, in seconds.
    #[arg(long, env = "IG_REGISTRY_REFRESH_INTERVAL_SECS", default_value_t = 8 * 3600)]
    pub refresh_interval_secs: u64,

    /// Per-request timeout for feed and archive fetches, in seconds.
    #[arg(long, env = "IG_REGISTRY_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    /// Timeout for the feed index fetch, in seconds.
    #[arg(long, env = "IG_REGISTRY_INDEX_TIMEOUT_SECS", default_value_t = 15)]
    pub index_timeout_secs: u64,

    /// Attempts per feed before giving up on it for this cycle.
    #[arg(long, env = "IG_REGISTRY_RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Delay between feed retry attempts, in seconds.
    #[arg(long, env = "IG_REGISTRY_RETRY_DELAY_SECS", default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Rows per insert batch when replacing the package table.
    #[arg(long, env = "IG_REGISTRY_BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    /// Feeds fetched concurrently during a sync cycle.
    #[arg(long, env = "IG_REGISTRY_MAX_CONCURRENT_FEEDS", default_value_t = 4)]
    pub max_concurrent_feeds: usize,

    /// Minimum normalized fuzzy-match score for a search hit.
    #[arg(long, env = "IG_REGISTRY_SEARCH_CUTOFF", default_value_t = 0.7)]
    pub search_cutoff: f64,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| default_data_dir(dirs::data_dir()))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("packages.db")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir().join("fhir_packages")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout_secs)
    }

    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

fn default_data_dir(platform_data_dir: Option<PathBuf>) -> PathBuf {
    platform_data_dir
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fhir-ig-registry")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_data_dir_uses_platform_dir_when_available() {
        let path = default_data_dir(Some(PathBuf::from("/home/user/.local/share")));
        assert_eq!(path, PathBuf::from("/home/user/.local/share/fhir-ig-registry"));
    }

    #[test]
    fn default_data_dir_falls_back_to_current_dir() {
        let path = default_data_dir(None);
        assert_eq!(path, PathBuf::from("./fhir-ig-registry"));
    }

    #[test]
    fn defaults_parse_without_arguments() {
        let config = Config::parse_from(["fhir-ig-registry"]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.retry_policy().attempts, 3);
        assert_eq!(config.max_cache_age(), Duration::from_secs(4 * 3600));
        assert_eq!(config.refresh_interval(), Duration::from_secs(8 * 3600));
    }
}
