//! Feed layer: the master index of feeds, per-feed fetching with retry, and
//! the raw record types the aggregation pipeline consumes.

pub mod fetcher;
pub mod index;
pub mod syndication;
pub mod types;

pub use fetcher::{FeedFetcher, RetryPolicy};
pub use index::FeedIndex;
pub use types::{Feed, RawEntry};
