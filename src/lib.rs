pub mod artifact;
pub mod config;
pub mod feed;
pub mod log;
pub mod normalize;
pub mod profile;
pub mod search;
pub mod server;
pub mod store;
pub mod sync;
pub mod version;
