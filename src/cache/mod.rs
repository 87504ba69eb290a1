pub mod download;
pub mod engine;

pub use download::DownloadCoordinator;
pub use engine::{content_hash, CacheEngine, CacheStats};
