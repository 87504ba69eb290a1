use thiserror::Error;

/// Error type shared across the whole core.
///
/// Source plugin failures are generally swallowed during aggregation and only
/// surface when every plugin failed; everything else propagates to the
/// orchestrator, which renders a single short line for the user.
#[derive(Debug, Error)]
pub enum MeloError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("download failed: {0}")]
    Download(String),
    #[error("extractor failed: {0}")]
    Extractor(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("source {0} failed: {1}")]
    Source(String, String),
    #[error("playback error: {0}")]
    Playback(String),
    #[error("malformed playlist: {0}")]
    Protocol(String),
    #[error("voice permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = MeloError> = std::result::Result<T, E>;
