//! Audiogate - a token-gated audio extraction service
//!
//! Accepts a video URL, extracts the audio track with yt-dlp, converts it to
//! MP3 and serves the result exactly once behind a short-lived opaque token.
//! Optionally mirrors artifacts to a remote object store and keeps a local
//! session-cookie file refreshed from that store.

pub mod config;
pub mod extract;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod vault;

pub use config::Config;
pub use pipeline::Pipeline;
pub use registry::TokenRegistry;

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Failure taxonomy for a single extraction job
#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("missing or malformed input: {0}")]
    Input(String),

    #[error("credential sync failed: {0}")]
    Credential(String),

    #[error("engine reported a sign-in or bot check, refresh credentials: {0}")]
    AuthRejected(String),

    #[error("audio extraction failed: {0}")]
    Extraction(String),

    #[error("artifact upload rejected by remote store: {0}")]
    StorageUpload(String),

    #[error("unknown or expired token")]
    NotFound,
}
