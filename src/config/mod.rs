use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from the process environment.
///
/// Remote-store integration (vault sync + artifact upload + record patching)
/// is enabled only when both `STORAGE_URL` and `STORAGE_SERVICE_KEY` are set.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Local extraction settings
    pub app: AppConfig,

    /// Remote object-store settings, when configured
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding produced audio files
    pub download_dir: PathBuf,

    /// Local session-cookie file presented to the extraction engine
    pub cookie_file: PathBuf,

    /// Time-to-live before an unclaimed token and its artifact are evicted
    pub token_ttl: Duration,

    /// Sweeper tick
    pub sweep_interval: Duration,

    /// Maximum concurrent extractions
    pub max_concurrent_extractions: usize,

    /// Target MP3 bitrate in kbps
    pub audio_bitrate: u32,

    /// Path to the yt-dlp binary
    pub yt_dlp_path: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base URL of the remote store
    pub url: String,

    /// Service key used as bearer credential
    pub service_key: String,

    /// Bucket receiving uploaded artifacts in integrated mode
    pub audio_bucket: String,

    /// Bucket holding the mirrored credential blob
    pub cookie_bucket: String,

    /// Object name of the credential blob
    pub cookie_object: String,

    /// Interval between scheduled vault syncs
    pub sync_interval: Duration,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup (testable)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("AUDIOGATE_BIND")
            .unwrap_or_else(|| "0.0.0.0:10000".to_string())
            .parse::<SocketAddr>()
            .context("AUDIOGATE_BIND is not a valid socket address")?;

        let app = AppConfig {
            download_dir: PathBuf::from(
                lookup("AUDIOGATE_DOWNLOAD_DIR").unwrap_or_else(|| "downloads".to_string()),
            ),
            cookie_file: PathBuf::from(
                lookup("AUDIOGATE_COOKIE_FILE").unwrap_or_else(|| "cookies.txt".to_string()),
            ),
            token_ttl: Duration::from_secs(parse_or(
                &lookup,
                "AUDIOGATE_TOKEN_TTL_SECS",
                300,
            )?),
            sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "AUDIOGATE_SWEEP_INTERVAL_SECS",
                60,
            )?),
            max_concurrent_extractions: parse_or(
                &lookup,
                "AUDIOGATE_MAX_CONCURRENT_EXTRACTIONS",
                1,
            )?,
            audio_bitrate: parse_or(&lookup, "AUDIOGATE_AUDIO_BITRATE", 192)?,
            yt_dlp_path: lookup("AUDIOGATE_YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
        };

        let storage = match (lookup("STORAGE_URL"), lookup("STORAGE_SERVICE_KEY")) {
            (Some(url), Some(service_key)) if !url.is_empty() && !service_key.is_empty() => {
                Some(StorageConfig {
                    url: url.trim_end_matches('/').to_string(),
                    service_key,
                    audio_bucket: lookup("STORAGE_BUCKET")
                        .unwrap_or_else(|| "youtube_audio".to_string()),
                    cookie_bucket: lookup("STORAGE_COOKIE_BUCKET")
                        .unwrap_or_else(|| "secrets".to_string()),
                    cookie_object: lookup("STORAGE_COOKIE_OBJECT")
                        .unwrap_or_else(|| "cookies.txt".to_string()),
                    sync_interval: Duration::from_secs(parse_or(
                        &lookup,
                        "AUDIOGATE_VAULT_SYNC_INTERVAL_SECS",
                        3600,
                    )?),
                })
            }
            _ => None,
        };

        let config = Self {
            server: ServerConfig { bind },
            app,
            storage,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.app.max_concurrent_extractions == 0 {
            anyhow::bail!("AUDIOGATE_MAX_CONCURRENT_EXTRACTIONS must be at least 1");
        }
        if self.app.token_ttl.is_zero() {
            anyhow::bail!("AUDIOGATE_TOKEN_TTL_SECS must be greater than zero");
        }
        Ok(())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}
