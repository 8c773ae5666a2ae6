use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use uuid::Uuid;

/// Substrings in yt-dlp stderr that indicate a sign-in or bot check rather
/// than a generic failure. Heuristic and non-exhaustive: the engine's error
/// text is free-form and changes between releases, so this table only has to
/// catch the common phrasings well enough to steer the caller toward a
/// credential refresh instead of a blind retry.
const AUTH_MARKERS: &[&str] = &[
    "sign in to confirm",
    "confirm you're not a bot",
    "confirm you are not a bot",
    "login required",
    "please log in",
    "use --cookies",
    "account cookies",
    "captcha",
];

/// Best-effort classification of an engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The engine hit a sign-in wall or bot check; refreshing the cookie
    /// file is more likely to help than retrying
    AuthRejected,
    /// Anything else: unsupported URL, network trouble, no output produced
    Generic,
}

/// Classify engine stderr by substring match against [`AUTH_MARKERS`]
pub fn classify_engine_error(stderr: &str) -> EngineErrorKind {
    let lowered = stderr.to_lowercase();
    if AUTH_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        EngineErrorKind::AuthRejected
    } else {
        EngineErrorKind::Generic
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("engine reported a sign-in or bot check: {0}")]
    AuthRejected(String),

    #[error("extraction engine failed: {0}")]
    Engine(String),

    #[error("engine succeeded but produced no output file")]
    NoOutput,

    #[error("failed to invoke extraction engine: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One extraction attempt: URL in, audio file out.
///
/// Implementations never retry; retry policy belongs to the caller.
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Produce one MP3 file in `output_dir` for the given URL, presenting
    /// `cookie_file` to the engine when available.
    async fn extract(
        &self,
        url: &str,
        cookie_file: Option<&Path>,
        output_dir: &Path,
    ) -> Result<PathBuf, ExtractError>;

    /// Probe the source duration in seconds, if the engine can report it
    async fn probe_duration(&self, url: &str, cookie_file: Option<&Path>) -> Option<f64>;
}

/// Audio extractor shelling out to yt-dlp
pub struct YtDlpExtractor {
    yt_dlp_path: String,
    bitrate: u32,
}

impl YtDlpExtractor {
    pub fn new(yt_dlp_path: impl Into<String>, bitrate: u32) -> Self {
        Self {
            yt_dlp_path: yt_dlp_path.into(),
            bitrate,
        }
    }

    /// Check if yt-dlp is available
    pub async fn check_availability(&self) -> bool {
        Command::new(&self.yt_dlp_path)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn base_args(&self, cookie_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            // Anti-blocking heuristics: opaque engine configuration, passed
            // through as observed working values.
            "--extractor-args".to_string(),
            "youtube:player_client=android,web".to_string(),
            "--user-agent".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        ];
        if let Some(path) = cookie_file {
            args.push("--cookies".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        args
    }
}

#[async_trait]
impl AudioExtractor for YtDlpExtractor {
    async fn extract(
        &self,
        url: &str,
        cookie_file: Option<&Path>,
        output_dir: &Path,
    ) -> Result<PathBuf, ExtractError> {
        let stem = Uuid::new_v4().to_string();
        let template = output_dir.join(format!("{}.%(ext)s", stem));
        let expected = output_dir.join(format!("{}.mp3", stem));

        tracing::debug!(%url, output = %expected.display(), "invoking yt-dlp");

        let mut args = self.base_args(cookie_file);
        args.extend([
            "--output".to_string(),
            template.to_string_lossy().into_owned(),
            "--extract-audio".to_string(),
            "--audio-format".to_string(),
            "mp3".to_string(),
            "--audio-quality".to_string(),
            format!("{}K", self.bitrate),
            "--format".to_string(),
            "bestaudio/best".to_string(),
            "--newline".to_string(),
            url.to_string(),
        ]);

        let output = Command::new(&self.yt_dlp_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(match classify_engine_error(&stderr) {
                EngineErrorKind::AuthRejected => ExtractError::AuthRejected(stderr),
                EngineErrorKind::Generic => ExtractError::Engine(stderr),
            });
        }

        if expected.exists() {
            return Ok(expected);
        }

        // The engine occasionally keeps a different extension despite the
        // postprocessor; fall back to anything sharing our unique stem.
        match find_by_stem(output_dir, &stem) {
            Some(path) => {
                tracing::warn!(
                    found = %path.display(),
                    "expected mp3 missing, serving alternate extension"
                );
                Ok(path)
            }
            None => Err(ExtractError::NoOutput),
        }
    }

    async fn probe_duration(&self, url: &str, cookie_file: Option<&Path>) -> Option<f64> {
        let mut args = self.base_args(cookie_file);
        args.extend([
            "--dump-json".to_string(),
            "--skip-download".to_string(),
            url.to_string(),
        ]);

        let output = Command::new(&self.yt_dlp_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            tracing::debug!(%url, "duration probe failed");
            return None;
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        info["duration"].as_f64()
    }
}

/// Check for required external tools, returning a warning per missing one
pub async fn check_dependencies(yt_dlp_path: &str) -> Vec<String> {
    let mut missing = Vec::new();

    if !command_available(yt_dlp_path).await {
        missing.push(format!("{} - required for audio extraction", yt_dlp_path));
    }
    if !command_available("ffmpeg").await {
        missing.push("ffmpeg - required for MP3 conversion".to_string());
    }

    missing
}

async fn command_available(command: &str) -> bool {
    Command::new(command)
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn find_by_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    let entries = fs_err::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_stem()
            .map(|s| s.to_string_lossy() == stem)
            .unwrap_or(false)
        {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sign_in_errors_classified_as_auth() {
        let stderr = "ERROR: [youtube] abc123: Sign in to confirm you're not a bot. \
                      Use --cookies or --cookies-from-browser.";
        assert_eq!(classify_engine_error(stderr), EngineErrorKind::AuthRejected);
    }

    #[test]
    fn login_required_classified_as_auth() {
        assert_eq!(
            classify_engine_error("ERROR: This video is private, login required"),
            EngineErrorKind::AuthRejected
        );
    }

    #[test]
    fn unrelated_errors_classified_as_generic() {
        assert_eq!(
            classify_engine_error("ERROR: Unsupported URL: https://example.com/x"),
            EngineErrorKind::Generic
        );
        assert_eq!(
            classify_engine_error("ERROR: unable to download video data"),
            EngineErrorKind::Generic
        );
    }

    #[test]
    fn classification_ignores_case() {
        assert_eq!(
            classify_engine_error("SIGN IN TO CONFIRM your age"),
            EngineErrorKind::AuthRejected
        );
    }

    #[test]
    fn stem_lookup_finds_alternate_extension() {
        let dir = TempDir::new().unwrap();
        let stem = "f81d4fae-7dec-11d0-a765-00a0c91e6bf6";
        fs_err::write(dir.path().join(format!("{}.m4a", stem)), b"audio").unwrap();
        fs_err::write(dir.path().join("other.mp3"), b"audio").unwrap();

        let found = find_by_stem(dir.path(), stem).unwrap();
        assert_eq!(
            found.file_name().unwrap().to_string_lossy(),
            format!("{}.m4a", stem)
        );
    }

    #[test]
    fn stem_lookup_misses_cleanly() {
        let dir = TempDir::new().unwrap();
        assert!(find_by_stem(dir.path(), "nothing-here").is_none());
    }
}
