//! External audio extractor contract and the yt-dlp implementation.
//!
//! The extractor is an opaque process: it takes a page URL and an output
//! template, and leaves an audio file next to the template with whatever
//! extension it chose.

use crate::error::{MeloError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Extensions the downstream cache accepts.
pub const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "m4a", "opus", "ogg", "wav", "flac"];

#[derive(Debug, Clone, Deserialize)]
pub struct MediaProbe {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Resolve `url` into an audio file matching `out_template`
    /// (`…/<id>.%(ext)s`) and return the produced path.
    async fn extract(
        &self,
        url: &str,
        out_template: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<PathBuf>;

    /// Cheap metadata lookup without downloading. `None` when the backend
    /// cannot probe.
    async fn probe(&self, url: &str) -> Result<Option<MediaProbe>> {
        let _ = url;
        Ok(None)
    }
}

/// Shells out to `yt-dlp`.
pub struct YtDlpExtractor {
    program: String,
    audio_format: String,
}

impl YtDlpExtractor {
    pub fn new(audio_format: impl Into<String>) -> Self {
        Self {
            program: "yt-dlp".to_string(),
            audio_format: audio_format.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run_once(&self, url: &str, out_template: &str, timeout: Duration) -> Result<PathBuf> {
        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.program)
                .args([
                    "-f",
                    "bestaudio/best",
                    "-x",
                    "--audio-format",
                    self.audio_format.as_str(),
                    "-o",
                    out_template,
                    "--no-playlist",
                    "--quiet",
                    "--no-warnings",
                    url,
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| MeloError::Extractor(format!("timed out after {timeout:?}")))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MeloError::Extractor(if stderr.is_empty() {
                format!("exit status {}", output.status)
            } else {
                stderr
            }));
        }

        locate_output(out_template)
            .ok_or_else(|| MeloError::Extractor(format!("no output file for {url}")))
    }
}

#[async_trait]
impl AudioExtractor for YtDlpExtractor {
    async fn extract(
        &self,
        url: &str,
        out_template: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<PathBuf> {
        let attempts = retries.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.run_once(url, out_template, timeout).await {
                Ok(path) => return Ok(path),
                Err(err) => {
                    if is_permanent(&err) {
                        return Err(err);
                    }
                    warn!(url, attempt, %err, "extraction attempt failed");
                    last_error = Some(err);
                    if attempt + 1 < attempts {
                        let backoff = Duration::from_secs((1u64 << attempt).min(60));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| MeloError::Extractor("no attempts made".into())))
    }

    async fn probe(&self, url: &str) -> Result<Option<MediaProbe>> {
        let output = Command::new(&self.program)
            .args(["-J", "--no-warnings", "--skip-download", url])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            debug!(url, "probe failed, continuing without metadata");
            return Ok(None);
        }
        Ok(serde_json::from_slice::<MediaProbe>(&output.stdout).ok())
    }
}

fn is_permanent(err: &MeloError) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("404")
        || message.contains("not found")
        || message.contains("unavailable")
        || message.contains("private video")
}

/// Resolve the file the extractor produced for `…/<stem>.%(ext)s`.
fn locate_output(out_template: &str) -> Option<PathBuf> {
    let base = out_template
        .strip_suffix(".%(ext)s")
        .unwrap_or(out_template);
    let base = Path::new(base);
    let dir = base.parent()?;
    let stem = base.file_name()?.to_str()?;

    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        let matches_stem = path
            .file_stem()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name == stem);
        let audio_ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)));
        if matches_stem && audio_ext && path.is_file() {
            return Some(path);
        }
    }
    None
}
