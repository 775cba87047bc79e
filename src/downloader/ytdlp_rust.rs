use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::downloader::http_pool::HttpPool;
use crate::downloader::{CollectionExpander, CustomQuality, Quality, ResolvedStream, Resolver};
use crate::errors::DownloadError;
use crate::utils::{ensure_dir_exists, sanitize_filename};

/// yt-dlp information extractor.
///
/// Resolves single items into HTTP streams and expands playlists into their
/// item URLs. Only metadata comes from yt-dlp; bytes are fetched through the
/// shared [`HttpPool`].
pub struct YtDlpExtractor {
    http_pool: Arc<HttpPool>,
    ytdlp_path: String,
}

impl YtDlpExtractor {
    pub fn new(http_pool: Arc<HttpPool>) -> Self {
        Self {
            http_pool,
            ytdlp_path: "yt-dlp".to_string(),
        }
    }

    pub fn with_ytdlp_path(mut self, path: String) -> Self {
        self.ytdlp_path = path;
        self
    }

    /// Extract video information using yt-dlp
    pub async fn extract_info(&self, url: &str) -> Result<VideoInfo, DownloadError> {
        log::info!("🔍 [YTDLP] extracting info for {}", url);
        let output = self
            .run(&["--dump-json", "--no-warnings", "--no-playlist", url])
            .await
            .map_err(DownloadError::resolution)?;

        let info: VideoInfo = serde_json::from_str(output.trim())
            .map_err(|e| DownloadError::resolution(format!("unreadable yt-dlp output: {}", e)))?;
        log::info!(
            "✅ [YTDLP] '{}' has {} format(s)",
            info.title,
            info.formats.as_ref().map_or(0, Vec::len)
        );
        Ok(info)
    }

    /// List the item URLs of a playlist, in playlist order.
    pub async fn list_collection(&self, url: &str) -> Result<Vec<String>, DownloadError> {
        log::info!("📃 [YTDLP] listing collection {}", url);
        let output = self
            .run(&["--flat-playlist", "--dump-json", "--no-warnings", url])
            .await
            .map_err(DownloadError::expansion)?;

        Ok(parse_flat_playlist(&output))
    }

    async fn run(&self, args: &[&str]) -> Result<String, String> {
        log::debug!("🚀 [YTDLP] {} {}", self.ytdlp_path, args.join(" "));
        let output = Command::new(&self.ytdlp_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.ytdlp_path, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::error!("❌ [YTDLP] exited with {}: {}", output.status, stderr.trim());
            return Err(format!("yt-dlp failed: {}", stderr.trim()));
        }

        String::from_utf8(output.stdout).map_err(|e| format!("Invalid UTF-8 in yt-dlp output: {}", e))
    }
}

#[async_trait]
impl Resolver for YtDlpExtractor {
    async fn resolve(
        &self,
        source: &str,
        quality: &Quality,
        destination: &Path,
    ) -> Result<Box<dyn ResolvedStream>, DownloadError> {
        let info = self.extract_info(source).await?;
        let format = select_format(&info, quality)?;
        let url = format
            .url
            .as_deref()
            .ok_or_else(|| DownloadError::resolution("selected format has no URL"))?;
        log::info!(
            "🎞️ [YTDLP] '{}' -> format {} ({}, {})",
            info.title,
            format.format_id,
            format.ext,
            format.height.map_or_else(|| "audio".to_string(), |h| format!("{}p", h))
        );

        ensure_dir_exists(destination)
            .await
            .map_err(|e| DownloadError::resolution(e.to_string()))?;
        let output_path = destination.join(output_file_name(&info, format));

        let stream = self
            .http_pool
            .open_stream(url, &info.title, format.exact_size(), output_path)
            .await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl CollectionExpander for YtDlpExtractor {
    async fn expand(&self, collection: &str) -> Result<Vec<String>, DownloadError> {
        self.list_collection(collection).await
    }
}

/// Video information from yt-dlp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub webpage_url: Option<String>,
    pub ext: Option<String>,
    pub duration: Option<f64>,
    pub formats: Option<Vec<FormatInfo>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    pub height: Option<u32>,
    pub tbr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    pub protocol: Option<String>,
    pub url: Option<String>,
}

impl FormatInfo {
    fn has_codec(codec: &Option<String>) -> bool {
        codec.as_deref().is_some_and(|c| c != "none")
    }

    /// Audio and video in one file.
    pub fn is_progressive(&self) -> bool {
        Self::has_codec(&self.acodec) && Self::has_codec(&self.vcodec)
    }

    /// Plain HTTP(S) download with a direct URL.
    pub fn is_direct(&self) -> bool {
        self.url.is_some()
            && self
                .protocol
                .as_deref()
                .map_or(true, |p| p == "https" || p == "http")
    }

    /// Exact byte size when yt-dlp knows it. `filesize_approx` is only an
    /// estimate and never counts.
    pub fn exact_size(&self) -> Option<u64> {
        self.filesize.filter(|s| *s > 0)
    }

    fn matches(&self, filter: &CustomQuality) -> bool {
        if let Some(id) = &filter.format_id {
            if &self.format_id != id {
                return false;
            }
        }
        if let Some(ext) = &filter.extension {
            if !self.ext.eq_ignore_ascii_case(ext) {
                return false;
            }
        }
        if let Some(max) = filter.max_height {
            if self.height.map_or(true, |h| h > max) {
                return false;
            }
        }
        if let Some(min) = filter.min_height {
            if self.height.map_or(true, |h| h < min) {
                return false;
            }
        }
        true
    }

    fn rank(&self) -> (bool, u32, u64) {
        (
            self.is_progressive(),
            self.height.unwrap_or(0),
            self.tbr.map_or(0, |t| (t * 1000.0) as u64),
        )
    }
}

/// Picks the format a quality preference asks for.
///
/// Best and Normal choose among progressive formats (highest and lowest
/// resolution). Custom picks the best direct format that satisfies every set
/// constraint, preferring ones with both audio and video, and fails when none
/// does.
pub fn select_format<'a>(info: &'a VideoInfo, quality: &Quality) -> Result<&'a FormatInfo, DownloadError> {
    let formats: Vec<&FormatInfo> = info
        .formats
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|f| f.is_direct())
        .collect();

    if formats.is_empty() {
        return Err(DownloadError::resolution(format!(
            "no downloadable formats for '{}'",
            info.title
        )));
    }

    let selected = match quality {
        Quality::Best => formats
            .iter()
            .filter(|f| f.is_progressive())
            .max_by_key(|f| f.rank()),
        Quality::Normal => formats
            .iter()
            .filter(|f| f.is_progressive())
            .min_by_key(|f| (f.height.unwrap_or(u32::MAX), f.rank().2)),
        Quality::Custom(filter) => formats
            .iter()
            .filter(|f| f.matches(filter))
            .max_by_key(|f| f.rank()),
    };

    let selected = selected.copied();
    if let Some(format) = selected {
        if !format.is_progressive() {
            log::warn!(
                "⚠️ [YTDLP] format {} of '{}' is {}-only",
                format.format_id,
                info.title,
                if FormatInfo::has_codec(&format.vcodec) { "video" } else { "audio" }
            );
        }
    }

    selected.ok_or_else(|| match quality {
        Quality::Custom(filter) => DownloadError::resolution(format!(
            "no format of '{}' matches the custom filter {:?}",
            info.title, filter
        )),
        _ => DownloadError::resolution(format!(
            "no progressive format available for '{}'",
            info.title
        )),
    })
}

/// Destination file name for a resolved format.
pub fn output_file_name(info: &VideoInfo, format: &FormatInfo) -> String {
    format!("{}.{}", sanitize_filename(&info.title), format.ext)
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
}

/// Turns `--flat-playlist --dump-json` output (one JSON object per line)
/// into item URLs.
pub fn parse_flat_playlist(output: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for (i, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<FlatEntry>(line) {
            Ok(entry) => {
                let url = entry
                    .webpage_url
                    .or(entry.url.filter(|u| u.starts_with("http")))
                    .or_else(|| {
                        entry
                            .id
                            .map(|id| format!("https://www.youtube.com/watch?v={}", id))
                    });
                match url {
                    Some(url) => urls.push(url),
                    None => log::warn!("⚠️ [YTDLP] playlist entry {} has no URL", i + 1),
                }
            }
            Err(e) => log::warn!("⚠️ [YTDLP] skipping unparsable playlist line {}: {}", i + 1, e),
        }
    }
    urls
}
