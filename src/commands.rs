use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::ytdlp_rust::YtDlpExtractor;
use crate::downloader::{
    CustomQuality, DownloadEvent, DownloadManager, DownloadRequest, EventSink, LogSink,
    ManagerEvent, Quality, QueueSummary, TaskId,
};
use crate::errors::{AppError, Result};
use crate::security::InputValidator;
use crate::utils::ensure_dir_exists;

const INITIALIZING: &str = "Initializing...";
const MAX_LABEL: usize = 40;

/// Everything the `download` command needs besides the config.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub urls: Vec<String>,
    pub quality: Option<Quality>,
    pub output: Option<PathBuf>,
    pub json: bool,
}

/// Outcome of a `download` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub summary: QueueSummary,
    /// URLs that never produced a task: invalid input or failed expansion.
    pub rejected: usize,
    pub interrupted: bool,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        !self.interrupted
            && self.rejected == 0
            && self.summary.failed == 0
            && self.summary.cancelled == 0
    }
}

/// Turns the `-q` preset and the custom filter flags into a [`Quality`].
///
/// Filter flags without a preset imply `custom`; no flags at all keep the
/// configured default.
pub fn resolve_quality(
    preset: Option<&str>,
    filter: CustomQuality,
    default: &Quality,
) -> Result<Quality> {
    match preset.map(str::to_ascii_lowercase).as_deref() {
        Some("best") => Ok(Quality::Best),
        Some("normal") => Ok(Quality::Normal),
        Some("custom") => {
            if filter.is_unconstrained() {
                return Err(AppError::Validation(
                    "custom quality needs at least one of --max-height, --min-height, --ext, --format-id"
                        .to_string(),
                ));
            }
            Ok(Quality::Custom(filter))
        }
        Some(other) => Err(AppError::Validation(format!(
            "Unknown quality '{}'. Use best, normal or custom",
            other
        ))),
        None if !filter.is_unconstrained() => Ok(Quality::Custom(filter)),
        None => Ok(default.clone()),
    }
}

/// Downloads every URL concurrently until all tasks finish or Ctrl-C is
/// pressed.
pub async fn download(config: &AppConfig, options: DownloadOptions) -> Result<DownloadReport> {
    let validator = InputValidator::new();
    let destination = options
        .output
        .clone()
        .unwrap_or_else(|| config.download_path.clone());
    validator.validate_download_path(&destination)?;
    ensure_dir_exists(&destination).await?;

    let quality = options
        .quality
        .clone()
        .unwrap_or_else(|| config.preferred_quality.clone());

    let http_pool = Arc::new(HttpPool::from_config(config)?);
    let extractor =
        Arc::new(YtDlpExtractor::new(http_pool).with_ytdlp_path(config.ytdlp_path.clone()));
    let manager = DownloadManager::new(extractor.clone(), extractor, config.task_settings());

    let console = if options.json {
        None
    } else {
        Some(Arc::new(ConsoleSink::new()))
    };
    let sink: Arc<dyn EventSink> = match &console {
        Some(console) => console.clone() as Arc<dyn EventSink>,
        None => Arc::new(JsonSink::new(std::io::stdout())),
    };
    let forwarders = vec![
        manager.attach_sink(sink),
        manager.attach_sink(Arc::new(LogSink)),
    ];

    log::info!(
        "🚀 [MANAGER] {} URL(s), quality {}, into {:?}",
        options.urls.len(),
        quality,
        destination
    );

    let mut report = DownloadReport::default();
    for url in &options.urls {
        if let Err(e) = validator.validate_url(url) {
            log::error!("❌ [MANAGER] rejected {}: {}", url, e);
            if let Some(console) = &console {
                console.note(&format!("✗ {}: {}", url, e));
            }
            report.rejected += 1;
            continue;
        }

        let request = DownloadRequest::from_url(url.trim(), destination.clone(), quality.clone());
        match manager.try_submit(request).await {
            Ok(ids) => {
                if let Some(console) = &console {
                    for id in &ids {
                        console.track(*id, url);
                    }
                }
            }
            // Already published as ExpansionFailed.
            Err(_) => report.rejected += 1,
        }
    }

    tokio::select! {
        results = manager.wait_all() => {
            log::info!("🏁 [MANAGER] {} task(s) finished", results.len());
        }
        _ = tokio::signal::ctrl_c() => {
            log::warn!("⚠️ [MANAGER] interrupted, cancelling downloads");
            report.interrupted = true;
            manager.shutdown().await;
        }
    }

    report.summary = manager.summary();
    drop(manager);
    for forwarder in forwarders {
        let _ = forwarder.await;
    }

    if options.json {
        print_json_line(&mut std::io::stdout(), &serde_json::json!({ "summary": &report }));
    } else {
        print_summary(&report);
    }
    Ok(report)
}

fn print_summary(report: &DownloadReport) {
    println!();
    println!("{}", summary_line(&report.summary));
    if report.rejected > 0 {
        println!("Rejected sources: {}", report.rejected);
    }
}

fn summary_line(summary: &QueueSummary) -> String {
    format!(
        "Downloads: {} completed, {} failed, {} cancelled ({} of {})",
        summary.completed,
        summary.failed,
        summary.cancelled,
        HumanBytes(summary.bytes_downloaded),
        HumanBytes(summary.bytes_total)
    )
}

pub fn show_config(config: &AppConfig) -> Result<String> {
    Ok(serde_json::to_string_pretty(config)?)
}

/// Returns a copy of `config` with the dotted `key` set to `raw`.
///
/// `raw` is read as JSON when it parses and as a plain string otherwise, so
/// `network.chunk_timeout_secs 30` and `ytdlp_path /opt/yt-dlp` both work.
/// Tagged fields such as `preferred_quality` also accept a bare kind.
pub fn set_config_value(config: &AppConfig, key: &str, raw: &str) -> Result<AppConfig> {
    let mut root = serde_json::to_value(config)?;
    let mut slot = &mut root;
    for part in key.split('.') {
        slot = slot
            .as_object_mut()
            .and_then(|fields| fields.get_mut(part))
            .ok_or_else(|| AppError::NotFound(format!("Unknown config key: {}", key)))?;
    }

    let value =
        serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    *slot = match (&*slot, value) {
        (Value::Object(current), Value::String(kind)) if current.contains_key("kind") => {
            serde_json::json!({ "kind": kind })
        }
        (_, value) => value,
    };

    serde_json::from_value(root)
        .map_err(|e| AppError::Validation(format!("Invalid value for {}: {}", key, e)))
}

fn print_json_line<W: Write, T: Serialize>(out: &mut W, value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => {
            if let Err(e) = writeln!(out, "{}", line) {
                log::warn!("⚠️ failed to write event: {}", e);
            }
        }
        Err(e) => log::warn!("⚠️ failed to serialize event: {}", e),
    }
}

/// Prints every event as one JSON object per line.
pub struct JsonSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonSink<W> {
    fn on_event(&self, event: &ManagerEvent) {
        print_json_line(&mut *self.out.lock(), event);
    }
}

/// One progress row per task, drawn with indicatif.
pub struct ConsoleSink {
    progress: MultiProgress,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    pub fn with_draw_target(target: ProgressDrawTarget) -> Self {
        Self {
            progress: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:40} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━━╌")
    }

    fn format_label(raw: &str) -> String {
        if raw.chars().count() <= MAX_LABEL {
            return raw.to_string();
        }
        let mut label: String = raw.chars().take(MAX_LABEL - 1).collect();
        label.push('…');
        label
    }

    /// Adds an "Initializing..." row for `id` unless it already has one.
    pub fn track(&self, id: TaskId, label: &str) -> ProgressBar {
        let mut bars = self.bars.lock();
        if let Some(bar) = bars.get(&id) {
            return bar.clone();
        }
        let bar = self.progress.add(ProgressBar::new(100));
        bar.set_style(Self::bar_style());
        bar.set_prefix(Self::format_label(label));
        bar.set_message(INITIALIZING);
        bars.insert(id, bar.clone());
        bar
    }

    pub fn bar(&self, id: TaskId) -> Option<ProgressBar> {
        self.bars.lock().get(&id).cloned()
    }

    /// Prints a line above the progress rows.
    pub fn note(&self, line: &str) {
        if self.progress.println(line).is_err() {
            log::warn!("⚠️ {}", line);
        }
    }
}

impl EventSink for ConsoleSink {
    fn on_event(&self, event: &ManagerEvent) {
        match event {
            ManagerEvent::Task { task_id, event } => {
                // Events can outrun `track` for a freshly submitted task.
                let bar = self.track(*task_id, &task_id.to_string());
                match event {
                    DownloadEvent::Progress { percent } => bar.set_position(u64::from(*percent)),
                    DownloadEvent::Speed { value, unit } => bar.set_message(unit.format(*value)),
                    DownloadEvent::Completed { title } => {
                        bar.set_prefix(Self::format_label(title));
                        bar.set_position(100);
                        bar.finish_with_message("✓ done");
                    }
                    DownloadEvent::Failed { reason, message } => {
                        bar.abandon_with_message(format!("✗ {}: {}", reason, message));
                    }
                }
            }
            ManagerEvent::ExpansionFailed { source, message } => {
                self.note(&format!("✗ {}: {}", source, message));
            }
        }
    }
}
