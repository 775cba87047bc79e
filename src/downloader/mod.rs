pub mod events;
pub mod http_pool;
pub mod manager;
pub mod progress;
pub mod task;
pub mod ytdlp_rust;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{DownloadError, FailureReason};
use progress::SpeedUnit;

pub use events::{DownloadEvent, EventBus, EventSink, EventStream, LogSink, ManagerEvent};
pub use manager::{CancelOutcome, DownloadManager, QueueSummary};
pub use progress::{ProgressSample, ProgressSampler};
pub use task::{DownloadTask, TaskSettings};

/// Stable identifier of a download task, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Which stream variant a resolver should pick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Quality {
    /// Highest available resolution.
    #[default]
    Best,
    /// Lowest available resolution.
    Normal,
    /// Best variant satisfying a user supplied filter.
    Custom(CustomQuality),
}

/// User supplied constraints for [`Quality::Custom`].
///
/// Unset fields do not constrain the selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CustomQuality {
    pub max_height: Option<u32>,
    pub min_height: Option<u32>,
    pub extension: Option<String>,
    pub format_id: Option<String>,
}

impl CustomQuality {
    pub fn is_unconstrained(&self) -> bool {
        self.max_height.is_none()
            && self.min_height.is_none()
            && self.extension.is_none()
            && self.format_id.is_none()
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Best => f.write_str("best"),
            Quality::Normal => f.write_str("normal"),
            Quality::Custom(_) => f.write_str("custom"),
        }
    }
}

/// What the caller asked to download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "url", rename_all = "snake_case")]
pub enum SourceRef {
    Item(String),
    Collection(String),
}

impl SourceRef {
    /// Classifies a URL: anything that names a playlist is a collection.
    pub fn classify(url: &str) -> Self {
        let url = url.trim();
        let is_collection = match url::Url::parse(url) {
            Ok(parsed) => {
                parsed.path().contains("playlist")
                    || (parsed.query_pairs().any(|(k, _)| k == "list")
                        && !parsed.query_pairs().any(|(k, _)| k == "v"))
            }
            Err(_) => url.contains("playlist"),
        };

        if is_collection {
            SourceRef::Collection(url.to_string())
        } else {
            SourceRef::Item(url.to_string())
        }
    }

    pub fn url(&self) -> &str {
        match self {
            SourceRef::Item(url) | SourceRef::Collection(url) => url,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, SourceRef::Collection(_))
    }
}

/// A submission to the manager. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub source: SourceRef,
    pub destination: PathBuf,
    pub quality: Quality,
}

impl DownloadRequest {
    pub fn new(source: SourceRef, destination: impl Into<PathBuf>, quality: Quality) -> Self {
        Self {
            source,
            destination: destination.into(),
            quality,
        }
    }

    pub fn from_url(url: &str, destination: impl Into<PathBuf>, quality: Quality) -> Self {
        Self::new(SourceRef::classify(url), destination, quality)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Resolving,
    Downloading,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// Sort key used when listing tasks: running work first, finished last.
    pub fn priority(self) -> u8 {
        match self {
            TaskState::Downloading => 1,
            TaskState::Resolving => 2,
            TaskState::Pending => 3,
            TaskState::Cancelling => 4,
            TaskState::Completed => 5,
            TaskState::Failed => 6,
            TaskState::Cancelled => 7,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TaskState::Pending => "pending",
            TaskState::Resolving => "resolving",
            TaskState::Downloading => "downloading",
            TaskState::Cancelling => "cancelling",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Point-in-time view of a task, safe to hand to any observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub source: String,
    pub destination: PathBuf,
    pub quality: Quality,
    pub state: TaskState,
    /// `None` until the stream has been resolved.
    pub title: Option<String>,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
    pub percent: u8,
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    pub eta_secs: Option<u64>,
    pub failure: Option<FailureReason>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Outcome of a single chunk pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes consumed by this call.
    pub consumed: u64,
    /// Bytes still to come; zero signals completion.
    pub remaining: u64,
}

/// A resolved download variant: known size, a title and chunked retrieval.
#[async_trait::async_trait]
pub trait ResolvedStream: Send {
    fn total_size(&self) -> u64;

    fn title(&self) -> &str;

    async fn next_chunk(&mut self) -> Result<Chunk, DownloadError>;
}

#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves `source` into a stream of the requested quality whose bytes
    /// end up under `destination`.
    async fn resolve(
        &self,
        source: &str,
        quality: &Quality,
        destination: &Path,
    ) -> Result<Box<dyn ResolvedStream>, DownloadError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CollectionExpander: Send + Sync {
    /// Expands a collection into its ordered item references.
    async fn expand(&self, collection: &str) -> Result<Vec<String>, DownloadError>;
}
