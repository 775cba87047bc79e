use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::downloader::events::{EventBus, EventSink, EventStream, ManagerEvent};
use crate::downloader::task::{DownloadTask, TaskSettings};
use crate::downloader::{
    CollectionExpander, DownloadRequest, Resolver, SourceRef, TaskId, TaskSnapshot, TaskState,
};
use crate::errors::DownloadError;

/// What happened to a cancellation request for a known task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    AlreadyFinished,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

impl QueueSummary {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// Combined progress over every task whose size is known.
    pub fn overall_percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return 0;
        }
        (self.bytes_downloaded.min(self.bytes_total) as u128 * 100 / self.bytes_total as u128) as u8
    }
}

struct TaskEntry {
    task: Arc<DownloadTask>,
    done: watch::Receiver<Option<TaskState>>,
    handle: Mutex<Option<JoinHandle<TaskState>>>,
}

/// Runs every submitted item as its own tokio task and multiplexes their
/// events.
///
/// The registry keeps every task, finished or not, for the lifetime of the
/// manager so that ids stay valid for status queries.
pub struct DownloadManager {
    resolver: Arc<dyn Resolver>,
    expander: Arc<dyn CollectionExpander>,
    tasks: Arc<RwLock<HashMap<TaskId, Arc<TaskEntry>>>>,
    events: EventBus,
    settings: TaskSettings,
}

impl DownloadManager {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        expander: Arc<dyn CollectionExpander>,
        settings: TaskSettings,
    ) -> Self {
        Self {
            resolver,
            expander,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            events: EventBus::new(),
            settings,
        }
    }

    /// Subscribes to all events published from now on.
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Forwards the event stream to `sink` until the manager and all of its
    /// tasks are gone.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let mut stream = self.events.subscribe();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                sink.on_event(&event);
            }
        })
    }

    /// Submits a request and returns the ids of the tasks it produced.
    ///
    /// A collection that cannot be expanded yields no ids; the failure is
    /// published once as [`ManagerEvent::ExpansionFailed`].
    pub async fn submit(&self, request: DownloadRequest) -> Vec<TaskId> {
        self.try_submit(request).await.unwrap_or_default()
    }

    /// Like [`submit`](Self::submit) but also hands the expansion error back.
    pub async fn try_submit(&self, request: DownloadRequest) -> Result<Vec<TaskId>, DownloadError> {
        let sources = match &request.source {
            SourceRef::Item(url) => vec![url.clone()],
            SourceRef::Collection(url) => {
                log::info!("📃 [MANAGER] expanding collection {}", url);
                match self.expander.expand(url).await {
                    Ok(items) => {
                        log::info!("📃 [MANAGER] collection {} has {} item(s)", url, items.len());
                        items
                    }
                    Err(e) => {
                        log::error!("❌ [MANAGER] failed to expand {}: {}", url, e);
                        self.events.publish(ManagerEvent::ExpansionFailed {
                            source: url.clone(),
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
        };

        Ok(sources
            .into_iter()
            .map(|source| self.spawn_task(source, &request))
            .collect())
    }

    fn spawn_task(&self, source: String, request: &DownloadRequest) -> TaskId {
        let id = TaskId::new();
        let task = Arc::new(DownloadTask::new(
            id,
            source,
            request.destination.clone(),
            request.quality.clone(),
            self.settings.clone(),
        ));
        let (done_tx, done_rx) = watch::channel(None);
        let entry = Arc::new(TaskEntry {
            task: task.clone(),
            done: done_rx,
            handle: Mutex::new(None),
        });

        // Registered before it runs so cancel/status never miss a fresh id.
        self.tasks.write().insert(id, entry.clone());

        let resolver = self.resolver.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let state = task.start(resolver.as_ref(), &events).await;
            let _ = done_tx.send(Some(state));
            state
        });
        *entry.handle.lock() = Some(handle);

        log::debug!("[MANAGER] scheduled task {}", id);
        id
    }

    fn entry(&self, id: TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.read().get(&id).cloned()
    }

    /// Requests cancellation; `false` for unknown ids and finished tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        matches!(self.try_cancel(id), Ok(CancelOutcome::Requested))
    }

    pub fn try_cancel(&self, id: TaskId) -> Result<CancelOutcome, DownloadError> {
        let entry = self.entry(id).ok_or_else(|| {
            log::warn!("⚠️ [MANAGER] cancel for unknown task {}", id);
            DownloadError::Lookup(id)
        })?;

        if entry.task.cancel() {
            Ok(CancelOutcome::Requested)
        } else {
            Ok(CancelOutcome::AlreadyFinished)
        }
    }

    /// Requests cancellation of every unfinished task, returning how many
    /// were still running.
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        entries.iter().filter(|entry| entry.task.cancel()).count()
    }

    pub fn status(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.entry(id).map(|entry| entry.task.snapshot())
    }

    /// All tasks, running ones first, then by submission time.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .read()
            .values()
            .map(|entry| entry.task.snapshot())
            .collect();

        snapshots.sort_by(|a, b| {
            a.state
                .priority()
                .cmp(&b.state.priority())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        snapshots
    }

    pub fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary::default();
        for snapshot in self.tasks() {
            summary.total += 1;
            summary.bytes_downloaded += snapshot.bytes_downloaded;
            summary.bytes_total += snapshot.bytes_total;
            match snapshot.state {
                TaskState::Pending => summary.pending += 1,
                TaskState::Resolving | TaskState::Downloading | TaskState::Cancelling => {
                    summary.active += 1
                }
                TaskState::Completed => summary.completed += 1,
                TaskState::Failed => summary.failed += 1,
                TaskState::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Waits for one task to reach a terminal state.
    pub async fn wait(&self, id: TaskId) -> Option<TaskState> {
        let entry = self.entry(id)?;
        let mut done = entry.done.clone();
        if let Ok(state) = done.wait_for(|state| state.is_some()).await {
            if let Some(state) = *state {
                return Some(state);
            }
        }
        Some(entry.task.state())
    }

    /// Waits until every task registered so far has finished.
    pub async fn wait_all(&self) -> Vec<(TaskId, TaskState)> {
        let ids: Vec<TaskId> = self.tasks.read().keys().copied().collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = self.wait(id).await {
                results.push((id, state));
            }
        }
        results
    }

    /// Drops join handles of tasks that already finished.
    pub fn reap(&self) -> usize {
        let mut reaped = 0;
        for entry in self.tasks.read().values() {
            let mut handle = entry.handle.lock();
            if handle.as_ref().is_some_and(|h| h.is_finished()) {
                handle.take();
                reaped += 1;
            }
        }
        reaped
    }

    /// Cancels everything and joins every spawned task.
    pub async fn shutdown(&self) {
        let cancelled = self.cancel_all();
        log::info!("🛑 [MANAGER] shutting down, {} task(s) cancelled", cancelled);

        let handles: Vec<JoinHandle<TaskState>> = self
            .tasks
            .read()
            .values()
            .filter_map(|entry| entry.handle.lock().take())
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("❌ [MANAGER] download task panicked: {}", e);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|entry| !entry.task.state().is_terminal())
            .count()
    }
}
