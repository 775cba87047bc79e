//! Event contract between running downloads and whoever observes them.
//!
//! Each task publishes onto a shared [`EventBus`]; every subscriber gets its
//! own unbounded queue, so a slow observer never stalls a download and no
//! event is dropped. A task publishes sequentially, which keeps per-task
//! ordering intact on every subscriber.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::progress::SpeedUnit;
use super::TaskId;
use crate::errors::FailureReason;

/// Something a single task reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress { percent: u8 },
    Speed { value: f64, unit: SpeedUnit },
    Completed { title: String },
    Failed { reason: FailureReason, message: String },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. })
    }
}

/// What subscribers receive: task events tagged with their id, plus
/// submission-level reports that have no task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ManagerEvent {
    Task { task_id: TaskId, event: DownloadEvent },
    ExpansionFailed { source: String, message: String },
}

/// Consumer of the event stream (console, log, test recorder).
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ManagerEvent);
}

/// Fan-out of manager events to every live subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ManagerEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only events published after this call are delivered.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream { rx }
    }

    pub fn publish(&self, event: ManagerEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn emit(&self, task_id: TaskId, event: DownloadEvent) {
        self.publish(ManagerEvent::Task { task_id, event });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Lazily consumed sequence of manager events.
///
/// Ends once every publisher (the manager and all of its tasks) is gone.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ManagerEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ManagerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ManagerEvent> {
        self.rx.try_recv().ok()
    }
}

impl futures::Stream for EventStream {
    type Item = ManagerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: &ManagerEvent) {
        match event {
            ManagerEvent::Task { task_id, event } => match event {
                DownloadEvent::Progress { percent } => {
                    log::debug!("[TASK {}] progress {}%", task_id, percent)
                }
                DownloadEvent::Speed { value, unit } => {
                    log::debug!("[TASK {}] speed {}", task_id, unit.format(*value))
                }
                DownloadEvent::Completed { title } => {
                    log::info!("✅ [TASK {}] completed: {}", task_id, title)
                }
                DownloadEvent::Failed { reason, message } => {
                    log::error!("❌ [TASK {}] failed ({}): {}", task_id, reason, message)
                }
            },
            ManagerEvent::ExpansionFailed { source, message } => {
                log::error!("❌ [MANAGER] could not expand {}: {}", source, message)
            }
        }
    }
}
