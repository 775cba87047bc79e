use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{DownloadEvent, EventBus};
use super::progress::{ProgressSampler, SpeedUnit};
use super::{Quality, ResolvedStream, Resolver, TaskId, TaskSnapshot, TaskState};
use crate::errors::DownloadError;

/// Per-task knobs handed down by the manager.
#[derive(Debug, Clone, Default)]
pub struct TaskSettings {
    pub speed_unit: SpeedUnit,
    /// Upper bound for resolving the stream.
    pub resolve_timeout: Option<Duration>,
    /// Upper bound for a single chunk pull; a stalled transfer fails after this.
    pub chunk_timeout: Option<Duration>,
}

/// One independently cancellable download of a single item.
///
/// The snapshot is written by the task's own execution context; the only
/// outside write is the `Cancelling` mark set by [`DownloadTask::cancel`].
pub struct DownloadTask {
    id: TaskId,
    source: String,
    destination: PathBuf,
    quality: Quality,
    settings: TaskSettings,
    snapshot: RwLock<TaskSnapshot>,
    cancel: CancellationToken,
}

impl DownloadTask {
    pub fn new(
        id: TaskId,
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        quality: Quality,
        settings: TaskSettings,
    ) -> Self {
        let source = source.into();
        let destination = destination.into();
        let snapshot = TaskSnapshot {
            id,
            source: source.clone(),
            destination: destination.clone(),
            quality: quality.clone(),
            state: TaskState::Pending,
            title: None,
            bytes_total: 0,
            bytes_downloaded: 0,
            percent: 0,
            speed: 0.0,
            speed_unit: settings.speed_unit,
            eta_secs: None,
            failure: None,
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        };

        Self {
            id,
            source,
            destination,
            quality,
            settings,
            snapshot: RwLock::new(snapshot),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn state(&self) -> TaskState {
        self.snapshot.read().state
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.snapshot.read().clone()
    }

    /// Requests cooperative cancellation.
    ///
    /// Returns `false` when the task already reached a terminal state, in
    /// which case nothing changes. The running loop notices the request at
    /// the next chunk boundary.
    pub fn cancel(&self) -> bool {
        let mut snapshot = self.snapshot.write();
        if snapshot.state.is_terminal() {
            return false;
        }
        snapshot.state = TaskState::Cancelling;
        self.cancel.cancel();
        log::info!("🛑 [TASK {}] cancellation requested", self.id);
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs the whole lifecycle and returns the terminal state reached.
    pub async fn start(&self, resolver: &dyn Resolver, events: &EventBus) -> TaskState {
        if !self.enter(TaskState::Resolving) {
            return self.finish_cancelled();
        }
        log::info!("🔍 [TASK {}] resolving {} ({})", self.id, self.source, self.quality);

        let resolved = self.resolve(resolver).await;
        if self.is_cancel_requested() {
            return self.finish_cancelled();
        }
        let mut stream = match resolved {
            Ok(stream) => stream,
            Err(e) => return self.fail(events, e),
        };

        let total = stream.total_size();
        let sampler = match ProgressSampler::for_total(total, self.settings.speed_unit) {
            Some(sampler) => sampler,
            None => {
                return self.fail(
                    events,
                    DownloadError::resolution("resolved stream reports a size of zero"),
                )
            }
        };
        let title = stream.title().to_string();

        let started = Instant::now();
        {
            let mut snapshot = self.snapshot.write();
            if snapshot.state != TaskState::Resolving {
                drop(snapshot);
                return self.finish_cancelled();
            }
            snapshot.state = TaskState::Downloading;
            snapshot.title = Some(title.clone());
            snapshot.bytes_total = total;
            snapshot.started_at = Some(chrono::Utc::now());
        }
        log::info!("⬇️ [TASK {}] downloading '{}' ({} bytes)", self.id, title, total);

        let mut downloaded = 0u64;
        loop {
            let pulled = self.pull(stream.as_mut()).await;
            // Chunk boundary: the only place cancellation is observed.
            if self.is_cancel_requested() {
                return self.finish_cancelled();
            }
            let chunk = match pulled {
                Ok(chunk) => chunk,
                Err(e) => return self.fail(events, e),
            };

            downloaded = downloaded.max(total.saturating_sub(chunk.remaining));
            let sample = sampler.sample(downloaded, started.elapsed());
            {
                let mut snapshot = self.snapshot.write();
                snapshot.bytes_downloaded = downloaded;
                snapshot.percent = sample.percent;
                snapshot.speed = sample.speed;
                snapshot.eta_secs = sample.eta.map(|eta| eta.as_secs());
            }

            events.emit(self.id, DownloadEvent::Progress { percent: sample.percent });
            events.emit(
                self.id,
                DownloadEvent::Speed {
                    value: sample.speed,
                    unit: sampler.unit(),
                },
            );

            if chunk.remaining == 0 {
                return self.complete(events, title);
            }
        }
    }

    async fn resolve(
        &self,
        resolver: &dyn Resolver,
    ) -> Result<Box<dyn ResolvedStream>, DownloadError> {
        let resolving = resolver.resolve(&self.source, &self.quality, &self.destination);
        match self.settings.resolve_timeout {
            Some(limit) => match tokio::time::timeout(limit, resolving).await {
                Ok(result) => result,
                Err(_) => Err(DownloadError::resolution(format!(
                    "no stream resolved within {}s",
                    limit.as_secs_f64()
                ))),
            },
            None => resolving.await,
        }
    }

    async fn pull(&self, stream: &mut dyn ResolvedStream) -> Result<super::Chunk, DownloadError> {
        match self.settings.chunk_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next_chunk()).await {
                Ok(result) => result,
                Err(_) => Err(DownloadError::transfer(format!(
                    "transfer stalled for {}s",
                    limit.as_secs_f64()
                ))),
            },
            None => stream.next_chunk().await,
        }
    }

    /// Moves to a non-terminal state unless cancellation got there first.
    fn enter(&self, next: TaskState) -> bool {
        let mut snapshot = self.snapshot.write();
        if snapshot.state == TaskState::Cancelling || snapshot.state.is_terminal() {
            return false;
        }
        snapshot.state = next;
        true
    }

    fn complete(&self, events: &EventBus, title: String) -> TaskState {
        {
            let mut snapshot = self.snapshot.write();
            if snapshot.state == TaskState::Cancelling {
                drop(snapshot);
                return self.finish_cancelled();
            }
            snapshot.state = TaskState::Completed;
            snapshot.eta_secs = Some(0);
            snapshot.finished_at = Some(chrono::Utc::now());
        }
        log::info!("✅ [TASK {}] completed '{}'", self.id, title);
        events.emit(self.id, DownloadEvent::Completed { title });
        TaskState::Completed
    }

    fn fail(&self, events: &EventBus, error: DownloadError) -> TaskState {
        {
            let mut snapshot = self.snapshot.write();
            if snapshot.state == TaskState::Cancelling {
                drop(snapshot);
                return self.finish_cancelled();
            }
            snapshot.state = TaskState::Failed;
            snapshot.failure = Some(error.reason());
            snapshot.error = Some(error.to_string());
            snapshot.finished_at = Some(chrono::Utc::now());
        }
        log::error!("❌ [TASK {}] {}", self.id, error);
        events.emit(
            self.id,
            DownloadEvent::Failed {
                reason: error.reason(),
                message: error.to_string(),
            },
        );
        TaskState::Failed
    }

    fn finish_cancelled(&self) -> TaskState {
        let mut snapshot = self.snapshot.write();
        if !snapshot.state.is_terminal() {
            snapshot.state = TaskState::Cancelled;
            snapshot.eta_secs = None;
            snapshot.finished_at = Some(chrono::Utc::now());
            log::info!("🛑 [TASK {}] cancelled", self.id);
        }
        snapshot.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{Chunk, EventStream, ManagerEvent};
    use crate::errors::FailureReason;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Notify;

    struct ScriptedStream {
        total: u64,
        title: String,
        steps: VecDeque<Result<Chunk, DownloadError>>,
        gate: Option<(usize, Arc<Notify>)>,
        pulls: usize,
    }

    #[async_trait::async_trait]
    impl ResolvedStream for ScriptedStream {
        fn total_size(&self) -> u64 {
            self.total
        }

        fn title(&self) -> &str {
            &self.title
        }

        async fn next_chunk(&mut self) -> Result<Chunk, DownloadError> {
            self.pulls += 1;
            if let Some((at, gate)) = &self.gate {
                if *at == self.pulls {
                    gate.notified().await;
                }
            }
            self.steps
                .pop_front()
                .unwrap_or_else(|| Err(DownloadError::transfer("script exhausted")))
        }
    }

    struct OneShotResolver {
        stream: parking_lot::Mutex<Option<Result<ScriptedStream, DownloadError>>>,
    }

    impl OneShotResolver {
        fn new(stream: Result<ScriptedStream, DownloadError>) -> Self {
            Self {
                stream: parking_lot::Mutex::new(Some(stream)),
            }
        }
    }

    #[async_trait::async_trait]
    impl Resolver for OneShotResolver {
        async fn resolve(
            &self,
            _source: &str,
            _quality: &Quality,
            _destination: &Path,
        ) -> Result<Box<dyn ResolvedStream>, DownloadError> {
            let stream = self
                .stream
                .lock()
                .take()
                .unwrap_or_else(|| Err(DownloadError::resolution("already resolved")))?;
            Ok(Box::new(stream))
        }
    }

    fn scripted(total: u64, remaining: &[u64]) -> ScriptedStream {
        let mut last = total;
        let steps = remaining
            .iter()
            .map(|&r| {
                let consumed = last - r;
                last = r;
                Ok(Chunk { consumed, remaining: r })
            })
            .collect();
        ScriptedStream {
            total,
            title: "Sample Video".to_string(),
            steps,
            gate: None,
            pulls: 0,
        }
    }

    fn task() -> DownloadTask {
        DownloadTask::new(
            TaskId::new(),
            "https://www.youtube.com/watch?v=abc",
            "/tmp/downloads",
            Quality::Best,
            TaskSettings::default(),
        )
    }

    fn drain(stream: &mut EventStream) -> Vec<DownloadEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.try_recv() {
            if let ManagerEvent::Task { event, .. } = event {
                events.push(event);
            }
        }
        events
    }

    fn percents(events: &[DownloadEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Progress { percent } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn completes_with_progress_then_title() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let task = task();
        let resolver = OneShotResolver::new(Ok(scripted(1000, &[700, 300, 0])));

        let state = task.start(&resolver, &bus).await;

        assert_eq!(state, TaskState::Completed);
        let events = drain(&mut events);
        assert_eq!(percents(&events), vec![30, 70, 100]);
        assert_eq!(
            events.last(),
            Some(&DownloadEvent::Completed { title: "Sample Video".to_string() })
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let snapshot = task.snapshot();
        assert_eq!(snapshot.bytes_downloaded, 1000);
        assert_eq!(snapshot.percent, 100);
        assert_eq!(snapshot.title.as_deref(), Some("Sample Video"));
        assert!(snapshot.finished_at.is_some());
    }

    #[tokio::test]
    async fn every_progress_is_followed_by_speed() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let resolver = OneShotResolver::new(Ok(scripted(10, &[5, 0])));

        task().start(&resolver, &bus).await;

        let events = drain(&mut events);
        assert!(matches!(events[0], DownloadEvent::Progress { percent: 50 }));
        assert!(matches!(
            events[1],
            DownloadEvent::Speed { unit: SpeedUnit::KilobytesPerSecond, .. }
        ));
        assert!(matches!(events[2], DownloadEvent::Progress { percent: 100 }));
        assert!(matches!(events[3], DownloadEvent::Speed { .. }));
    }

    #[tokio::test]
    async fn resolution_failure_emits_single_failed_event() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let task = task();
        let resolver = OneShotResolver::new(Err(DownloadError::resolution("video unavailable")));

        assert_eq!(task.start(&resolver, &bus).await, TaskState::Failed);

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            DownloadEvent::Failed { reason: FailureReason::ResolutionError, .. }
        ));
        assert_eq!(task.snapshot().failure, Some(FailureReason::ResolutionError));
        assert_eq!(task.snapshot().title, None);
    }

    #[tokio::test]
    async fn zero_size_stream_is_a_resolution_failure() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let resolver = OneShotResolver::new(Ok(scripted(0, &[])));

        assert_eq!(task().start(&resolver, &bus).await, TaskState::Failed);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [DownloadEvent::Failed { reason: FailureReason::ResolutionError, .. }]
        ));
    }

    #[tokio::test]
    async fn transfer_failure_stops_the_stream() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let mut stream = scripted(1000, &[600]);
        stream.steps.push_back(Err(DownloadError::transfer("connection reset")));
        stream.steps.push_back(Ok(Chunk { consumed: 600, remaining: 0 }));
        let resolver = OneShotResolver::new(Ok(stream));

        assert_eq!(task().start(&resolver, &bus).await, TaskState::Failed);

        let events = drain(&mut events);
        assert_eq!(percents(&events), vec![40]);
        assert!(matches!(
            events.last(),
            Some(DownloadEvent::Failed { reason: FailureReason::TransferError, .. })
        ));
        assert!(!events.iter().any(|e| matches!(e, DownloadEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn cancel_before_start_never_resolves() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let task = task();
        let resolver = OneShotResolver::new(Ok(scripted(10, &[0])));

        assert!(task.cancel());
        assert_eq!(task.state(), TaskState::Cancelling);
        assert_eq!(task.start(&resolver, &bus).await, TaskState::Cancelled);
        assert!(drain(&mut events).is_empty());
    }

    /// Signals `entered` once resolution starts, then holds until `release`.
    struct BlockedResolver {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        inner: OneShotResolver,
    }

    #[async_trait::async_trait]
    impl Resolver for BlockedResolver {
        async fn resolve(
            &self,
            source: &str,
            quality: &Quality,
            destination: &Path,
        ) -> Result<Box<dyn ResolvedStream>, DownloadError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.resolve(source, quality, destination).await
        }
    }

    async fn cancel_while_resolving(outcome: Result<ScriptedStream, DownloadError>) {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let task = Arc::new(task());
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let resolver = Arc::new(BlockedResolver {
            entered: entered.clone(),
            release: release.clone(),
            inner: OneShotResolver::new(outcome),
        });

        let runner = {
            let task = task.clone();
            let bus = bus.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move { task.start(resolver.as_ref(), &bus).await })
        };

        entered.notified().await;
        assert_eq!(task.state(), TaskState::Resolving);
        assert!(task.cancel());
        release.notify_one();

        assert_eq!(runner.await.unwrap(), TaskState::Cancelled);
        let events = drain(&mut events);
        assert!(percents(&events).is_empty());
        assert!(!events.iter().any(DownloadEvent::is_terminal));
        assert_eq!(task.snapshot().failure, None);
        assert!(task.snapshot().finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_during_resolution_wins_over_a_resolved_stream() {
        cancel_while_resolving(Ok(scripted(1000, &[700, 300, 0]))).await;
    }

    #[tokio::test]
    async fn cancel_during_resolution_wins_over_a_resolution_error() {
        cancel_while_resolving(Err(DownloadError::resolution("video unavailable"))).await;
    }

    #[tokio::test]
    async fn cancel_at_chunk_boundary_suppresses_further_events() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let task = Arc::new(task());
        let gate = Arc::new(Notify::new());
        let mut stream = scripted(1000, &[700, 300, 0]);
        stream.gate = Some((2, gate.clone()));
        let resolver = Arc::new(OneShotResolver::new(Ok(stream)));

        let runner = {
            let task = task.clone();
            let bus = bus.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move { task.start(resolver.as_ref(), &bus).await })
        };

        match events.recv().await {
            Some(ManagerEvent::Task { event: DownloadEvent::Progress { percent }, .. }) => {
                assert_eq!(percent, 30)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(task.cancel());
        gate.notify_one();

        assert_eq!(runner.await.unwrap(), TaskState::Cancelled);
        let rest = drain(&mut events);
        assert!(percents(&rest).is_empty());
        assert!(!rest.iter().any(DownloadEvent::is_terminal));
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_noop() {
        let bus = EventBus::new();
        let task = task();
        let resolver = OneShotResolver::new(Ok(scripted(10, &[0])));

        assert_eq!(task.start(&resolver, &bus).await, TaskState::Completed);
        assert!(!task.cancel());
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_chunk_times_out_as_transfer_error() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let task = DownloadTask::new(
            TaskId::new(),
            "https://www.youtube.com/watch?v=abc",
            "/tmp/downloads",
            Quality::Normal,
            TaskSettings {
                chunk_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        );
        let mut stream = scripted(100, &[50, 0]);
        // Never released: the second pull stalls forever.
        stream.gate = Some((2, Arc::new(Notify::new())));
        let resolver = OneShotResolver::new(Ok(stream));

        assert_eq!(task.start(&resolver, &bus).await, TaskState::Failed);
        assert!(matches!(
            drain(&mut events).last(),
            Some(DownloadEvent::Failed { reason: FailureReason::TransferError, .. })
        ));
    }
}
