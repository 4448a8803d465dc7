//! Job orchestration: strategy fallback, background execution and completion
//! delivery.
//!
//! [`TrimPipeline`] runs the strategies of one request in [`Strategy::ORDER`]
//! and never returns an error: every failure ends up as an empty result.
//! [`TrimCoordinator`] wraps it in a background job whose outcome is posted
//! through the [`UiDispatcher`] exactly once.

use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::model::{JobStatus, TrimRequest};
use crate::engine::{ContainerTrimmer, EngineOptions, IdentityCopier, Strategy, StreamCopyTrimmer};
use crate::error::{ErrorKind, TrimError, TrimResult};
use crate::ports::SourceResolver;
use crate::runtime::{TaskExecutor, UiDispatcher};

/// Result of one strategy attempt
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub strategy: Strategy,
    pub succeeded: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub elapsed: Duration,
}

/// Everything a pipeline run produced
#[derive(Debug, Clone, Default)]
pub struct TrimOutcome {
    /// Destination on success
    pub result: Option<PathBuf>,
    /// Strategy that produced the result
    pub strategy: Option<Strategy>,
    pub attempts: Vec<AttemptReport>,
}

impl TrimOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    /// Error of the last attempt, which is the job's failure reason
    pub fn final_error(&self) -> Option<&str> {
        self.attempts.last().and_then(|a| a.error.as_deref())
    }
}

/// Tries each strategy in order until one produces the destination
pub struct TrimPipeline {
    resolver: Arc<dyn SourceResolver>,
    options: EngineOptions,
}

impl TrimPipeline {
    pub fn new(resolver: Arc<dyn SourceResolver>, options: EngineOptions) -> Self {
        Self { resolver, options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run `request` to completion on the calling thread
    pub fn run(&self, request: &TrimRequest) -> TrimOutcome {
        let destination = request.destination.as_path();
        info!(
            "Trimming {} [{}] -> {}",
            request.source.locator(),
            request.range,
            destination.display()
        );

        let mut outcome = TrimOutcome::default();
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Cannot create {}: {}", parent.display(), e);
                return outcome;
            }
        }

        let last = Strategy::ORDER.len() - 1;
        for (position, strategy) in Strategy::ORDER.into_iter().enumerate() {
            if !self.is_applicable(strategy, request) {
                debug!("Skipping {}", strategy);
                continue;
            }

            let started = Instant::now();
            let result = remove_destination(destination)
                .map_err(|e| (e.to_string(), Some(ErrorKind::Io)))
                .and_then(|()| self.attempt_guarded(strategy, request))
                .and_then(|()| verify_destination(destination));
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    info!("{} succeeded in {:.2?}", strategy, elapsed);
                    outcome.attempts.push(AttemptReport {
                        strategy,
                        succeeded: true,
                        error: None,
                        error_kind: None,
                        elapsed,
                    });
                    outcome.result = Some(destination.to_path_buf());
                    outcome.strategy = Some(strategy);
                    return outcome;
                }
                Err((message, kind)) => {
                    if position == last {
                        error!("{} failed after {:.2?}: {}", strategy, elapsed, message);
                    } else {
                        warn!("{} failed after {:.2?}, falling back: {}", strategy, elapsed, message);
                    }
                    outcome.attempts.push(AttemptReport {
                        strategy,
                        succeeded: false,
                        error: Some(message),
                        error_kind: kind,
                        elapsed,
                    });
                }
            }
        }

        if let Err(e) = remove_destination(destination) {
            warn!("Could not remove partial output {}: {}", destination.display(), e);
        }
        outcome
    }

    fn is_applicable(&self, strategy: Strategy, request: &TrimRequest) -> bool {
        match strategy {
            Strategy::IdentityCopy => IdentityCopier::new().is_possible(&request.range),
            Strategy::ContainerRewrite => self.resolver.resolve_path(&request.source).is_some(),
            Strategy::StreamCopy => true,
        }
    }

    /// Run one strategy, turning a panic into an ordinary failure
    fn attempt_guarded(&self, strategy: Strategy, request: &TrimRequest) -> Result<(), (String, Option<ErrorKind>)> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.attempt(strategy, request))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err((e.to_string(), Some(e.kind()))),
            Err(payload) => Err((format!("panicked: {}", panic_message(payload.as_ref())), None)),
        }
    }

    fn attempt(&self, strategy: Strategy, request: &TrimRequest) -> TrimResult<()> {
        let destination = request.destination.as_path();
        match strategy {
            Strategy::IdentityCopy => {
                IdentityCopier::new().copy(self.resolver.as_ref(), &request.source, destination)?;
            }
            Strategy::ContainerRewrite => {
                let path = self
                    .resolver
                    .resolve_path(&request.source)
                    .ok_or_else(|| TrimError::unreadable("source has no local path"))?;
                let plan = ContainerTrimmer::new(self.options.chunk_duration_ms).trim(
                    &path,
                    destination,
                    &request.range,
                )?;
                debug!(
                    "Rewrote {:.3}s..{:.3}s",
                    plan.corrected_start_secs, plan.corrected_end_secs
                );
            }
            Strategy::StreamCopy => {
                let trimmer = StreamCopyTrimmer::new(request.selection, self.options.default_buffer_size);
                match self.options.backend {
                    #[cfg(feature = "libav")]
                    crate::engine::StreamCopyBackend::Libav => {
                        let path = self
                            .resolver
                            .resolve_path(&request.source)
                            .ok_or_else(|| TrimError::unreadable("libav needs a local path"))?;
                        crate::adapters::exec_libav::stream_copy(&trimmer, &path, destination, &request.range)?;
                    }
                    backend => {
                        if !backend.is_available() {
                            warn!("Backend {:?} not compiled in, using native", backend);
                        }
                        trimmer.trim_file(self.resolver.as_ref(), &request.source, destination, &request.range)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn remove_destination(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn verify_destination(path: &Path) -> Result<(), (String, Option<ErrorKind>)> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(("destination is empty".to_string(), Some(ErrorKind::Io))),
        Err(e) => Err((format!("destination missing: {}", e), Some(ErrorKind::Io))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Publishes a job's status. Dropped unstarted, the job counts as cancelled.
struct StatusReporter {
    job_id: u64,
    status: watch::Sender<JobStatus>,
}

impl StatusReporter {
    fn set(&self, next: JobStatus) {
        let moved = self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!("Job {} is {}", self.job_id, next);
        }
    }
}

impl Drop for StatusReporter {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.set(JobStatus::Failed);
        } else {
            self.set(JobStatus::Cancelled);
        }
    }
}

/// Handle returned by [`TrimCoordinator::trim`]
#[derive(Debug, Clone)]
pub struct TrimHandle {
    job_id: u64,
    status: watch::Receiver<JobStatus>,
}

impl TrimHandle {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// `None` while the job is pending or running. A job dropped before it
    /// started yields `TrimError::Cancelled`.
    pub fn finished(&self) -> Option<TrimResult<JobStatus>> {
        match self.status() {
            JobStatus::Cancelled => Some(Err(TrimError::Cancelled)),
            status if status.is_terminal() => Some(Ok(status)),
            _ => None,
        }
    }

    /// Await a terminal status
    pub async fn wait(&mut self) -> JobStatus {
        loop {
            let status = *self.status.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }
}

/// Entry point for trim jobs
pub struct TrimCoordinator {
    executor: Arc<TaskExecutor>,
    dispatcher: UiDispatcher,
    pipeline: Arc<TrimPipeline>,
    next_job_id: AtomicU64,
}

impl TrimCoordinator {
    pub fn new(executor: Arc<TaskExecutor>, dispatcher: UiDispatcher, pipeline: TrimPipeline) -> Self {
        Self {
            executor,
            dispatcher,
            pipeline: Arc::new(pipeline),
            next_job_id: AtomicU64::new(1),
        }
    }

    /// Queue `request`; `on_done` later receives the destination, or `None`
    /// on failure, through the dispatcher.
    ///
    /// A job cancelled before it starts never calls `on_done`.
    pub fn trim<F>(&self, request: TrimRequest, on_done: F) -> TrimResult<TrimHandle>
    where
        F: FnOnce(Option<PathBuf>) + Send + 'static,
    {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(JobStatus::Pending);
        let reporter = StatusReporter { job_id, status: tx };
        let pipeline = Arc::clone(&self.pipeline);
        let dispatcher = self.dispatcher.clone();
        let group_id = request.group_id.clone();

        self.executor.submit(group_id.as_deref(), move || {
            reporter.set(JobStatus::Running);
            let outcome = pipeline.run(&request);
            reporter.set(if outcome.is_success() {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            });

            let result = outcome.result;
            let posted = dispatcher.schedule(
                request.effective_dispatch_id(),
                move || on_done(result),
                Duration::ZERO,
            );
            if !posted {
                warn!("Job {} finished after its dispatcher loop went away", job_id);
            }
        })?;

        debug!("Queued job {}", job_id);
        Ok(TrimHandle { job_id, status: rx })
    }

    /// Cancel every job of `group_id` that has not started
    pub fn cancel(&self, group_id: &str) {
        self.executor.cancel(group_id);
    }

    pub fn dispatcher(&self) -> &UiDispatcher {
        &self.dispatcher
    }

    pub fn pipeline(&self) -> &TrimPipeline {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{MediaSource, SourceLocator, TrimRange};
    use crate::ports::ReadSeek;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Serves fixed bytes; optionally exposes a path
    struct MemoryResolver {
        bytes: Vec<u8>,
        path: Option<PathBuf>,
    }

    impl SourceResolver for MemoryResolver {
        fn resolve_path(&self, _source: &MediaSource) -> Option<PathBuf> {
            self.path.clone()
        }

        fn open(&self, _source: &MediaSource) -> TrimResult<Box<dyn ReadSeek>> {
            Ok(Box::new(Cursor::new(self.bytes.clone())))
        }
    }

    fn pipeline(bytes: Vec<u8>, path: Option<PathBuf>) -> TrimPipeline {
        TrimPipeline::new(Arc::new(MemoryResolver { bytes, path }), EngineOptions::default())
    }

    fn request(size: u64, dest: &Path, start_ms: u64, end_ms: u64) -> TrimRequest {
        let source = MediaSource::new(SourceLocator::Handle("mem".into()), 12_000, size);
        TrimRequest::new(source, dest, TrimRange::new(start_ms, end_ms, 12_000).unwrap())
    }

    #[test]
    fn test_full_range_is_identity_copy() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("out.mp4");
        let bytes: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        let outcome = pipeline(bytes.clone(), None).run(&request(4096, &dest, 0, 12_000));

        assert_eq!(outcome.strategy, Some(Strategy::IdentityCopy));
        assert_eq!(outcome.result.as_deref(), Some(dest.as_path()));
        assert_eq!(fs::read(&dest).unwrap(), bytes);
    }

    #[test]
    fn test_garbage_source_fails_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        fs::write(&dest, b"stale").unwrap();

        let outcome = pipeline(vec![0xAB; 512], None).run(&request(512, &dest, 1000, 3000));

        assert!(outcome.result.is_none());
        // no local path: only stream copy is attempted
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].strategy, Strategy::StreamCopy);
        assert!(outcome.final_error().is_some());
        assert!(!dest.exists());
    }

    #[test]
    fn test_container_rewrite_failure_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("broken.mp4");
        fs::write(&src, vec![0u8; 64]).unwrap();
        let dest = dir.path().join("out.mp4");

        let outcome = pipeline(vec![0u8; 64], Some(src)).run(&request(64, &dest, 1000, 3000));

        let tried: Vec<Strategy> = outcome.attempts.iter().map(|a| a.strategy).collect();
        assert_eq!(tried, vec![Strategy::ContainerRewrite, Strategy::StreamCopy]);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn test_on_done_fires_once_through_loop() {
        let executor = Arc::new(TaskExecutor::new(1).unwrap());
        let (dispatcher, ui) = UiDispatcher::new();
        let coordinator = TrimCoordinator::new(executor, dispatcher.clone(), pipeline(vec![1; 16], None));

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let calls: Arc<Mutex<Vec<Option<PathBuf>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);

        let handle = coordinator
            .trim(request(16, &dest, 0, 12_000).with_group("job"), move |result| {
                sink.lock().unwrap().push(result)
            })
            .unwrap();

        assert!(ui.run_until(Duration::from_secs(10), || !calls.lock().unwrap().is_empty()));
        ui.run_for(Duration::from_millis(20));
        assert_eq!(*calls.lock().unwrap(), vec![Some(dest.clone())]);
        assert_eq!(handle.status(), JobStatus::Succeeded);
        assert!(matches!(handle.finished(), Some(Ok(JobStatus::Succeeded))));
        assert!(dispatcher.pending_tokens().is_empty());
    }

    /// Panics while deciding which strategies apply
    struct PanickingResolver;

    impl SourceResolver for PanickingResolver {
        fn resolve_path(&self, _source: &MediaSource) -> Option<PathBuf> {
            panic!("resolver exploded")
        }

        fn open(&self, _source: &MediaSource) -> TrimResult<Box<dyn ReadSeek>> {
            Err(TrimError::unreadable("unused"))
        }
    }

    #[test]
    fn test_job_panic_outside_strategies_is_failed() {
        let executor = Arc::new(TaskExecutor::new(1).unwrap());
        let (dispatcher, ui) = UiDispatcher::new();
        let pipeline = TrimPipeline::new(Arc::new(PanickingResolver), EngineOptions::default());
        let coordinator = TrimCoordinator::new(executor, dispatcher, pipeline);

        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        let handle = coordinator
            .trim(request(16, &dir.path().join("out.mp4"), 1000, 3000), move |_| {
                *flag.lock().unwrap() = true
            })
            .unwrap();

        assert!(ui.run_until(Duration::from_secs(10), || handle.finished().is_some()));
        assert_eq!(handle.status(), JobStatus::Failed);
        ui.run_for(Duration::from_millis(20));
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn test_cancelled_job_never_reports() {
        let executor = Arc::new(TaskExecutor::new(1).unwrap());
        let (dispatcher, ui) = UiDispatcher::new();
        let coordinator = TrimCoordinator::new(Arc::clone(&executor), dispatcher, pipeline(vec![1; 16], None));

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        executor
            .submit(None, move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        let handle = coordinator
            .trim(
                request(16, &dir.path().join("out.mp4"), 0, 12_000).with_group("g"),
                move |_| *flag.lock().unwrap() = true,
            )
            .unwrap();

        coordinator.cancel("g");
        assert_eq!(handle.status(), JobStatus::Cancelled);
        let err = handle.finished().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        release_tx.send(()).unwrap();
        ui.run_for(Duration::from_millis(100));
        assert!(!*fired.lock().unwrap());
    }
}
