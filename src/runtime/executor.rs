//! Background task executor with group cancellation.
//!
//! A fixed set of worker tasks drains one FIFO queue; every unit runs on the
//! blocking pool. Units submitted under a group id share a
//! [`CancellationToken`] that `cancel` trips for everything not yet started.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Runtime;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TrimError, TrimResult};

type Work = Box<dyn FnOnce() + Send + 'static>;

/// How a submitted unit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Group cancelled before the unit started
    Cancelled,
    Panicked,
}

/// Handle to one submitted unit
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the calling thread until the unit finishes.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(self) -> TaskOutcome {
        self.outcome.blocking_recv().unwrap_or(TaskOutcome::Cancelled)
    }

    /// Await the unit's outcome
    pub async fn outcome(self) -> TaskOutcome {
        self.outcome.await.unwrap_or(TaskOutcome::Cancelled)
    }

    /// Outcome if already available
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(TaskOutcome::Cancelled),
        }
    }
}

/// Live token of a group and how many of its units are still queued
struct GroupEntry {
    token: CancellationToken,
    generation: u64,
    pending: usize,
}

struct Unit {
    id: u64,
    /// (group id, generation), when cancellable
    group: Option<(String, u64)>,
    token: Option<CancellationToken>,
    work: Work,
    outcome: oneshot::Sender<TaskOutcome>,
}

struct Shared {
    queue: Mutex<VecDeque<Unit>>,
    groups: Mutex<HashMap<String, GroupEntry>>,
    notify: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    /// Drop one pending reference to a group, removing it when none remain
    fn release(groups: &mut HashMap<String, GroupEntry>, group: &Option<(String, u64)>) {
        let Some((id, generation)) = group else {
            return;
        };
        let remove = match groups.get_mut(id) {
            Some(entry) if entry.generation == *generation => {
                entry.pending = entry.pending.saturating_sub(1);
                entry.pending == 0
            }
            _ => false,
        };
        if remove {
            groups.remove(id);
        }
    }

    /// Pop the next unit.
    ///
    /// The cancelled check and the start transition happen under the group
    /// lock, so `cancel` either wins entirely or not at all.
    fn next_unit(&self) -> Next {
        let unit = {
            let mut queue = lock(&self.queue);
            match queue.pop_front() {
                Some(unit) => unit,
                None if self.closed.load(Ordering::SeqCst) => return Next::Closed,
                None => return Next::Empty,
            }
        };
        let mut groups = lock(&self.groups);
        if unit.token.as_ref().map_or(false, |t| t.is_cancelled()) {
            return Next::Cancelled(unit);
        }
        Self::release(&mut groups, &unit.group);
        Next::Run(unit)
    }
}

enum Next {
    Run(Unit),
    Cancelled(Unit),
    Empty,
    Closed,
}

/// Runs work units on a pool of background workers
pub struct TaskExecutor {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl TaskExecutor {
    /// Start an executor with `worker_threads` workers (at least one)
    pub fn new(worker_threads: usize) -> TrimResult<Self> {
        let worker_count = worker_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_count)
            .thread_name("keytrim-worker")
            .enable_all()
            .build()?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            groups: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        });

        let workers = (0..worker_count)
            .map(|worker_id| runtime.spawn(worker_loop(worker_id, Arc::clone(&shared))))
            .collect();

        info!("Task executor started with {} workers", worker_count);
        Ok(Self {
            shared,
            runtime: Mutex::new(Some(runtime)),
            workers: Mutex::new(workers),
            worker_count,
        })
    }

    /// Executor sized to the number of CPUs
    pub fn with_defaults() -> TrimResult<Self> {
        Self::new(num_cpus::get())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue `work` under `group_id`; an empty or absent id is not cancellable
    pub fn submit<F>(&self, group_id: Option<&str>, work: F) -> TrimResult<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = lock(&self.shared.queue);
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TrimError::ExecutorShutdown);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let (group, token) = match group_id.filter(|g| !g.is_empty()) {
            Some(group_id) => {
                let mut groups = lock(&self.shared.groups);
                let entry = groups.entry(group_id.to_string()).or_insert_with(|| GroupEntry {
                    token: CancellationToken::new(),
                    generation: self.shared.next_generation.fetch_add(1, Ordering::Relaxed),
                    pending: 0,
                });
                entry.pending += 1;
                (
                    Some((group_id.to_string(), entry.generation)),
                    Some(entry.token.clone()),
                )
            }
            None => (None, None),
        };

        queue.push_back(Unit {
            id,
            group,
            token,
            work: Box::new(work),
            outcome: tx,
        });
        drop(queue);
        self.shared.notify.notify_one();
        debug!("Submitted task {} (group {:?})", id, group_id);

        Ok(TaskHandle { id, outcome: rx })
    }

    /// Prevent every not-yet-started unit of `group_id` from running
    pub fn cancel(&self, group_id: &str) {
        {
            let mut groups = lock(&self.shared.groups);
            let Some(entry) = groups.remove(group_id) else {
                return;
            };
            entry.token.cancel();
        }

        // Discard the cancelled units eagerly so their work is dropped now.
        let cancelled: Vec<Unit> = {
            let mut queue = lock(&self.shared.queue);
            let (dropped, kept): (VecDeque<Unit>, VecDeque<Unit>) = queue
                .drain(..)
                .partition(|u| u.token.as_ref().map_or(false, |t| t.is_cancelled()));
            *queue = kept;
            dropped.into_iter().collect()
        };
        info!("Cancelled group {} ({} queued units)", group_id, cancelled.len());
        for unit in cancelled {
            let _ = unit.outcome.send(TaskOutcome::Cancelled);
        }
    }

    /// Number of units waiting to start
    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Group ids with units still waiting to start
    pub fn pending_groups(&self) -> Vec<String> {
        lock(&self.shared.groups).keys().cloned().collect()
    }

    /// Stop accepting work, drain the queue and join the workers.
    ///
    /// Must not be called from inside an async context.
    pub fn shutdown(&self) {
        {
            let _queue = lock(&self.shared.queue);
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.shared.notify.notify_waiters();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let runtime = lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            runtime.block_on(async {
                for worker in workers {
                    if let Err(e) = worker.await {
                        warn!("Worker ended abnormally: {}", e);
                    }
                }
            });
            runtime.shutdown_background();
        }
        info!("Task executor shut down");
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    debug!("Worker {} started", worker_id);
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match shared.next_unit() {
            Next::Run(unit) => {
                debug!("Worker {} running task {}", worker_id, unit.id);
                let outcome = match tokio::task::spawn_blocking(unit.work).await {
                    Ok(()) => TaskOutcome::Completed,
                    Err(e) if e.is_panic() => {
                        warn!("Task {} panicked", unit.id);
                        TaskOutcome::Panicked
                    }
                    Err(_) => TaskOutcome::Cancelled,
                };
                let _ = unit.outcome.send(outcome);
            }
            Next::Cancelled(unit) => {
                debug!("Worker {} skipped cancelled task {}", worker_id, unit.id);
                let _ = unit.outcome.send(TaskOutcome::Cancelled);
            }
            Next::Closed => break,
            Next::Empty => notified.await,
        }
    }
    debug!("Worker {} stopped", worker_id);
}
