//! Executor, dispatcher and coordinator behaviour under concurrent use

mod support;

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use keytrim::adapters::FsSourceResolver;
use keytrim::domain::model::{JobStatus, MediaSource, SourceLocator, TrimRange, TrimRequest};
use keytrim::engine::{EngineOptions, TrimCoordinator, TrimPipeline};
use keytrim::runtime::{TaskExecutor, TaskOutcome, UiDispatcher};
use tempfile::TempDir;

use support::{scenario_tracks, write_mp4};

/// Occupy the executor's only worker until the returned sender fires
fn block_worker(executor: &TaskExecutor) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    executor
        .submit(None, move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        })
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    release_tx
}

#[test]
fn test_cancelled_groups_never_run_others_run_once() {
    let executor = TaskExecutor::new(1).unwrap();
    let release = block_worker(&executor);

    let runs: Arc<Mutex<HashMap<usize, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut handles = Vec::new();
    for unit in 0..40 {
        let group = format!("group-{}", unit % 8);
        let runs = Arc::clone(&runs);
        let handle = executor
            .submit(Some(&group), move || {
                *runs.lock().unwrap().entry(unit).or_insert(0) += 1;
            })
            .unwrap();
        handles.push((unit, handle));
    }

    for group in (0..8).filter(|g| g % 2 == 0) {
        executor.cancel(&format!("group-{}", group));
    }
    release.send(()).unwrap();

    for (unit, handle) in handles {
        let expected = if (unit % 8) % 2 == 0 {
            TaskOutcome::Cancelled
        } else {
            TaskOutcome::Completed
        };
        assert_eq!(handle.wait(), expected, "unit {}", unit);
    }

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 20);
    assert!(runs.iter().all(|(unit, &count)| (unit % 8) % 2 == 1 && count == 1));
    assert!(executor.pending_groups().is_empty());
}

#[test]
fn test_group_is_reusable_after_cancel() {
    let executor = TaskExecutor::new(1).unwrap();
    let release = block_worker(&executor);

    let first = executor.submit(Some("reuse"), || {}).unwrap();
    executor.cancel("reuse");
    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    let second = executor
        .submit(Some("reuse"), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    release.send(()).unwrap();

    assert_eq!(first.wait(), TaskOutcome::Cancelled);
    assert_eq!(second.wait(), TaskOutcome::Completed);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_schedules_from_many_threads_run_on_loop_thread() {
    let (dispatcher, ui) = UiDispatcher::new();
    let loop_thread = thread::current().id();
    let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    let posters: Vec<_> = (0..4)
        .map(|t| {
            let dispatcher = dispatcher.clone();
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for i in 0..25 {
                    let seen = Arc::clone(&seen);
                    let id = format!("poster-{}", t);
                    let label = format!("{}-{}", t, i);
                    assert!(dispatcher.schedule(
                        &id,
                        move || {
                            let on_loop = thread::current().id() == loop_thread;
                            seen.lock().unwrap().push((label, on_loop));
                        },
                        Duration::ZERO,
                    ));
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    assert!(ui.run_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 100));
    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|(_, on_loop)| *on_loop));

    // each poster's callbacks keep their submission order
    for t in 0..4 {
        let order: Vec<usize> = seen
            .iter()
            .filter_map(|(label, _)| label.strip_prefix(&format!("{}-", t)))
            .map(|i| i.parse().unwrap())
            .collect();
        assert_eq!(order, (0..25).collect::<Vec<_>>());
    }
    assert!(dispatcher.pending_tokens().is_empty());
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn test_cancel_all_only_touches_its_token() {
    let (dispatcher, ui) = UiDispatcher::new();
    let fired: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for id in ["keep", "drop", "drop"] {
        let fired = Arc::clone(&fired);
        dispatcher.schedule(id, move || fired.lock().unwrap().push(id), Duration::ZERO);
    }

    assert_eq!(dispatcher.cancel_all("drop"), 2);
    assert_eq!(dispatcher.pending_tokens(), vec!["keep".to_string()]);
    ui.run_pending();
    assert_eq!(*fired.lock().unwrap(), vec!["keep"]);
    assert!(dispatcher.pending_tokens().is_empty());
}

#[test]
fn test_every_job_reports_exactly_once() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.mp4");
    write_mp4(&good, &scenario_tracks());
    let garbage = dir.path().join("garbage.mp4");
    fs::write(&garbage, vec![0x5A; 2048]).unwrap();

    let executor = Arc::new(TaskExecutor::new(3).unwrap());
    let (dispatcher, ui) = UiDispatcher::new();
    let pipeline = TrimPipeline::new(Arc::new(FsSourceResolver::new()), EngineOptions::default());
    let coordinator = TrimCoordinator::new(executor, dispatcher.clone(), pipeline);

    let good_source = MediaSource::probe(&good).unwrap();
    let bad_source = MediaSource::new(SourceLocator::Path(garbage), 12_000, 2048);

    let results: Arc<Mutex<Vec<(usize, Option<std::path::PathBuf>)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for job in 0..8 {
        let source = if job % 2 == 0 { good_source.clone() } else { bad_source.clone() };
        let dest = dir.path().join(format!("out-{}.mp4", job));
        let request = TrimRequest::new(source, dest, TrimRange::new(1000, 3000, 12_000).unwrap())
            .with_group(format!("job-{}", job));
        let results = Arc::clone(&results);
        let handle = coordinator
            .trim(request, move |result| results.lock().unwrap().push((job, result)))
            .unwrap();
        handles.push((job, handle));
    }

    assert!(ui.run_until(Duration::from_secs(20), || results.lock().unwrap().len() == 8));
    // nothing arrives late
    ui.run_for(Duration::from_millis(50));

    let mut results = results.lock().unwrap().clone();
    results.sort_by_key(|(job, _)| *job);
    assert_eq!(results.len(), 8);
    for (job, result) in &results {
        let dest = dir.path().join(format!("out-{}.mp4", job));
        if job % 2 == 0 {
            assert_eq!(result.as_deref(), Some(dest.as_path()));
            assert!(fs::metadata(&dest).unwrap().len() > 0);
        } else {
            assert!(result.is_none());
            assert!(!dest.exists());
        }
    }
    for (job, handle) in &handles {
        let expected = if job % 2 == 0 { JobStatus::Succeeded } else { JobStatus::Failed };
        assert_eq!(handle.status(), expected);
    }
    assert!(dispatcher.pending_tokens().is_empty());
}

#[test]
fn test_dropping_loop_stops_callbacks() {
    let (dispatcher, ui) = UiDispatcher::new();
    drop(ui);
    assert!(!dispatcher.is_alive());
    assert!(!dispatcher.schedule("late", || {}, Duration::ZERO));
    assert_eq!(dispatcher.token_count("late"), None);
}
