use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rstest::rstest;
use serde_json::{Value, json};

use fanout_core::impls::{InMemoryLoader, JsonCheckpointLoader};
use fanout_core::{
    DataLoader, Engine, EngineConfig, EngineError, HandlerError, LoaderError, ProgressLoader,
    ShutdownHandle, StopFlag, TaskHandler, Termination, Trigger, WorkItem,
};

enum Behavior {
    Succeed,
    /// Call `shutdown()` and fail once the first value reaches the threshold.
    StopAt(i64),
    /// Deliver an external shutdown while handling this first value.
    SignalAt(i64, ShutdownHandle),
    /// From this first value on, call `shutdown()` and also deliver an
    /// external shutdown, then succeed.
    StopAndSignalFrom(i64, ShutdownHandle),
    FailOdd,
    PanicAt(i64),
}

struct Recorder {
    behavior: Behavior,
    keep_from: i64,
    delay: Duration,
    calls: AtomicUsize,
    kept: Mutex<Vec<WorkItem>>,
    downs: Mutex<Vec<(Termination, usize)>>,
    stop: StopFlag,
}

impl Recorder {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            keep_from: i64::MIN,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            kept: Mutex::new(Vec::new()),
            downs: Mutex::new(Vec::new()),
            stop: StopFlag::new(),
        }
    }

    fn keep_from(mut self, first: i64) -> Self {
        self.keep_from = first;
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn downs(&self) -> Vec<(Termination, usize)> {
        self.downs.lock().unwrap().clone()
    }
}

fn first(item: &WorkItem) -> i64 {
    item.arg(0).and_then(Value::as_i64).unwrap_or_default()
}

#[async_trait]
impl TaskHandler for Recorder {
    async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let first = first(item);
        match &self.behavior {
            Behavior::StopAt(n) if first >= *n => {
                self.shutdown();
                return Err(HandlerError::permanent(format!("stop at {first}")));
            }
            Behavior::SignalAt(n, handle) if first == *n => {
                handle.request();
            }
            Behavior::StopAndSignalFrom(n, handle) if first >= *n => {
                self.shutdown();
                handle.request();
            }
            Behavior::FailOdd if first % 2 == 1 => {
                return Err(HandlerError::new(format!("odd {first}")));
            }
            Behavior::PanicAt(n) if first == *n => panic!("boom at {n}"),
            _ => {}
        }

        if first >= self.keep_from {
            self.kept.lock().unwrap().push(item.clone());
        }
        Ok(())
    }

    async fn down(&self, termination: Termination) {
        let kept = self.kept.lock().unwrap().len();
        self.downs.lock().unwrap().push((termination, kept));
    }

    fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }
}

/// Loader that records every `save` call.
struct RecordingLoader {
    inner: InMemoryLoader,
    saves: Arc<Mutex<Vec<Vec<WorkItem>>>>,
}

impl DataLoader for RecordingLoader {
    fn next(&mut self) -> Option<Value> {
        self.inner.next()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn has_next(&self) -> bool {
        self.inner.has_next()
    }

    fn as_progress(&mut self) -> Option<&mut dyn ProgressLoader> {
        Some(self)
    }
}

impl ProgressLoader for RecordingLoader {
    fn save(&mut self, done: &[WorkItem]) -> Result<(), LoaderError> {
        self.saves.lock().unwrap().push(done.to_vec());
        Ok(())
    }
}

fn pairs(n: i64) -> Vec<Value> {
    (0..n).map(|i| json!([i, i + 1])).collect()
}

fn engine(workers: usize) -> Engine {
    Engine::new(EngineConfig::new(workers).with_signal_handling(false)).unwrap()
}

fn firsts(items: &[WorkItem]) -> Vec<i64> {
    let mut firsts: Vec<i64> = items.iter().map(first).collect();
    firsts.sort_unstable();
    firsts
}

#[rstest]
#[case::single(1)]
#[case::few(4)]
#[case::ten(10)]
#[case::more_than_items(300)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keeps_170_of_200_pairs(#[case] workers: usize) {
    let handler = Arc::new(Recorder::new(Behavior::Succeed).keep_from(30));
    let mut engine = engine(workers);
    engine.set_loader(InMemoryLoader::from_values(pairs(200)));
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    assert_eq!(report.termination, Termination::Completed);
    assert_eq!(report.total, 200);
    assert_eq!(report.submitted, 200);
    assert_eq!(report.done, 200);
    assert_eq!(report.skipped, 0);
    assert!(!report.checkpoint_saved);
    assert_eq!(handler.calls(), 200);
    assert_eq!(handler.downs(), vec![(Termination::Completed, 170)]);
    assert_eq!(firsts(&engine.done_items()), (0..200).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_stop_skips_checkpoint() {
    let saves = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(Recorder::new(Behavior::StopAt(100)).delay(Duration::from_millis(1)));
    let mut engine = engine(10);
    engine.set_loader(RecordingLoader {
        inner: InMemoryLoader::from_values(pairs(200)),
        saves: Arc::clone(&saves),
    });
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    assert_eq!(
        report.termination,
        Termination::Shutdown {
            trigger: Trigger::Handler
        }
    );
    assert!(!report.checkpoint_saved);
    assert!(saves.lock().unwrap().is_empty());

    let done = engine.done_items();
    assert!(done.len() <= 100);
    assert!(done.iter().all(|item| first(item) < 100));
    assert_eq!(handler.downs().len(), 1);
    assert_eq!(report.done + report.failed + report.cancelled, report.submitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_shutdown_saves_exactly_the_done_list() {
    let saves = Arc::new(Mutex::new(Vec::new()));
    let mut engine = engine(4);
    let handler = Arc::new(
        Recorder::new(Behavior::SignalAt(50, engine.shutdown_handle())).delay(Duration::from_millis(2)),
    );
    engine.set_loader(RecordingLoader {
        inner: InMemoryLoader::from_values(pairs(200)),
        saves: Arc::clone(&saves),
    });
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    assert_eq!(
        report.termination,
        Termination::Shutdown {
            trigger: Trigger::Signal
        }
    );
    assert!(report.checkpoint_saved);

    let saves = saves.lock().unwrap();
    assert_eq!(saves.len(), 1);
    let done = engine.done_items();
    assert_eq!(firsts(&saves[0]), firsts(&done));
    assert!(done.len() < 200);
    assert!(report.cancelled > 0);
    assert_eq!(report.done + report.failed + report.cancelled, report.submitted);

    let downs = handler.downs();
    assert_eq!(downs.len(), 1);
    assert_eq!(downs[0].0.trigger(), Some(Trigger::Signal));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_processes_exactly_the_outstanding_items() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("checkpoint.json");

    // first run is interrupted
    let mut first_run = engine(4);
    let handler = Arc::new(
        Recorder::new(Behavior::SignalAt(60, first_run.shutdown_handle())).delay(Duration::from_millis(1)),
    );
    first_run.set_loader(JsonCheckpointLoader::with_items(pairs(200), &ckpt).unwrap());
    first_run.set_handler(Arc::clone(&handler));
    let report = first_run.work().await.unwrap();
    assert!(report.checkpoint_saved);
    assert!(ckpt.exists());
    let done_before = firsts(&first_run.done_items());

    // second run picks up the checkpoint
    let loader = JsonCheckpointLoader::with_items(pairs(200), &ckpt).unwrap();
    assert!(loader.is_resumed());
    assert_eq!(loader.size(), 200 - done_before.len());

    let mut second_run = engine(4);
    second_run.set_loader(loader);
    second_run.set_handler(Arc::new(Recorder::new(Behavior::Succeed)));
    let report = second_run.work().await.unwrap();
    assert_eq!(report.termination, Termination::Completed);
    let done_after = firsts(&second_run.done_items());

    let mut all: Vec<i64> = done_before.iter().chain(&done_after).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..200).collect::<Vec<_>>());
    let distinct: BTreeSet<i64> = all.into_iter().collect();
    assert_eq!(distinct.len(), 200);

    assert!(JsonCheckpointLoader::clear_checkpoint(&ckpt).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_timeout_aborts_running_handles() {
    let config = EngineConfig::new(1)
        .with_signal_handling(false)
        .with_drain_timeout(Duration::from_millis(10));
    let mut engine = Engine::new(config).unwrap();
    let handler = Arc::new(Recorder::new(Behavior::Succeed).delay(Duration::from_millis(200)));
    engine.set_loader(InMemoryLoader::from_values(pairs(1)));
    engine.set_handler(Arc::clone(&handler));

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request();
    });

    let report = engine.work().await.unwrap();
    assert_eq!(handler.calls(), 1);
    assert_eq!(report.done, 0);
    assert_eq!(report.cancelled, 1);
    assert!(engine.done_items().is_empty());
    assert_eq!(
        handler.downs(),
        vec![(
            Termination::Shutdown {
                trigger: Trigger::Signal
            },
            0
        )]
    );

    // the aborted handle must not finish behind down()'s back
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(handler.kept.lock().unwrap().is_empty());
    assert_eq!(handler.downs().len(), 1);
}

#[rstest]
#[case::few(2)]
#[case::many(8)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_stop_and_signal_shut_down_once(#[case] workers: usize) {
    let saves = Arc::new(Mutex::new(Vec::new()));
    let mut engine = engine(workers);
    let handler = Arc::new(
        Recorder::new(Behavior::StopAndSignalFrom(10, engine.shutdown_handle()))
            .delay(Duration::from_millis(1)),
    );
    engine.set_loader(RecordingLoader {
        inner: InMemoryLoader::from_values(pairs(50)),
        saves: Arc::clone(&saves),
    });
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    let downs = handler.downs();
    assert_eq!(downs.len(), 1);
    assert_eq!(downs[0].0, report.termination);
    let trigger = report.termination.trigger().unwrap();

    let saves = saves.lock().unwrap();
    assert!(saves.len() <= 1);
    assert_eq!(saves.len() == 1, trigger == Trigger::Signal);
    assert_eq!(report.checkpoint_saved, trigger == Trigger::Signal);
    assert_eq!(report.done + report.failed + report.cancelled, report.submitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_queued_task_starts_after_shutdown() {
    let mut engine = engine(1);
    let handler = Arc::new(
        Recorder::new(Behavior::SignalAt(0, engine.shutdown_handle())).delay(Duration::from_millis(50)),
    );
    engine.set_loader(InMemoryLoader::from_values(pairs(20)));
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    assert_eq!(handler.calls(), 1);
    assert_eq!(report.done, 1);
    assert_eq!(report.cancelled, report.submitted - 1);
    assert_eq!(handler.downs().len(), 1);
}

#[tokio::test]
async fn malformed_item_is_skipped() {
    let handler = Arc::new(Recorder::new(Behavior::Succeed));
    let mut engine = engine(3);
    engine.set_loader(InMemoryLoader::from_values(vec![
        json!([1, 2]),
        json!({"a": 1}),
        json!(42),
        json!([3]),
    ]));
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.submitted, 3);
    assert_eq!(report.done, 3);
    assert_eq!(engine.done_items().len(), 3);
    assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn failed_items_stay_out_of_done_list() {
    let handler = Arc::new(Recorder::new(Behavior::FailOdd));
    let mut engine = engine(4);
    engine.set_loader(InMemoryLoader::from_values(pairs(10)));
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    assert_eq!(report.termination, Termination::Completed);
    assert_eq!(report.failed, 5);
    assert_eq!(firsts(&engine.done_items()), vec![0, 2, 4, 6, 8]);
    assert_eq!(handler.calls(), 10);
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_run() {
    let handler = Arc::new(Recorder::new(Behavior::PanicAt(3)));
    let mut engine = engine(2);
    engine.set_loader(InMemoryLoader::from_values(pairs(8)));
    engine.set_handler(Arc::clone(&handler));

    let report = engine.work().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.done, 7);
    assert_eq!(handler.downs(), vec![(Termination::Completed, 7)]);
}

#[tokio::test]
async fn request_before_work_stops_immediately() {
    let saves = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(Recorder::new(Behavior::Succeed));
    let mut engine = engine(2);
    engine.set_loader(RecordingLoader {
        inner: InMemoryLoader::from_values(pairs(5)),
        saves: Arc::clone(&saves),
    });
    engine.set_handler(Arc::clone(&handler));

    assert!(engine.shutdown_handle().request());
    let report = engine.work().await.unwrap();

    assert_eq!(handler.calls(), 0);
    assert_eq!(report.submitted, 0);
    assert_eq!(saves.lock().unwrap().as_slice(), &[Vec::<WorkItem>::new()]);
    assert_eq!(handler.downs().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_report_runs_until_idle() {
    let handler = Arc::new(Recorder::new(Behavior::Succeed).delay(Duration::from_millis(5)));
    let mut engine = engine(2);
    engine.set_loader(InMemoryLoader::from_values(pairs(20)));
    engine.set_handler(Arc::clone(&handler));
    engine
        .register_progress_report("[{time}] {done}/{total} {percent:.1%}", 0.01)
        .unwrap();

    let report = engine.work().await.unwrap();

    assert_eq!(report.done, 20);
    assert_eq!(handler.downs(), vec![(Termination::Completed, 20)]);
}

#[rstest]
#[case::unknown_field("{eta}", 1.0)]
#[case::zero_interval("{done}", 0.0)]
#[case::negative_interval("{done}", -2.5)]
fn invalid_progress_registration(#[case] template: &str, #[case] seconds: f64) {
    let mut engine = engine(1);
    let err = engine.register_progress_report(template, seconds).unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn configuration_errors_run_nothing() {
    let handler = Arc::new(Recorder::new(Behavior::Succeed));

    let mut engine = engine(2);
    assert!(matches!(engine.work().await, Err(EngineError::MissingHandler)));

    engine.set_handler(Arc::clone(&handler));
    assert!(matches!(engine.work().await, Err(EngineError::MissingLoader)));

    engine.set_loader(InMemoryLoader::default());
    assert!(matches!(engine.work().await, Err(EngineError::EmptyLoader)));

    assert_eq!(handler.calls(), 0);
    assert!(handler.downs().is_empty());
}
