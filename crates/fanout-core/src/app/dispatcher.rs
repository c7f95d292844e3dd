//! Dispatcher - loader からアイテムを引いて WorkerPool に投入する
//!
//! # フロー
//! 1. `loader.has_next()` の間、1 件ずつ `next()`（呼び出し元タスク上のみ）
//! 2. 形のチェック（sequence / mapping 以外は警告してスキップ）
//! 3. TaskRegistry にハンドルを登録して pool に投入
//!
//! 投入順 = pull 順。完了順は保証しない。
//! 各 worker slot で実行される「ラッパー」(`invoke`) もここに置く。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::app::done_list::DoneList;
use crate::app::pool::{Job, WorkerPool};
use crate::app::registry::{Outstanding, TaskRegistry};
use crate::app::shutdown::ShutdownSignal;
use crate::domain::{MalformedItem, Termination, Trigger, WorkItem};
use crate::ports::{DataLoader, TaskHandler};

/// Yield to the runtime after this many submissions so workers and the
/// signal listener get scheduled while a large loader is drained.
const YIELD_EVERY: usize = 64;

/// State shared between the dispatching task and the worker slots of one run.
pub(crate) struct RunContext {
    pub handler: Arc<dyn TaskHandler>,
    pub done: DoneList,
    pub outstanding: Outstanding,
    pub signal: Arc<ShutdownSignal>,
    failed: AtomicUsize,
    down_called: AtomicBool,
    /// `handle` calls currently running, keyed by task seq.
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
    aborting: AtomicBool,
}

impl RunContext {
    pub(crate) fn new(handler: Arc<dyn TaskHandler>, signal: Arc<ShutdownSignal>) -> Self {
        Self {
            handler,
            done: DoneList::new(),
            outstanding: Outstanding::new(),
            signal,
            failed: AtomicUsize::new(0),
            down_called: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            aborting: AtomicBool::new(false),
        }
    }

    pub(crate) fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Raise the shutdown signal if the handler asked to stop.
    pub(crate) fn observe_stop_flag(&self) {
        if self.handler.is_shutdown_requested() && self.signal.request(Trigger::Handler) {
            debug!("handler raised its stop flag");
        }
    }

    fn track(&self, seq: u64, handle: AbortHandle) {
        // registered after abort_in_flight() ran: cancel right away
        if self.aborting.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, handle);
        if self.aborting.load(Ordering::SeqCst) {
            self.abort_in_flight();
        }
    }

    fn untrack(&self, seq: u64) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq);
    }

    /// Cancel every running `handle` call. Returns how many were aborted.
    ///
    /// Cancelled calls take effect at their next `.await`; their items do not
    /// enter the done list.
    pub(crate) fn abort_in_flight(&self) -> usize {
        self.aborting.store(true, Ordering::SeqCst);
        let handles: Vec<AbortHandle> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// One-shot gate around `TaskHandler::down`.
    ///
    /// Returns `false` when `down` already ran for this run.
    pub(crate) async fn down(&self, termination: Termination) -> bool {
        if self.down_called.swap(true, Ordering::SeqCst) {
            debug!(?termination, "down already called, ignoring");
            return false;
        }
        self.handler.down(termination).await;
        true
    }
}

/// Per-item wrapper executed by a worker slot.
///
/// A set stop flag or shutdown signal routes to the shutdown path instead of
/// calling `handle`. Only an `Ok` return appends the item to the done list.
pub(crate) async fn invoke(ctx: &RunContext, job: Job, worker_id: usize) {
    let Job { task, item } = job;

    if !task.try_start() {
        debug!(worker_id, seq = task.seq(), "task was cancelled before it started");
        return;
    }

    ctx.observe_stop_flag();
    if ctx.signal.is_requested() {
        task.abandon();
        ctx.outstanding.done();
        debug!(worker_id, seq = task.seq(), "shutdown requested, not starting task");
        return;
    }

    // run on its own task so a panicking handler cannot take the slot down
    let handler = Arc::clone(&ctx.handler);
    let join = tokio::spawn(async move {
        let outcome = handler.handle(&item).await;
        (item, outcome)
    });
    ctx.track(task.seq(), join.abort_handle());
    let result = join.await;
    ctx.untrack(task.seq());

    match result {
        Ok((item, Ok(()))) => ctx.done.push(item),
        Err(e) if e.is_cancelled() => {
            task.abandon();
            ctx.outstanding.done();
            debug!(worker_id, seq = task.seq(), "handle aborted after drain timeout");
            return;
        }
        Ok((_, Err(e))) => {
            ctx.failed.fetch_add(1, Ordering::SeqCst);
            warn!(worker_id, seq = task.seq(), error = %e, "handler failed");
        }
        Err(e) => {
            ctx.failed.fetch_add(1, Ordering::SeqCst);
            error!(worker_id, seq = task.seq(), error = %e, "handler panicked");
        }
    }

    // the handler may have called shutdown() while handling
    ctx.observe_stop_flag();
    task.finish();
    ctx.outstanding.done();
}

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DispatchSummary {
    pub submitted: usize,
    pub skipped: usize,
}

/// Pulls from the loader and submits to the pool.
pub(crate) struct Dispatcher<'a> {
    loader: &'a mut dyn DataLoader,
    pool: &'a WorkerPool,
    registry: &'a mut TaskRegistry,
    ctx: &'a RunContext,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(
        loader: &'a mut dyn DataLoader,
        pool: &'a WorkerPool,
        registry: &'a mut TaskRegistry,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            loader,
            pool,
            registry,
            ctx,
        }
    }

    /// Submit every remaining item, stopping early once shutdown is requested.
    pub(crate) async fn dispatch(self) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        while self.loader.has_next() {
            self.ctx.observe_stop_flag();
            if self.ctx.signal.is_requested() {
                debug!(submitted = summary.submitted, "shutdown requested, dispatch stopped");
                break;
            }

            let Some(raw) = self.loader.next() else {
                break;
            };

            let item = match WorkItem::try_from(raw) {
                Ok(item) => item,
                Err(MalformedItem(raw)) => {
                    warn!(item = %raw, "skipping work item: expected a sequence or a mapping");
                    summary.skipped += 1;
                    continue;
                }
            };

            let task = self.registry.register();
            self.ctx.outstanding.add();
            if let Err(job) = self.pool.submit(Job { task, item }) {
                // the pool is gone: undo the bookkeeping and stop
                job.task.cancel();
                self.ctx.outstanding.done();
                error!("worker pool closed while dispatching");
                break;
            }
            summary.submitted += 1;

            if summary.submitted % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        debug!(
            submitted = summary.submitted,
            skipped = summary.skipped,
            "dispatch finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::domain::{HandlerError, TaskState};
    use crate::ports::StopFlag;

    #[derive(Default)]
    struct Slow {
        finished: AtomicUsize,
        downs: AtomicUsize,
        stop: StopFlag,
    }

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _item: &WorkItem) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn down(&self, _termination: Termination) {
            self.downs.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_flag(&self) -> &StopFlag {
            &self.stop
        }
    }

    fn context(handler: Arc<Slow>) -> Arc<RunContext> {
        Arc::new(RunContext::new(handler, Arc::new(ShutdownSignal::new())))
    }

    #[tokio::test]
    async fn down_runs_once() {
        let handler = Arc::new(Slow::default());
        let ctx = context(Arc::clone(&handler));

        assert!(ctx.down(Termination::Completed).await);
        assert!(
            !ctx.down(Termination::Shutdown {
                trigger: Trigger::Signal
            })
            .await
        );
        assert_eq!(handler.downs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_handle_leaves_item_undone() {
        let handler = Arc::new(Slow::default());
        let ctx = context(Arc::clone(&handler));
        let mut registry = TaskRegistry::new();
        let task = registry.register();
        ctx.outstanding.add();

        let job = Job {
            task: Arc::clone(&task),
            item: WorkItem::try_from(json!([1])).unwrap(),
        };
        let worker = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move { invoke(&ctx, job, 0).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.abort_in_flight(), 1);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(ctx.outstanding.get(), 0);
        assert!(ctx.done.is_empty());
        assert_eq!(ctx.failed(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.finished.load(Ordering::SeqCst), 0);
    }
}
