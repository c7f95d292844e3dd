//! Engine - `work()` の入口
//!
//! # 1 回の run の流れ
//! 1. handler → loader → 件数 の順に検証（失敗したら何も実行しない）
//! 2. シグナル監視を開始し、WorkerPool を起動
//! 3. Dispatcher が loader を使い切るまで投入
//! 4. reporter があれば定期表示、なければ全タスクの終了を待つ
//! 5. 正常終了なら `down(Completed)`、shutdown 要求があれば ShutdownController
//!
//! DoneList / TaskRegistry は run ごとに作り直す。

use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span};

use crate::app::config::EngineConfig;
use crate::app::dispatcher::{Dispatcher, RunContext};
use crate::app::done_list::DoneList;
use crate::app::pool::WorkerPool;
use crate::app::registry::TaskRegistry;
use crate::app::reporter::{ProgressReporter, WaitOutcome};
use crate::app::shutdown::{ShutdownController, ShutdownHandle, ShutdownSignal, listen_for_signals};
use crate::app::status::WorkReport;
use crate::domain::{EngineError, RunId, TaskState, Termination, WorkItem};
use crate::ports::{DataLoader, TaskHandler};

/// Parallel dispatch engine.
///
/// # 使用例
/// ```ignore
/// let mut engine = Engine::new(EngineConfig::new(10))?;
/// engine.set_loader(InMemoryLoader::from_values(items));
/// engine.set_handler(Arc::new(MyHandler::default()));
/// engine.register_progress_report("[{time}] {done}/{total}", 1.0)?;
/// let report = engine.work().await?;
/// ```
pub struct Engine {
    config: EngineConfig,
    loader: Option<Box<dyn DataLoader>>,
    handler: Option<Arc<dyn TaskHandler>>,
    reporter: Option<ProgressReporter>,
    signal: Arc<ShutdownSignal>,
    done: DoneList,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            loader: None,
            handler: None,
            reporter: None,
            signal: Arc::new(ShutdownSignal::new()),
            done: DoneList::new(),
        })
    }

    /// Engine with `workers` slots and default settings otherwise.
    pub fn with_workers(workers: usize) -> Result<Self, EngineError> {
        Self::new(EngineConfig::new(workers))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_loader(&mut self, loader: impl DataLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    /// Hand the loader back, e.g. to inspect a checkpointing loader after a run.
    pub fn take_loader(&mut self) -> Option<Box<dyn DataLoader>> {
        self.loader.take()
    }

    pub fn set_handler<H: TaskHandler + 'static>(&mut self, handler: Arc<H>) {
        self.handler = Some(handler);
    }

    /// Print `template` every `seconds` while tasks are outstanding.
    pub fn register_progress_report(&mut self, template: &str, seconds: f64) -> Result<(), EngineError> {
        self.reporter = Some(ProgressReporter::new(template, seconds)?);
        Ok(())
    }

    /// External shutdown trigger, equivalent to SIGINT.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(Arc::clone(&self.signal))
    }

    /// Items of the most recent run whose `handle` returned `Ok`.
    pub fn done_items(&self) -> Vec<WorkItem> {
        self.done.snapshot()
    }

    /// Run every item through the handler.
    ///
    /// Configuration errors are returned before anything is dispatched.
    /// A shutdown (signal or handler stop flag) is not an error: it is
    /// reported through `WorkReport::termination`.
    pub async fn work(&mut self) -> Result<WorkReport, EngineError> {
        let Some(handler) = self.handler.clone() else {
            error!("no task handler set");
            return Err(EngineError::MissingHandler);
        };
        let Some(mut loader) = self.loader.take() else {
            error!("no data loader set");
            return Err(EngineError::MissingLoader);
        };
        let total = loader.size();
        if total == 0 {
            self.loader = Some(loader);
            error!("data loader is empty");
            return Err(EngineError::EmptyLoader);
        }

        let run_id = RunId::new();
        let span = info_span!("run", %run_id);
        let result = run(
            &self.config,
            self.reporter.as_ref(),
            &self.signal,
            RunInput {
                run_id,
                handler,
                loader: &mut *loader,
                total,
            },
        )
        .instrument(span)
        .await;
        self.loader = Some(loader);

        let (report, done) = result?;
        self.done = done;

        if self.config.exit_on_shutdown && report.termination.is_shutdown() {
            info!(%run_id, "terminating process after shutdown");
            std::process::exit(0);
        }
        Ok(report)
    }
}

struct RunInput<'a> {
    run_id: RunId,
    handler: Arc<dyn TaskHandler>,
    loader: &'a mut dyn DataLoader,
    total: usize,
}

async fn run(
    config: &EngineConfig,
    reporter: Option<&ProgressReporter>,
    signal: &Arc<ShutdownSignal>,
    input: RunInput<'_>,
) -> Result<(WorkReport, DoneList), EngineError> {
    let RunInput {
        run_id,
        handler,
        loader,
        total,
    } = input;

    signal.reset_if_completed();
    handler.stop_flag().clear();
    let ctx = Arc::new(RunContext::new(handler, Arc::clone(signal)));

    let listener = if config.handle_signals {
        Some(listen_for_signals(Arc::clone(signal))?)
    } else {
        None
    };

    let pool = WorkerPool::spawn(config.workers, Arc::clone(&ctx));
    info!(total, workers = pool.size(), "run started");
    let mut registry = TaskRegistry::new();

    let summary = Dispatcher::new(&mut *loader, &pool, &mut registry, &ctx)
        .dispatch()
        .await;

    let waited = match reporter {
        Some(reporter) => reporter.report_until_idle(&ctx, total).await,
        None => wait_until_idle(&ctx).await,
    };
    // a stop flag raised by the last handle call is only seen here
    ctx.observe_stop_flag();

    let shutting_down = waited == WaitOutcome::ShutdownRequested || ctx.signal.is_requested();
    let (termination, checkpoint_saved) = if shutting_down {
        let outcome = ShutdownController::new(&ctx, &registry, config.drain_timeout)
            .run(&pool, loader)
            .await;
        debug!(
            cancelled = outcome.cancelled,
            drained = outcome.drained,
            settled = outcome.settled,
            "shutdown path finished"
        );
        if outcome.settled {
            pool.shutdown_and_join().await;
        } else {
            pool.abort();
        }
        (
            Termination::Shutdown {
                trigger: outcome.trigger,
            },
            outcome.checkpoint_saved,
        )
    } else {
        pool.shutdown_and_join().await;
        ctx.down(Termination::Completed).await;
        (Termination::Completed, false)
    };

    if let Some(listener) = listener {
        listener.abort();
    }

    let report = WorkReport {
        run_id,
        total,
        submitted: summary.submitted,
        done: ctx.done.len(),
        skipped: summary.skipped,
        failed: ctx.failed(),
        cancelled: registry.count(TaskState::Cancelled),
        termination,
        checkpoint_saved,
    };
    info!(
        done = report.done,
        skipped = report.skipped,
        failed = report.failed,
        cancelled = report.cancelled,
        ?termination,
        "run finished"
    );
    Ok((report, ctx.done.clone()))
}

async fn wait_until_idle(ctx: &RunContext) -> WaitOutcome {
    tokio::select! {
        biased;
        _ = ctx.signal.requested() => WaitOutcome::ShutdownRequested,
        _ = ctx.outstanding.wait_idle() => WaitOutcome::Idle,
    }
}
