//! Shutdown - 停止フラグとグレースフルシャットダウン
//!
//! # 状態遷移
//! `Running → ShuttingDown → Terminated`
//!
//! # 学習ポイント
//! - OS シグナルのコールバックでは何もしない。tokio の signal stream を
//!   普通のタスクで受け、アトミックなフラグを立てて通知するだけ
//! - 実際の停止処理（cancel → drain → checkpoint → down）は
//!   `work()` を呼んだタスク上の `ShutdownController` が行う
//! - 複数のトリガーが同時に来ても、最初の 1 つだけが記録される（CAS）
//! - drain がタイムアウトしたら実行中の `handle` を abort してから
//!   checkpoint / down に進む（down の後に handle が完了することはない）

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::dispatcher::RunContext;
use crate::app::pool::WorkerPool;
use crate::app::registry::TaskRegistry;
use crate::domain::{EngineError, ShutdownState, Termination, Trigger};
use crate::ports::DataLoader;

const NO_TRIGGER: u8 = 0;

/// How long aborted `handle` calls get to unwind after a drain timeout.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Process-wide tri-state shutdown flag.
///
/// The first `request` wins; later requests (from any trigger) are ignored
/// until the flag is reset for a new run.
#[derive(Debug)]
pub struct ShutdownSignal {
    state: AtomicU8,
    trigger: AtomicU8,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::NotRequested as u8),
            trigger: AtomicU8::new(NO_TRIGGER),
            notify: Notify::new(),
        }
    }

    /// Request shutdown. Returns `true` for the request that took effect.
    pub fn request(&self, trigger: Trigger) -> bool {
        if self
            .trigger
            .compare_exchange(NO_TRIGGER, trigger as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.state
            .store(ShutdownState::Requested as u8, Ordering::SeqCst);
        self.notify.notify_waiters();
        true
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True once shutdown was requested (including after it completed).
    pub fn is_requested(&self) -> bool {
        self.state() != ShutdownState::NotRequested
    }

    pub fn trigger(&self) -> Option<Trigger> {
        Trigger::from_u8(self.trigger.load(Ordering::SeqCst))
    }

    /// Wait until shutdown is requested.
    pub async fn requested(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn complete(&self) {
        self.state
            .store(ShutdownState::Completed as u8, Ordering::SeqCst);
    }

    /// Clear a completed shutdown so the next run starts fresh.
    ///
    /// A request that arrived before the run started is kept.
    pub(crate) fn reset_if_completed(&self) {
        if self.state() == ShutdownState::Completed {
            self.trigger.store(NO_TRIGGER, Ordering::SeqCst);
            self.state
                .store(ShutdownState::NotRequested as u8, Ordering::SeqCst);
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable external trigger, equivalent to delivering SIGINT.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    signal: Arc<ShutdownSignal>,
}

impl ShutdownHandle {
    pub(crate) fn new(signal: Arc<ShutdownSignal>) -> Self {
        Self { signal }
    }

    pub fn request(&self) -> bool {
        self.signal.request(Trigger::Signal)
    }

    pub fn state(&self) -> ShutdownState {
        self.signal.state()
    }
}

/// Route SIGINT and SIGTERM to `shutdown` for as long as the task lives.
///
/// The streams are created before spawning so installation errors surface
/// from `work()`.
pub(crate) fn listen_for_signals(
    shutdown: Arc<ShutdownSignal>,
) -> Result<JoinHandle<()>, EngineError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt()).map_err(EngineError::SignalInstall)?;
        let mut terminate = signal(SignalKind::terminate()).map_err(EngineError::SignalInstall)?;

        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = interrupt.recv() => "SIGINT",
                    Some(()) = terminate.recv() => "SIGTERM",
                    else => break,
                };
                if shutdown.request(Trigger::Signal) {
                    info!(signal = name, "received signal, starting graceful shutdown");
                } else {
                    debug!(signal = name, "shutdown already requested");
                }
            }
        }))
    }

    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if shutdown.request(Trigger::Signal) {
                    info!("received Ctrl-C, starting graceful shutdown");
                }
            }
        }))
    }
}

/// What the shutdown path did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShutdownOutcome {
    pub trigger: Trigger,
    pub cancelled: usize,
    pub drained: bool,
    /// In-flight work finished or was aborted before `down` ran.
    pub settled: bool,
    pub checkpoint_saved: bool,
}

/// Drives `ShuttingDown → Terminated` for one run.
pub(crate) struct ShutdownController<'a> {
    ctx: &'a RunContext,
    registry: &'a TaskRegistry,
    drain_timeout: Duration,
}

impl<'a> ShutdownController<'a> {
    pub(crate) fn new(ctx: &'a RunContext, registry: &'a TaskRegistry, drain_timeout: Duration) -> Self {
        Self {
            ctx,
            registry,
            drain_timeout,
        }
    }

    /// Cancel queued work, wait for in-flight handles, checkpoint, then `down()`.
    pub(crate) async fn run(&self, pool: &WorkerPool, loader: &mut dyn DataLoader) -> ShutdownOutcome {
        let trigger = self.ctx.signal.trigger().unwrap_or(Trigger::Signal);
        info!(?trigger, "shutting down");

        pool.request_shutdown();
        let cancelled = self.registry.cancel_all();
        self.ctx.outstanding.sub(cancelled);
        debug!(cancelled, in_flight = self.ctx.outstanding.get(), "queued tasks cancelled");

        // in-flight handles get drain_timeout to finish; stragglers are aborted
        let drained = tokio::time::timeout(self.drain_timeout, self.ctx.outstanding.wait_idle())
            .await
            .is_ok();
        let settled = drained || self.abort_stragglers().await;

        let checkpoint_saved = match trigger {
            Trigger::Signal => self.checkpoint(loader),
            Trigger::Handler => {
                debug!("stop requested by handler, skipping checkpoint");
                false
            }
        };

        self.ctx.down(Termination::Shutdown { trigger }).await;
        self.ctx.signal.complete();

        ShutdownOutcome {
            trigger,
            cancelled,
            drained,
            settled,
            checkpoint_saved,
        }
    }

    /// Abort `handle` calls still running after the drain timeout.
    ///
    /// Their items stay out of the done list, so the checkpoint lists them
    /// as remaining.
    async fn abort_stragglers(&self) -> bool {
        let aborted = self.ctx.abort_in_flight();
        warn!(
            aborted,
            timeout_secs = self.drain_timeout.as_secs_f64(),
            "drain timed out, in-flight handles aborted"
        );
        let settled = tokio::time::timeout(ABORT_GRACE, self.ctx.outstanding.wait_idle())
            .await
            .is_ok();
        if !settled {
            error!(
                in_flight = self.ctx.outstanding.get(),
                "aborted handles did not unwind in time"
            );
        }
        settled
    }

    fn checkpoint(&self, loader: &mut dyn DataLoader) -> bool {
        let Some(progress) = loader.as_progress() else {
            debug!("loader does not support checkpoints");
            return false;
        };
        let done = self.ctx.done.snapshot();
        match progress.save(&done) {
            Ok(()) => {
                info!(done = done.len(), "checkpoint saved");
                true
            }
            Err(e) => {
                error!(error = %e, "checkpoint save failed");
                false
            }
        }
    }
}
