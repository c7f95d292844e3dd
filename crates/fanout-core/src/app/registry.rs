//! TaskRegistry - 投入済みタスクのハンドル集合
//!
//! # 学習ポイント
//! - AtomicU8 + compare_exchange による小さな状態機械
//! - 「まだ始まっていないタスクだけをキャンセルする」を CAS 1 回で表現
//!
//! エントリは投入時に追加され、削除されない。
//! shutdown 時は全エントリに cancel を試みる（終了済みなら何もしない）。

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

use crate::domain::TaskState;

/// Cancellable handle for one submitted item.
#[derive(Debug)]
pub struct TaskHandle {
    seq: u64,
    state: AtomicU8,
}

impl TaskHandle {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            state: AtomicU8::new(TaskState::Queued as u8),
        }
    }

    /// Submission sequence number (pull order).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Cancel the task if it has not started yet.
    ///
    /// Returns `true` only when this call moved the task to `Cancelled`.
    /// Cancelling a running or finished task is a no-op.
    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Queued, TaskState::Cancelled)
    }

    /// Claim the task for a worker slot. Fails if it was cancelled first.
    pub(crate) fn try_start(&self) -> bool {
        self.transition(TaskState::Queued, TaskState::Running)
    }

    /// A claimed task that will not call `handle` after all.
    pub(crate) fn abandon(&self) -> bool {
        self.transition(TaskState::Running, TaskState::Cancelled)
    }

    pub(crate) fn finish(&self) -> bool {
        self.transition(TaskState::Running, TaskState::Finished)
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Every handle submitted during one run.
///
/// Only the dispatcher adds entries and only the shutdown path cancels them,
/// both on the task that called `work()`.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    handles: Vec<Arc<TaskHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self) -> Arc<TaskHandle> {
        let handle = Arc::new(TaskHandle::new(self.handles.len() as u64));
        self.handles.push(Arc::clone(&handle));
        handle
    }

    /// Attempt cancellation of every entry; returns how many were still queued.
    pub fn cancel_all(&self) -> usize {
        self.handles.iter().filter(|h| h.cancel()).count()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.handles.iter().filter(|h| h.state() == state).count()
    }
}

/// Number of submitted tasks that have not reached a terminal state.
///
/// `watch` lets both the reporter and the shutdown path wait for zero
/// without polling a single task.
#[derive(Debug)]
pub(crate) struct Outstanding {
    tx: watch::Sender<usize>,
}

impl Outstanding {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub(crate) fn add(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    pub(crate) fn done(&self) {
        self.sub(1);
    }

    pub(crate) fn sub(&self, count: usize) {
        if count > 0 {
            self.tx.send_modify(|n| *n = n.saturating_sub(count));
        }
    }

    pub(crate) fn get(&self) -> usize {
        *self.tx.borrow()
    }

    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
