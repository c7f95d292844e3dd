//! TaskHandler port - アイテム 1 件の処理と最終集計
//!
//! # 学習ポイント
//! - `async_trait` による async メソッドを持つ trait object
//! - 協調的停止フラグ（`StopFlag`）は handler 自身が持ち、engine は読むだけ

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::domain::{HandlerError, Termination, WorkItem};

/// Cooperative stop flag owned by a handler.
///
/// Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Lower the flag so the handler can be used for another run.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-item processing routine plus final aggregation.
///
/// # 並行性
/// `handle` は複数の worker slot から同時に呼ばれる。
/// handler が共有状態に集計する場合は、handler 側で同期すること。
///
/// # 使用例
/// ```ignore
/// struct Collect {
///     seen: Mutex<Vec<WorkItem>>,
///     stop: StopFlag,
/// }
///
/// #[async_trait]
/// impl TaskHandler for Collect {
///     async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError> {
///         self.seen.lock().unwrap().push(item.clone());
///         Ok(())
///     }
///
///     async fn down(&self, _termination: Termination) {
///         println!("{}", self.seen.lock().unwrap().len());
///     }
///
///     fn stop_flag(&self) -> &StopFlag {
///         &self.stop
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one item. An `Err` keeps the item out of the done list.
    async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError>;

    /// Called exactly once per run, on normal completion or during shutdown.
    async fn down(&self, termination: Termination);

    fn stop_flag(&self) -> &StopFlag;

    /// Request a cooperative stop. Workers check the flag before each `handle`.
    fn shutdown(&self) {
        self.stop_flag().raise();
    }

    fn is_shutdown_requested(&self) -> bool {
        self.stop_flag().is_raised()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop {
        stop: StopFlag,
    }

    #[async_trait]
    impl TaskHandler for Noop {
        async fn handle(&self, _item: &WorkItem) -> Result<(), HandlerError> {
            Ok(())
        }

        async fn down(&self, _termination: Termination) {}

        fn stop_flag(&self) -> &StopFlag {
            &self.stop
        }
    }

    #[test]
    fn shutdown_raises_own_flag() {
        let handler = Noop {
            stop: StopFlag::new(),
        };
        assert!(!handler.is_shutdown_requested());
        handler.shutdown();
        assert!(handler.is_shutdown_requested());
        handler.stop_flag().clear();
        assert!(!handler.is_shutdown_requested());
    }

    #[test]
    fn cloned_flags_share_state() {
        let flag = StopFlag::new();
        let other = flag.clone();
        other.raise();
        assert!(flag.is_raised());
    }
}
