//! DataLoader port - 作業アイテムの供給元
//!
//! # 設計原則
//! - pull 型・逐次・ステートフル（`next` で内部位置が進む）
//! - Dispatcher だけが呼ぶ（worker からは触らない）ので `Sync` は要求しない
//! - チェックポイント対応は継承ではなく capability として公開する
//!   （`as_progress()` が `Some` を返す loader だけが `save` できる）

use serde_json::Value;

use crate::domain::{LoaderError, WorkItem};

/// A sequential, stateful source of raw work items.
///
/// Items are raw JSON values; the dispatcher validates their shape.
pub trait DataLoader: Send {
    /// Next raw item, advancing the internal position.
    ///
    /// Only called while `has_next()` is true. Returning `None` anyway ends
    /// dispatch early.
    fn next(&mut self) -> Option<Value>;

    /// Total item count, fixed at construction (or at resume).
    fn size(&self) -> usize;

    /// True while unconsumed items remain.
    fn has_next(&self) -> bool;

    /// Checkpointing capability.
    ///
    /// Loaders that can persist unfinished work return `Some(self)`.
    fn as_progress(&mut self) -> Option<&mut dyn ProgressLoader> {
        None
    }
}

/// A loader that can persist the outstanding items so a later run can resume.
pub trait ProgressLoader: DataLoader {
    /// Persist the complement of `done` (the items that did not complete).
    ///
    /// Called at most once per run, only from the shutdown path, and only
    /// when the stop came from outside the handler.
    fn save(&mut self, done: &[WorkItem]) -> Result<(), LoaderError>;
}
