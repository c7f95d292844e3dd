//! DoneList - `handle` が正常終了したアイテムの記録
//!
//! 複数の worker slot から同時に追記されるので Mutex で保護する。
//! 順序は完了順（投入順とは一致しない）。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::WorkItem;

/// Append-only record of completed items. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct DoneList {
    items: Arc<Mutex<Vec<WorkItem>>>,
}

impl DoneList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, item: WorkItem) {
        self.lock().push(item);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the items recorded so far, in completion order.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.lock().clone()
    }

    // A panic while holding the lock cannot leave a half-pushed Vec behind.
    fn lock(&self) -> MutexGuard<'_, Vec<WorkItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
