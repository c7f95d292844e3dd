//! Status - 1 回の `work()` の結果サマリー

use serde::{Deserialize, Serialize};

use crate::domain::{RunId, Termination};

/// Counts and outcome of one `work()` call.
///
/// `done + failed + cancelled` equals `submitted` whenever the pool drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkReport {
    pub run_id: RunId,
    /// `loader.size()` at the start of the run.
    pub total: usize,
    pub submitted: usize,
    /// Items whose handler returned `Ok`.
    pub done: usize,
    /// Malformed items the dispatcher refused.
    pub skipped: usize,
    /// Handler errors and panics.
    pub failed: usize,
    /// Tasks cancelled before their handler started.
    pub cancelled: usize,
    pub termination: Termination,
    pub checkpoint_saved: bool,
}

impl WorkReport {
    pub fn is_complete(&self) -> bool {
        !self.termination.is_shutdown()
    }

    /// Items that were neither done nor refused.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.done + self.skipped)
    }
}
