//! State - タスクと run の状態
//!
//! - `TaskState`: 投入されたタスク 1 件の状態
//! - `ShutdownState`: プロセス全体の停止フラグ（3 状態）
//! - `Trigger` / `Termination`: 停止のきっかけと run の終わり方

use serde::{Deserialize, Serialize};

/// State of one submitted task.
///
/// State transitions:
/// - Queued -> Running -> Finished
/// - Queued -> Cancelled (never started)
/// - Running -> Cancelled (picked up after shutdown was requested, `handle` not called)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskState {
    /// Waiting in the pool queue.
    Queued = 0,

    /// Claimed by a worker slot.
    Running = 1,

    /// `handle` returned (successfully or not).
    Finished = 2,

    /// `handle` will never run for this task.
    Cancelled = 3,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled)
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Finished,
            _ => TaskState::Cancelled,
        }
    }
}

/// Process-wide shutdown flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ShutdownState {
    NotRequested = 0,
    /// Requested, not yet acted on.
    Requested = 1,
    Completed = 2,
}

impl ShutdownState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ShutdownState::NotRequested,
            1 => ShutdownState::Requested,
            _ => ShutdownState::Completed,
        }
    }
}

/// What started a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Trigger {
    /// SIGINT / SIGTERM, or `ShutdownHandle::request`.
    Signal = 1,
    /// The handler raised its own stop flag.
    Handler = 2,
}

impl Trigger {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Trigger::Signal),
            2 => Some(Trigger::Handler),
            _ => None,
        }
    }
}

/// How a run ended. Passed to `TaskHandler::down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// Every submitted task finished.
    Completed,
    /// The run went through the shutdown path.
    Shutdown { trigger: Trigger },
}

impl Termination {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Termination::Shutdown { .. })
    }

    pub fn trigger(&self) -> Option<Trigger> {
        match self {
            Termination::Completed => None,
            Termination::Shutdown { trigger } => Some(*trigger),
        }
    }
}
