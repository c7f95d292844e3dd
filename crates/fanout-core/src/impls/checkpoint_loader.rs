//! JsonCheckpointLoader - JSON ファイルを読み、中断時に残りを保存する loader
//!
//! # チェックポイント形式
//! ```json
//! {"saved_at": "2024-05-01T09:05:07Z", "remaining": [[1, 2], {"a": 3}]}
//! ```
//!
//! - チェックポイントがあれば入力ファイルではなくそちらから再開する
//! - `save(done)` は「この run の全アイテム − done」を多重集合として書く
//!   （同じ値のアイテムが複数あっても、done に含まれる数だけ除く）
//! - 書き込みは一時ファイル → rename
//! - 残りが 0 件ならファイルは書かず、既存のチェックポイントを消す
//!   （空のチェックポイントから再開すると次の run が EmptyLoader になる）

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{LoaderError, WorkItem};
use crate::ports::{DataLoader, ProgressLoader};

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDoc {
    saved_at: DateTime<Utc>,
    remaining: Vec<Value>,
}

/// File-backed `ProgressLoader`.
#[derive(Debug)]
pub struct JsonCheckpointLoader {
    items: Vec<Value>,
    cursor: usize,
    checkpoint: PathBuf,
    resumed: bool,
}

impl JsonCheckpointLoader {
    /// Load from `checkpoint` if it exists, otherwise from the JSON array in `input`.
    pub fn open(input: impl AsRef<Path>, checkpoint: impl Into<PathBuf>) -> Result<Self, LoaderError> {
        let checkpoint = checkpoint.into();
        if let Some(items) = read_checkpoint(&checkpoint)? {
            return Ok(Self::resumed(items, checkpoint));
        }

        let input = input.as_ref();
        let value: Value = serde_json::from_slice(&fs::read(input)?)?;
        let Value::Array(items) = value else {
            return Err(LoaderError::Format(format!(
                "{} must contain a JSON array of work items",
                input.display()
            )));
        };
        Ok(Self::fresh(items, checkpoint))
    }

    /// Use `items` unless a checkpoint at `checkpoint` says otherwise.
    pub fn with_items(items: Vec<Value>, checkpoint: impl Into<PathBuf>) -> Result<Self, LoaderError> {
        let checkpoint = checkpoint.into();
        Ok(match read_checkpoint(&checkpoint)? {
            Some(remaining) => Self::resumed(remaining, checkpoint),
            None => Self::fresh(items, checkpoint),
        })
    }

    fn fresh(items: Vec<Value>, checkpoint: PathBuf) -> Self {
        Self {
            items,
            cursor: 0,
            checkpoint,
            resumed: false,
        }
    }

    fn resumed(items: Vec<Value>, checkpoint: PathBuf) -> Self {
        info!(
            path = %checkpoint.display(),
            remaining = items.len(),
            "resuming from checkpoint"
        );
        Self {
            items,
            cursor: 0,
            checkpoint,
            resumed: true,
        }
    }

    /// True when the items came from a checkpoint.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint
    }

    /// Remove this loader's checkpoint after a completed run.
    pub fn clear(&self) -> Result<bool, LoaderError> {
        Self::clear_checkpoint(&self.checkpoint)
    }

    /// Remove the checkpoint at `path`. Returns `false` if there was none.
    pub fn clear_checkpoint(path: impl AsRef<Path>) -> Result<bool, LoaderError> {
        match fs::remove_file(path.as_ref()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Items of this run minus `done`, counted as a multiset.
    fn remaining(&self, done: &[WorkItem]) -> Result<Vec<Value>, LoaderError> {
        let mut done_counts: HashMap<String, usize> = HashMap::new();
        for item in done {
            *done_counts
                .entry(serde_json::to_string(item)?)
                .or_default() += 1;
        }

        let mut remaining = Vec::new();
        for value in &self.items {
            // scalars were skipped by the dispatcher and would be again
            if !(value.is_array() || value.is_object()) {
                continue;
            }
            match done_counts.get_mut(&serde_json::to_string(value)?) {
                Some(n) if *n > 0 => *n -= 1,
                _ => remaining.push(value.clone()),
            }
        }
        Ok(remaining)
    }
}

fn read_checkpoint(path: &Path) -> Result<Option<Vec<Value>>, LoaderError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let doc: CheckpointDoc = serde_json::from_slice(&bytes)?;
    debug!(path = %path.display(), saved_at = %doc.saved_at, "checkpoint found");
    Ok(Some(doc.remaining))
}

impl DataLoader for JsonCheckpointLoader {
    fn next(&mut self) -> Option<Value> {
        let value = self.items.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(value)
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn has_next(&self) -> bool {
        self.cursor < self.items.len()
    }

    fn as_progress(&mut self) -> Option<&mut dyn ProgressLoader> {
        Some(self)
    }
}

impl ProgressLoader for JsonCheckpointLoader {
    fn save(&mut self, done: &[WorkItem]) -> Result<(), LoaderError> {
        let remaining = self.remaining(done)?;
        if remaining.is_empty() {
            self.clear()?;
            info!(path = %self.checkpoint.display(), "nothing left to resume, checkpoint removed");
            return Ok(());
        }

        let doc = CheckpointDoc {
            saved_at: Utc::now(),
            remaining,
        };

        let mut tmp = self.checkpoint.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        fs::rename(&tmp, &self.checkpoint)?;

        info!(
            path = %self.checkpoint.display(),
            remaining = doc.remaining.len(),
            "checkpoint written"
        );
        Ok(())
    }
}
