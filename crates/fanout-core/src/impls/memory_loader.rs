//! InMemoryLoader - テスト・デモ用の DataLoader

use std::collections::VecDeque;

use serde_json::Value;

use crate::ports::DataLoader;

/// `DataLoader` over values held in memory.
///
/// No checkpoint support: `as_progress()` stays `None`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    items: VecDeque<Value>,
    size: usize,
}

impl InMemoryLoader {
    pub fn from_values(items: impl IntoIterator<Item = Value>) -> Self {
        let items: VecDeque<Value> = items.into_iter().collect();
        Self {
            size: items.len(),
            items,
        }
    }

    /// Items not yet pulled.
    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl FromIterator<Value> for InMemoryLoader {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from_values(iter)
    }
}

impl DataLoader for InMemoryLoader {
    fn next(&mut self) -> Option<Value> {
        self.items.pop_front()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn has_next(&self) -> bool {
        !self.items.is_empty()
    }
}
