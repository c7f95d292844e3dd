//! Work items: the unit of input passed from a loader to a handler.
//!
//! A loader yields raw `serde_json::Value`s. The dispatcher accepts only two
//! shapes, positional (JSON array) and named (JSON object); anything else is a
//! malformed item and is skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The shape of a work item, fixed by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemShape {
    Positional,
    Named,
}

/// One unit of work.
///
/// Immutable once produced. Serialized untagged, so a checkpoint file holds
/// plain JSON arrays and objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkItem {
    /// Ordered positional parameters.
    Positional(Vec<Value>),
    /// Named parameters.
    Named(Map<String, Value>),
}

impl WorkItem {
    pub fn shape(&self) -> ItemShape {
        match self {
            WorkItem::Positional(_) => ItemShape::Positional,
            WorkItem::Named(_) => ItemShape::Named,
        }
    }

    /// Positional parameter at `index`; `None` for named items.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        match self {
            WorkItem::Positional(args) => args.get(index),
            WorkItem::Named(_) => None,
        }
    }

    /// Named parameter `key`; `None` for positional items.
    pub fn param(&self, key: &str) -> Option<&Value> {
        match self {
            WorkItem::Positional(_) => None,
            WorkItem::Named(params) => params.get(key),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WorkItem::Positional(args) => args.len(),
            WorkItem::Named(params) => params.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A raw value that is neither a sequence nor a mapping.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("work item must be a sequence or a mapping, got `{0}`")]
pub struct MalformedItem(pub Value);

impl TryFrom<Value> for WorkItem {
    type Error = MalformedItem;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(args) => Ok(WorkItem::Positional(args)),
            Value::Object(params) => Ok(WorkItem::Named(params)),
            other => Err(MalformedItem(other)),
        }
    }
}

impl From<WorkItem> for Value {
    fn from(item: WorkItem) -> Self {
        match item {
            WorkItem::Positional(args) => Value::Array(args),
            WorkItem::Named(params) => Value::Object(params),
        }
    }
}
