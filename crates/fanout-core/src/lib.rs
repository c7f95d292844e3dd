//! fanout-core
//!
//! Parallel dispatch engine: pull work items from a loader, fan them out
//! over a fixed-size worker pool, and shut down gracefully on a signal.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（WorkItem, TaskState, Termination, RunId, errors）
//! - **ports**: 抽象化レイヤー（DataLoader, ProgressLoader, TaskHandler）
//! - **app**: アプリケーションロジック（Engine, Dispatcher, WorkerPool, ShutdownController, など）
//! - **impls**: 実装（InMemoryLoader, JsonCheckpointLoader）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Engine, EngineConfig, ShutdownHandle, WorkReport};
pub use domain::{EngineError, HandlerError, LoaderError, Termination, Trigger, WorkItem};
pub use ports::{DataLoader, ProgressLoader, StopFlag, TaskHandler};
