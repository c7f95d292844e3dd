//! Ports - 外部協力者との境界
//!
//! engine が知っているのはここの trait だけです。
//! 具体的な loader / handler は呼び出し側（または `impls`）が提供します。

pub mod handler;
pub mod loader;

pub use self::handler::{StopFlag, TaskHandler};
pub use self::loader::{DataLoader, ProgressLoader};
