//! Impls - ports の参照実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryLoader**: メモリ上の値を順に返す DataLoader
//! - **JsonCheckpointLoader**: JSON ファイル + チェックポイントの ProgressLoader
//!
//! handler は利用者側の責務なので、ここには置きません。

pub mod checkpoint_loader;
pub mod memory_loader;

pub use self::checkpoint_loader::JsonCheckpointLoader;
pub use self::memory_loader::InMemoryLoader;
