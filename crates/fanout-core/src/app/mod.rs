//! App - アプリケーション層
//!
//! ports を組み合わせて dispatch / shutdown のライフサイクルを実装します。
//!
//! # 主要コンポーネント
//! - **Engine**: `work()` の入口。検証 → 投入 → 待機 → 終了処理
//! - **Dispatcher**: loader からの pull と pool への投入
//! - **WorkerPool**: 固定数の worker slot
//! - **TaskRegistry / DoneList**: run ごとの投入済みハンドルと完了リスト
//! - **ProgressReporter**: 定期的な進捗表示
//! - **ShutdownController**: シグナル / handler 起点のグレースフルシャットダウン

pub mod config;
pub(crate) mod dispatcher;
pub mod done_list;
pub mod engine;
pub(crate) mod pool;
pub mod registry;
pub mod reporter;
pub mod shutdown;
pub mod status;

// 主要な型を再エクスポート
pub use self::config::EngineConfig;
pub use self::done_list::DoneList;
pub use self::engine::Engine;
pub use self::registry::{TaskHandle, TaskRegistry};
pub use self::reporter::{ProgressReporter, ProgressSnapshot, ReportTemplate};
pub use self::shutdown::{ShutdownHandle, ShutdownSignal};
pub use self::status::WorkReport;
