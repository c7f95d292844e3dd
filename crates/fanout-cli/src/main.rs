//! fanout CLI - JSON ファイルのアイテムを並列に処理するデモ
//!
//! - `fanout run --input items.json --checkpoint ckpt.json`
//!   SIGINT / SIGTERM で中断すると残りを ckpt.json に保存し、次回はそこから再開
//! - `fanout demo`
//!   `[i, i+1]` (i = 0..200) を流し、先頭が 30 以上のものだけ数える（170 と表示）

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fanout_core::impls::{InMemoryLoader, JsonCheckpointLoader};
use fanout_core::{
    Engine, EngineConfig, HandlerError, StopFlag, TaskHandler, Termination, WorkItem, WorkReport,
};

#[derive(Parser)]
#[command(name = "fanout", about = "Fan work items out over a worker pool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a JSON array of work items, resuming from a checkpoint if present
    Run {
        /// JSON file holding an array of items (arrays or objects)
        #[arg(long)]
        input: PathBuf,
        /// Where unfinished items are saved on SIGINT / SIGTERM
        #[arg(long, default_value = "fanout.checkpoint.json")]
        checkpoint: PathBuf,
        /// Worker slots (overrides FANOUT_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Progress line template, e.g. "[{time}] {done}/{total} {percent:.1%}"
        #[arg(long)]
        report: Option<String>,
        /// Seconds between progress lines
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// Only keep items whose first value is at least this
        #[arg(long)]
        min_first: Option<i64>,
        /// Ask the engine to stop once an item's first value reaches this
        #[arg(long)]
        stop_at: Option<i64>,
        /// Simulated work per item
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Run the built-in 200-item scenario
    Demo {
        #[arg(long, default_value_t = 10)]
        workers: usize,
    },
}

/// Keeps items whose first value passes `min_first` and prints the count in `down`.
struct FilterHandler {
    min_first: Option<i64>,
    stop_at: Option<i64>,
    delay: Duration,
    kept: Mutex<Vec<WorkItem>>,
    stop: StopFlag,
}

impl FilterHandler {
    fn new(min_first: Option<i64>, stop_at: Option<i64>, delay: Duration) -> Self {
        Self {
            min_first,
            stop_at,
            delay,
            kept: Mutex::new(Vec::new()),
            stop: StopFlag::new(),
        }
    }

    fn kept(&self) -> usize {
        self.kept.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn first_value(item: &WorkItem) -> Option<i64> {
    item.arg(0)
        .or_else(|| item.param("first"))
        .and_then(Value::as_i64)
}

#[async_trait]
impl TaskHandler for FilterHandler {
    async fn handle(&self, item: &WorkItem) -> Result<(), HandlerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let first = first_value(item);
        if let (Some(stop_at), Some(first)) = (self.stop_at, first) {
            if first >= stop_at {
                self.shutdown();
                return Err(HandlerError::permanent(format!(
                    "first value {first} reached stop threshold {stop_at}"
                )));
            }
        }

        let keep = match self.min_first {
            Some(min) => first.is_some_and(|f| f >= min),
            None => true,
        };
        if keep {
            self.kept
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item.clone());
        }
        Ok(())
    }

    async fn down(&self, termination: Termination) {
        info!(?termination, kept = self.kept(), "handler down");
        println!("{}", self.kept());
    }

    fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }
}

fn log_report(report: &WorkReport) -> anyhow::Result<()> {
    info!(report = %serde_json::to_string(report)?, "work report");
    Ok(())
}

async fn run(
    input: PathBuf,
    checkpoint: PathBuf,
    workers: Option<usize>,
    report: Option<String>,
    interval: f64,
    handler: FilterHandler,
) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env().context("reading FANOUT_* environment")?;
    if let Some(workers) = workers {
        config = config.with_workers(workers);
    }

    let loader = JsonCheckpointLoader::open(&input, checkpoint.clone())
        .with_context(|| format!("loading {}", input.display()))?;
    if loader.is_resumed() {
        info!(path = %checkpoint.display(), "resuming an interrupted run");
    }

    let mut engine = Engine::new(config)?;
    engine.set_loader(loader);
    engine.set_handler(Arc::new(handler));
    if let Some(template) = report {
        engine.register_progress_report(&template, interval)?;
    }

    let report = engine.work().await?;
    log_report(&report)?;

    if report.termination == Termination::Completed
        && JsonCheckpointLoader::clear_checkpoint(&checkpoint)?
    {
        info!(path = %checkpoint.display(), "run completed, checkpoint removed");
    }
    Ok(())
}

async fn demo(workers: usize) -> anyhow::Result<()> {
    let items = (0..200).map(|i| json!([i, i + 1]));

    let mut engine = Engine::new(EngineConfig::from_env()?.with_workers(workers))?;
    engine.set_loader(InMemoryLoader::from_values(items));
    engine.set_handler(Arc::new(FilterHandler::new(Some(30), None, Duration::ZERO)));

    let report = engine.work().await?;
    log_report(&report)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Run {
            input,
            checkpoint,
            workers,
            report,
            interval,
            min_first,
            stop_at,
            delay_ms,
        } => {
            let handler = FilterHandler::new(min_first, stop_at, Duration::from_millis(delay_ms));
            run(input, checkpoint, workers, report, interval, handler).await
        }
        Command::Demo { workers } => demo(workers).await,
    }
}
