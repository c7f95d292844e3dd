use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::app::dispatcher::{RunContext, invoke};
use crate::app::registry::TaskHandle;
use crate::domain::WorkItem;

/// One submitted item and its registry handle.
pub(crate) struct Job {
    pub task: Arc<TaskHandle>,
    pub item: WorkItem,
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Fixed-size pool of worker slots.
/// - `submit` never waits; jobs queue up until a slot is free
/// - `request_shutdown()` stops slots from taking further jobs
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub(crate) struct WorkerPool {
    jobs_tx: mpsc::UnboundedSender<Job>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` worker slots sharing one FIFO job queue.
    pub(crate) fn spawn(n: usize, ctx: Arc<RunContext>) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let jobs: JobQueue = Arc::new(Mutex::new(jobs_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let jobs = Arc::clone(&jobs);
            let ctx = Arc::clone(&ctx);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, jobs, ctx, &mut rx).await;
            });
            joins.push(join);
        }

        Self {
            jobs_tx,
            shutdown_tx,
            joins,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.joins.len()
    }

    /// Queue a job. Hands it back if every slot has already exited.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        self.jobs_tx.send(job).map_err(|e| e.0)
    }

    /// Stop taking new jobs. In-flight handler calls are not interrupted.
    pub(crate) fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all slots.
    pub(crate) async fn shutdown_and_join(self) {
        self.request_shutdown();
        drop(self.jobs_tx);
        for j in self.joins {
            let _ = j.await;
        }
    }

    /// Tear the slots down without waiting for in-flight calls.
    pub(crate) fn abort(self) {
        self.request_shutdown();
        for j in &self.joins {
            j.abort();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    jobs: JobQueue,
    ctx: Arc<RunContext>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        // recv は「待つ」可能性があるので select で shutdown と競合させる
        let job = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // 変更が入ったら次のループで判定
                continue;
            }
            job = next_job(&jobs) => job,
        };

        // the queue is closed and empty
        let Some(job) = job else {
            break;
        };

        invoke(&ctx, job, worker_id).await;
    }
    debug!(worker_id, "worker stopped");
}

async fn next_job(jobs: &JobQueue) -> Option<Job> {
    jobs.lock().await.recv().await
}
