//! Sub-task dispatch and the worker pool that drains it

use super::{AccessBatchDataProcess, AccessContext};
use crate::error::{AccessError, AccessResult};
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One shard waiting for a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    pub strategy_group_key: String,
    pub sub_task_id: String,
}

#[async_trait]
pub trait SubTaskDispatcher: Send + Sync {
    async fn dispatch(&self, task: SubTask) -> AccessResult<()>;
}

/// In-process dispatch for single-binary deployments
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<SubTask>,
}

impl ChannelDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SubTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SubTaskDispatcher for ChannelDispatcher {
    async fn dispatch(&self, task: SubTask) -> AccessResult<()> {
        self.tx.send(task).await?;
        Ok(())
    }
}

/// Dispatch through a KV list drained by `batch-worker` processes
pub struct KvQueueDispatcher {
    kv: SharedKv,
}

impl KvQueueDispatcher {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl SubTaskDispatcher for KvQueueDispatcher {
    async fn dispatch(&self, task: SubTask) -> AccessResult<()> {
        let encoded = serde_json::to_string(&task)?;
        self.kv.lpush(keys::BATCH_TASK_QUEUE_KEY, &[encoded]).await?;
        Ok(())
    }
}

/// Where workers take sub-tasks from
#[derive(Clone)]
pub enum TaskSource {
    Channel(Arc<Mutex<mpsc::Receiver<SubTask>>>),
    Kv(SharedKv),
}

impl TaskSource {
    pub fn channel(rx: mpsc::Receiver<SubTask>) -> Self {
        TaskSource::Channel(Arc::new(Mutex::new(rx)))
    }

    /// Next task, or `None` after `wait` without one
    async fn next(&self, wait: Duration) -> AccessResult<Option<SubTask>> {
        match self {
            TaskSource::Channel(rx) => {
                let mut rx = rx.lock().await;
                match tokio::time::timeout(wait, rx.recv()).await {
                    Ok(Some(task)) => Ok(Some(task)),
                    Ok(None) => Err(AccessError::Shutdown("sub-task channel closed".to_string())),
                    Err(_) => Ok(None),
                }
            }
            TaskSource::Kv(kv) => match kv.brpop(keys::BATCH_TASK_QUEUE_KEY, wait).await? {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            },
        }
    }
}

/// Fixed set of workers running [`AccessBatchDataProcess`] per sub-task
pub struct BatchWorkerPool {
    ctx: Arc<AccessContext>,
    source: TaskSource,
    workers: usize,
    poll_wait: Duration,
}

impl BatchWorkerPool {
    pub fn new(ctx: Arc<AccessContext>, source: TaskSource, workers: usize) -> Self {
        Self {
            ctx,
            source,
            workers: workers.max(1),
            poll_wait: Duration::from_secs(1),
        }
    }

    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    pub fn spawn(self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "Starting batch workers");
        (0..self.workers)
            .map(|worker| {
                let ctx = Arc::clone(&self.ctx);
                let source = self.source.clone();
                let token = token.clone();
                let wait = self.poll_wait;
                tokio::spawn(async move { run_worker(worker, ctx, source, token, wait).await })
            })
            .collect()
    }
}

async fn run_worker(
    worker: usize,
    ctx: Arc<AccessContext>,
    source: TaskSource,
    token: CancellationToken,
    wait: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = source.next(wait) => next,
        };
        match next {
            Ok(Some(task)) => {
                debug!(worker, sub_task_id = %task.sub_task_id, "Running sub-task");
                let process = AccessBatchDataProcess::new(
                    Arc::clone(&ctx),
                    task.strategy_group_key,
                    task.sub_task_id,
                );
                process.process().await;
            }
            Ok(None) => {}
            Err(AccessError::Shutdown(reason)) => {
                debug!(worker, "Batch worker stopping: {}", reason);
                break;
            }
            Err(e) => {
                warn!(worker, "Failed to take sub-task: {}", e);
                tokio::time::sleep(wait).await;
            }
        }
    }
    debug!(worker, "Batch worker stopped");
}
