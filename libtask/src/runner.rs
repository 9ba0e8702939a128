use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::time::{Duration, interval, timeout};
use tracing::{debug, warn};

use crate::context::TaskContext;
use crate::models::{Progress, Task, TaskError, TaskOptions, TaskStatus, now_ms};

#[derive(Clone, Debug)]
pub struct TaskRunnerConfig {
    /// Number of tasks allowed to run in parallel.
    pub workers: usize,
    /// Extra submissions accepted beyond the running ones before
    /// `submit` blocks. Zero means block until a worker is free.
    pub queue: usize,
    /// How long terminal tasks linger before the sweep prunes them.
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue: 0,
            retention: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

struct SlotState {
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    updated_at: i64,
}

struct TaskSlot {
    id: String,
    name: String,
    group: String,
    created_at: i64,
    ctx: TaskContext,
    state: std::sync::Mutex<SlotState>,
    status_tx: watch::Sender<TaskStatus>,
}

impl TaskSlot {
    fn transition(&self, status: TaskStatus, result: Option<serde_json::Value>, error: Option<String>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.result = result;
            state.error = error;
            state.updated_at = now_ms();
        }
        self.status_tx.send_replace(status);
    }

    fn snapshot(&self) -> Task {
        let state = self.state.lock().unwrap();
        let progress = self.ctx.snapshot();
        Task {
            id: self.id.clone(),
            status: state.status,
            progress: Progress {
                loaded: progress.loaded,
                total: progress.total,
            },
            result: state.result.clone(),
            error: state.error.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
            name: self.name.clone(),
            group: self.group.clone(),
        }
    }
}

struct RunnerInner {
    tasks: RwLock<HashMap<String, Arc<TaskSlot>>>,
    sem: Arc<Semaphore>,
    retention: Duration,
    shutdown_tx: watch::Sender<bool>,
}

/// Bounded worker pool with task lifecycle, cancellation and a
/// retention sweep for terminal tasks.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    pub fn new(config: TaskRunnerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let runner = Self {
            inner: Arc::new(RunnerInner {
                tasks: RwLock::new(HashMap::new()),
                sem: Arc::new(Semaphore::new(config.workers + config.queue)),
                retention: config.retention,
                shutdown_tx,
            }),
        };
        runner.run_sweep(config.sweep_interval);
        runner
    }

    fn run_sweep(&self, every: Duration) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut timer = interval(every);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        Self::sweep_expired(&inner).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("task sweep stopped");
                        return;
                    }
                }
            }
        });
    }

    async fn sweep_expired(inner: &RunnerInner) {
        let cutoff = now_ms() - inner.retention.as_millis() as i64;
        let mut tasks = inner.tasks.write().await;
        tasks.retain(|id, slot| {
            let state = slot.state.lock().unwrap();
            let expired = state.status.is_terminal() && state.updated_at <= cutoff;
            if expired {
                debug!(task = %id, "pruning terminal task");
            }
            !expired
        });
    }

    /// Submit a runnable. Blocks while all workers (plus the configured
    /// queue slack) are busy, then returns the task snapshot.
    pub async fn submit<F, Fut>(&self, options: TaskOptions, f: F) -> Result<Task, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        options.validate()?;
        let id = uuid::Uuid::new_v4().to_string();
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        let slot = Arc::new(TaskSlot {
            id: id.clone(),
            name: options.name,
            group: options.group,
            created_at: now_ms(),
            ctx: TaskContext::new(),
            state: std::sync::Mutex::new(SlotState {
                status: TaskStatus::Pending,
                result: None,
                error: None,
                updated_at: now_ms(),
            }),
            status_tx,
        });
        self.inner
            .tasks
            .write()
            .await
            .insert(id.clone(), slot.clone());

        let permit = match self.inner.sem.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // The slot never ran; leaving it would keep a
                // non-terminal task the sweep can never prune.
                self.inner.tasks.write().await.remove(&id);
                return Err(TaskError::ShutDown);
            }
        };

        let worker_slot = slot.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if worker_slot.ctx.canceled() {
                worker_slot.transition(TaskStatus::Canceled, None, None);
                return;
            }
            worker_slot.transition(TaskStatus::Running, None, None);
            let ctx = worker_slot.ctx.clone();
            match f(ctx).await {
                Ok(result) => {
                    worker_slot.transition(TaskStatus::Done, Some(result), None);
                }
                Err(e) if worker_slot.ctx.canceled() => {
                    debug!(task = %worker_slot.id, error = %e, "task canceled");
                    worker_slot.transition(TaskStatus::Canceled, None, None);
                }
                Err(e) => {
                    warn!(task = %worker_slot.id, error = %e, "task failed");
                    worker_slot.transition(TaskStatus::Error, None, Some(e));
                }
            }
        });

        Ok(slot.snapshot())
    }

    /// Submit and wait up to `wait` for completion. Returns the latest
    /// snapshot whether or not the task finished in time.
    pub async fn execute_and_wait<F, Fut>(
        &self,
        options: TaskOptions,
        f: F,
        wait: Duration,
    ) -> Result<Task, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let task = self.submit(options, f).await?;
        let _ = self.wait(&task.id, wait).await;
        self.get(&task.id)
            .await
            .ok_or_else(|| TaskError::NotFound(task.id))
    }

    /// Wait up to `wait` for the task to reach a terminal state.
    /// Returns `true` if it did.
    pub async fn wait(&self, id: &str, wait: Duration) -> bool {
        let slot = match self.inner.tasks.read().await.get(id) {
            Some(slot) => slot.clone(),
            None => return false,
        };
        let mut rx = slot.status_tx.subscribe();
        let done = timeout(wait, async {
            loop {
                if rx.borrow().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        done.is_ok()
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        let tasks = self.inner.tasks.read().await;
        tasks.get(id).map(|slot| slot.snapshot())
    }

    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.inner.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().map(|slot| slot.snapshot()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Flip the task's cancel flag. The runnable observes it through
    /// `ctx.canceled()` and is expected to return promptly.
    pub async fn stop(&self, id: &str) -> Result<(), TaskError> {
        let tasks = self.inner.tasks.read().await;
        let slot = tasks.get(id).ok_or_else(|| TaskError::NotFound(id.into()))?;
        slot.ctx.cancel();
        Ok(())
    }

    /// Stop and forget a task.
    pub async fn remove(&self, id: &str) -> Result<(), TaskError> {
        let mut tasks = self.inner.tasks.write().await;
        let slot = tasks.remove(id).ok_or_else(|| TaskError::NotFound(id.into()))?;
        slot.ctx.cancel();
        Ok(())
    }

    /// Stop the sweep and refuse new submissions. Running tasks keep
    /// their contexts; callers cancel them individually if needed.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.sem.close();
        let tasks = self.inner.tasks.read().await;
        for slot in tasks.values() {
            slot.ctx.cancel();
        }
    }
}
