//! Bounded task pool with per-task retry and timeout.
//!
//! The pool knows nothing about what a task does: it queues typed payloads,
//! runs at most `size` of them at once through a caller-supplied handler, and
//! reports one [`TaskResult`] per submitted task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;

use shipr_core::config::PoolSettings;
use shipr_core::error::ShiprError;

/// Pool-assigned task identifier, increasing in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A unit of work: what kind it is, what it operates on, and how urgent it is.
#[derive(Debug, Clone)]
pub struct Task<P> {
    pub kind: String,
    pub payload: P,
    /// Higher runs first.
    pub priority: i32,
}

impl<P> Task<P> {
    pub fn new(kind: impl Into<String>, payload: P) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Tasks allowed to run at once.
    pub size: usize,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Wall-clock budget per attempt.
    pub timeout: Duration,
    /// Cap on how long a rate-limit hint may make a task wait.
    pub max_rate_limit_wait: Duration,
}

impl PoolConfig {
    /// Available parallelism, clamped to 2..=16.
    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .clamp(2, 16)
    }

    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            size: Self::default_size(),
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
            timeout: settings.task_timeout(),
            max_rate_limit_wait: settings.max_rate_limit_wait(),
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default())
    }
}

/// Why a task did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error("{0}")]
    Failed(ShiprError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Outcome of one submitted task. Every submitted task gets exactly one.
#[derive(Debug)]
pub struct TaskResult<T> {
    pub task_id: TaskId,
    pub kind: String,
    pub outcome: Result<T, TaskFailure>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<T> TaskResult<T> {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_message(&self) -> Option<String> {
        self.outcome.as_ref().err().map(ToString::to_string)
    }
}

struct Queued<P> {
    id: TaskId,
    task: Task<P>,
}

pub struct TaskPool<P> {
    config: PoolConfig,
    queue: Vec<Queued<P>>,
    next_id: u64,
}

impl<P> TaskPool<P>
where
    P: Clone + Send + 'static,
{
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            queue: Vec::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn submit(&mut self, task: Task<P>) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.queue.push(Queued { id, task });
        id
    }

    pub fn submit_many(&mut self, tasks: impl IntoIterator<Item = Task<P>>) -> Vec<TaskId> {
        tasks.into_iter().map(|task| self.submit(task)).collect()
    }

    /// Tasks waiting for the next run.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run every queued task; results come back in submission order.
    pub async fn run_all<T, F, Fut>(&mut self, handler: F) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ShiprError>> + Send + 'static,
    {
        self.run_all_with(handler, |_| {}).await
    }

    /// Like [`run_all`](Self::run_all), calling `on_complete` as each task finishes.
    pub async fn run_all_with<T, F, Fut>(
        &mut self,
        handler: F,
        mut on_complete: impl FnMut(&TaskResult<T>),
    ) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ShiprError>> + Send + 'static,
    {
        let mut queue = std::mem::take(&mut self.queue);
        // Stable sort: equal priorities keep submission order.
        queue.sort_by(|a, b| b.task.priority.cmp(&a.task.priority));

        let handler = Arc::new(handler);
        let size = self.config.size.max(1);
        let total = queue.len();
        let mut waiting = queue.into_iter();
        let mut running = JoinSet::new();
        let mut results = Vec::with_capacity(total);

        tracing::debug!("running {total} tasks, at most {size} at a time");

        loop {
            while running.len() < size {
                let Some(Queued { id, task }) = waiting.next() else {
                    break;
                };
                tracing::debug!("dispatching {id} ({}, priority {})", task.kind, task.priority);
                let handler = handler.clone();
                let config = self.config.clone();
                running.spawn(supervise(id, task, handler, config));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok(result) => {
                    on_complete(&result);
                    results.push(result);
                }
                // `supervise` never panics itself; it turns task panics into results.
                Err(e) => tracing::error!("pool supervisor failed: {e}"),
            }
        }

        results.sort_by_key(|r| r.task_id);
        results
    }
}

/// Run one task on its own tokio task so a panic is reported against its id.
async fn supervise<P, T, F, Fut>(
    id: TaskId,
    task: Task<P>,
    handler: Arc<F>,
    config: PoolConfig,
) -> TaskResult<T>
where
    P: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ShiprError>> + Send + 'static,
{
    let started_at = Utc::now();
    let kind = task.kind.clone();
    match tokio::spawn(execute(id, task, handler, config)).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("{id} ({kind}) panicked: {e}");
            TaskResult {
                task_id: id,
                kind,
                outcome: Err(TaskFailure::Panicked(e.to_string())),
                attempts: 1,
                started_at,
                finished_at: Utc::now(),
            }
        }
    }
}

async fn execute<P, T, F, Fut>(
    id: TaskId,
    task: Task<P>,
    handler: Arc<F>,
    config: PoolConfig,
) -> TaskResult<T>
where
    P: Clone,
    F: Fn(P) -> Fut,
    Fut: Future<Output = Result<T, ShiprError>>,
{
    let started_at = Utc::now();
    let mut attempts = 0u32;

    let outcome = loop {
        attempts += 1;
        // Dropping the future on timeout cancels the attempt.
        let attempt = tokio::time::timeout(config.timeout, handler(task.payload.clone())).await;
        let error = match attempt {
            Ok(Ok(value)) => break Ok(value),
            Err(_) => {
                tracing::warn!("{id} ({}) timed out after {:?}", task.kind, config.timeout);
                break Err(TaskFailure::TimedOut(config.timeout));
            }
            Ok(Err(error)) => error,
        };

        if error.is_permanent() || attempts > config.max_retries {
            tracing::warn!("{id} ({}) failed after {attempts} attempt(s): {error}", task.kind);
            break Err(TaskFailure::Failed(error));
        }

        let wait = match error.retry_after() {
            Some(after) => after.min(config.max_rate_limit_wait),
            None => config.retry_delay,
        };
        tracing::warn!(
            "{id} ({}) attempt {attempts} failed: {error}; retrying in {wait:?}",
            task.kind
        );
        tokio::time::sleep(wait).await;
    };

    TaskResult {
        task_id: id,
        kind: task.kind,
        outcome,
        attempts,
        started_at,
        finished_at: Utc::now(),
    }
}
