use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::AbortHandle;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: Ulid,
    pub label: String,
    pub status: TaskStatus,
    pub cancellable: bool,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    NotFound(Ulid),
    NotCancellable(Ulid),
    Cancelled,
    Failed(String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::NotFound(id) => write!(f, "task not found: {id}"),
            TaskError::NotCancellable(id) => {
                write!(f, "task {id} cannot be cancelled in its current state")
            }
            TaskError::Cancelled => write!(f, "task was cancelled"),
            TaskError::Failed(msg) => write!(f, "task failed: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

struct Entry {
    info: TaskInfo,
    abort: Option<AbortHandle>,
}

type Registry = Arc<DashMap<Ulid, Entry>>;

/// Bounded worker pool with a queryable registry of submitted jobs.
///
/// At most `workers` jobs run at once; the rest wait queued. Finished entries
/// stay visible until `cleanup`.
#[derive(Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    registry: Registry,
    workers: usize,
}

impl TaskPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            registry: Arc::new(DashMap::new()),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn submit<F, T, E>(&self, label: &str, cancellable: bool, job: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let id = Ulid::new();
        self.registry.insert(
            id,
            Entry {
                info: TaskInfo {
                    id,
                    label: label.to_string(),
                    status: TaskStatus::Queued,
                    cancellable,
                    submitted_at: Utc::now(),
                    finished_at: None,
                    result: None,
                    error: None,
                },
                abort: None,
            },
        );

        let (tx, rx) = oneshot::channel();
        let registry = self.registry.clone();
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if !transition(&registry, id, |info| {
                info.status = TaskStatus::Running;
            }) {
                return;
            }

            let outcome = AssertUnwindSafe(job).catch_unwind().await;
            let delivered = match outcome {
                Ok(Ok(value)) => {
                    let json = serde_json::to_value(&value).ok();
                    let recorded = transition(&registry, id, |info| {
                        info.status = TaskStatus::Completed;
                        info.result = json;
                        info.finished_at = Some(Utc::now());
                    });
                    recorded.then_some(Ok(value))
                }
                Ok(Err(e)) => {
                    let msg = e.to_string();
                    let recorded = transition(&registry, id, |info| {
                        info.status = TaskStatus::Failed;
                        info.error = Some(msg.clone());
                        info.finished_at = Some(Utc::now());
                    });
                    recorded.then_some(Err(TaskError::Failed(msg)))
                }
                Err(_) => {
                    tracing::error!(task_id = %id, "task panicked");
                    transition(&registry, id, |info| {
                        info.status = TaskStatus::Failed;
                        info.error = Some("task panicked".into());
                        info.finished_at = Some(Utc::now());
                    });
                    Some(Err(TaskError::Failed("task panicked".into())))
                }
            };
            if let Some(result) = delivered {
                let _ = tx.send(result);
            }
        });

        if let Some(mut entry) = self.registry.get_mut(&id) {
            entry.abort = Some(handle.abort_handle());
        }

        TaskHandle {
            id,
            pool: self.clone(),
            rx,
        }
    }

    pub fn status(&self, id: Ulid) -> Option<TaskInfo> {
        self.registry.get(&id).map(|e| e.info.clone())
    }

    /// All known tasks, oldest first.
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.registry.iter().map(|e| e.info.clone()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Cancel a queued or running task that was submitted as cancellable.
    pub fn cancel(&self, id: Ulid) -> Result<(), TaskError> {
        let mut entry = self.registry.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        if !entry.info.cancellable || entry.info.status.is_finished() {
            return Err(TaskError::NotCancellable(id));
        }
        entry.info.status = TaskStatus::Cancelled;
        entry.info.finished_at = Some(Utc::now());
        if let Some(abort) = entry.abort.take() {
            abort.abort();
        }
        tracing::info!(task_id = %id, label = %entry.info.label, "task cancelled");
        Ok(())
    }

    /// Forget finished tasks. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let before = self.registry.len();
        self.registry.retain(|_, e| !e.info.status.is_finished());
        before - self.registry.len()
    }

    pub fn active_count(&self) -> usize {
        self.registry
            .iter()
            .filter(|e| !e.info.status.is_finished())
            .count()
    }

    /// Wait up to `timeout` for queued and running jobs to finish.
    /// Returns how many were still active when it gave up.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let remaining = self.active_count();
            if remaining == 0 {
                return 0;
            }
            tokio::select! {
                _ = &mut deadline => return remaining,
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
    }
}

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Apply `f` unless the task was cancelled. Returns whether it applied.
fn transition(registry: &Registry, id: Ulid, f: impl FnOnce(&mut TaskInfo)) -> bool {
    match registry.get_mut(&id) {
        Some(mut entry) if entry.info.status != TaskStatus::Cancelled => {
            f(&mut entry.info);
            true
        }
        _ => false,
    }
}

/// Poll, cancel, or await one submitted job.
pub struct TaskHandle<T> {
    id: Ulid,
    pool: TaskPool,
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.pool.status(self.id).map(|info| info.status)
    }

    pub fn cancel(&self) -> Result<(), TaskError> {
        self.pool.cancel(self.id)
    }

    pub async fn result(self) -> Result<T, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_result_is_returned_and_recorded() {
        let pool = TaskPool::new(2);
        let handle = pool.submit("sum", true, async { Ok::<_, String>(40 + 2) });
        let id = handle.id();
        assert_eq!(handle.result().await, Ok(42));

        let info = pool.status(id).unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert_eq!(info.result, Some(serde_json::json!(42)));
        assert!(info.finished_at.is_some());
    }

    #[tokio::test]
    async fn failure_is_recorded() {
        let pool = TaskPool::new(1);
        let handle = pool.submit("boom", true, async { Err::<(), _>("disk full") });
        let id = handle.id();
        assert_eq!(
            handle.result().await,
            Err(TaskError::Failed("disk full".into()))
        );
        assert_eq!(pool.status(id).unwrap().error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn cancel_running_task() {
        let pool = TaskPool::new(1);
        let handle = pool.submit("slow", true, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, String>(())
        });
        handle.cancel().unwrap();
        assert_eq!(handle.status(), Some(TaskStatus::Cancelled));
        assert_eq!(handle.result().await, Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn non_cancellable_task_refuses_cancel() {
        let pool = TaskPool::new(1);
        let handle = pool.submit("settle", false, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, String>("done")
        });
        assert_eq!(handle.cancel(), Err(TaskError::NotCancellable(handle.id())));
        assert_eq!(handle.result().await, Ok("done"));
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pool = TaskPool::new(1);
        let first = pool.submit("first", true, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(1)
        });
        let second = pool.submit("second", true, async { Ok::<_, String>(2) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(second.status(), Some(TaskStatus::Queued));
        assert_eq!(first.result().await, Ok(1));
        assert_eq!(second.result().await, Ok(2));
    }

    #[tokio::test]
    async fn drain_waits_for_running_jobs() {
        let pool = TaskPool::new(2);
        let handle = pool.submit("settle", false, async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<_, String>("settled")
        });
        assert_eq!(pool.drain(Duration::from_secs(5)).await, 0);
        assert_eq!(handle.status(), Some(TaskStatus::Completed));
        assert_eq!(handle.result().await, Ok("settled"));
    }

    #[tokio::test]
    async fn drain_gives_up_at_the_deadline() {
        let pool = TaskPool::new(1);
        let _stuck = pool.submit("stuck", true, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, String>(())
        });
        let _queued = pool.submit("queued", true, async { Ok::<_, String>(()) });
        assert_eq!(pool.drain(Duration::from_millis(50)).await, 2);
    }

    #[test]
    fn worker_count_is_at_least_one() {
        assert_eq!(TaskPool::new(4).workers(), 4);
        assert_eq!(TaskPool::new(0).workers(), 1);
    }

    #[tokio::test]
    async fn cleanup_forgets_finished_tasks() {
        let pool = TaskPool::new(2);
        pool.submit("a", true, async { Ok::<_, String>(()) })
            .result()
            .await
            .unwrap();
        let _pending = pool.submit("b", true, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, String>(())
        });
        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.list().len(), 1);
        assert_eq!(pool.active_count(), 1);
        assert!(matches!(pool.cancel(Ulid::new()), Err(TaskError::NotFound(_))));
    }
}
