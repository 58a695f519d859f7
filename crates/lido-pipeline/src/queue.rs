//! Named priority queues and the task records behind opaque handles.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lido_core::JobStatus;
use lido_storage::{Store, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::info;
use uuid::Uuid;

/// Queues a worker drains, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    High,
    Normal,
    Low,
    Maintenance,
}

impl QueueName {
    pub const CLAIM_ORDER: [QueueName; 4] = [
        QueueName::High,
        QueueName::Normal,
        QueueName::Low,
        QueueName::Maintenance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "scraping-high",
            Self::Normal => "scraping",
            Self::Low => "scraping-low",
            Self::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn queue(self) -> QueueName {
        match self {
            Self::High => QueueName::High,
            Self::Normal => QueueName::Normal,
            Self::Low => QueueName::Low,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "normal" | "" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(QueueError::UnknownPriority(other.to_string())),
        }
    }
}

/// Work a task carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Scrape { job_id: i64 },
    DuplicateScan,
    CandidateCleanup,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scrape { .. } => "scrape",
            Self::DuplicateScan => "duplicate_scan",
            Self::CandidateCleanup => "candidate_cleanup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub handle: String,
    pub queue: QueueName,
    pub kind: TaskKind,
    pub state: TaskState,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub meta: BTreeMap<String, JsonValue>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Status surface for an opaque handle. Unknown handles resolve to
/// `queue_state == "not_found"` instead of an error.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub queue_state: String,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub meta: BTreeMap<String, JsonValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    fn not_found() -> Self {
        Self {
            queue_state: "not_found".to_string(),
            result: None,
            error: None,
            meta: BTreeMap::new(),
            started_at: None,
            ended_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    JobNotFound(i64),
    #[error("job {id} is {status}, only pending jobs can be enqueued")]
    JobNotPending { id: i64, status: &'static str },
    #[error("unknown priority: {0}")]
    UnknownPriority(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Default)]
struct QueueInner {
    queues: HashMap<QueueName, VecDeque<String>>,
    tasks: HashMap<String, TaskRecord>,
}

/// In-process gateway over the named queues. Enqueue/status/cancel/stats
/// for callers, claim/resolve for the worker pool.
pub struct TaskQueue {
    store: Arc<dyn Store>,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// Queue a scrape task for a job that must still be `pending`.
    /// Returns the opaque task handle.
    pub async fn enqueue_scrape(
        &self,
        job_id: i64,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;
        if job.status != JobStatus::Pending {
            return Err(QueueError::JobNotPending {
                id: job_id,
                status: job.status.as_str(),
            });
        }
        let mut meta = BTreeMap::new();
        meta.insert("db_job_id".to_string(), JsonValue::from(job_id));
        let handle = self
            .push(priority.queue(), TaskKind::Scrape { job_id }, meta)
            .await;
        info!(job_id, handle = %handle, queue = priority.queue().as_str(), "scrape task enqueued");
        Ok(handle)
    }

    /// Scheduler- and operator-originated work goes to the maintenance
    /// queue.
    pub async fn enqueue_maintenance(&self, kind: TaskKind) -> String {
        let mut meta = BTreeMap::new();
        meta.insert("task".to_string(), JsonValue::from(kind.label()));
        let handle = self.push(QueueName::Maintenance, kind, meta).await;
        info!(handle = %handle, "maintenance task enqueued");
        handle
    }

    async fn push(
        &self,
        queue: QueueName,
        kind: TaskKind,
        meta: BTreeMap<String, JsonValue>,
    ) -> String {
        let handle = Uuid::new_v4().to_string();
        let record = TaskRecord {
            handle: handle.clone(),
            queue,
            kind,
            state: TaskState::Queued,
            result: None,
            error: None,
            meta,
            enqueued_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(handle.clone(), record);
        inner.queues.entry(queue).or_default().push_back(handle.clone());
        drop(inner);
        self.notify.notify_one();
        handle
    }

    /// Latest task handle correlated with a job, if any.
    pub async fn task_for_job(&self, job_id: i64) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|t| t.kind == TaskKind::Scrape { job_id })
            .max_by_key(|t| t.enqueued_at)
            .map(|t| t.handle.clone())
    }

    /// Never fails; unknown handles report `not_found`.
    pub async fn status(&self, handle: &str) -> TaskStatus {
        let inner = self.inner.lock().await;
        match inner.tasks.get(handle) {
            Some(task) => TaskStatus {
                queue_state: task.state.as_str().to_string(),
                result: task.result.clone(),
                error: task.error.clone(),
                meta: task.meta.clone(),
                started_at: task.started_at,
                ended_at: task.ended_at,
            },
            None => TaskStatus::not_found(),
        }
    }

    /// Fail-closed cancellation: succeeds only while the task is still
    /// queued. A claimed task runs to completion.
    pub async fn cancel(&self, handle: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(handle) else {
            return false;
        };
        if task.state != TaskState::Queued {
            return false;
        }
        task.state = TaskState::Cancelled;
        task.ended_at = Some(Utc::now());
        let queue = task.queue;
        if let Some(deque) = inner.queues.get_mut(&queue) {
            deque.retain(|h| h != handle);
        }
        true
    }

    /// Per-queue counters for observability.
    pub async fn stats(&self) -> BTreeMap<String, QueueStats> {
        let inner = self.inner.lock().await;
        let mut out: BTreeMap<String, QueueStats> = QueueName::CLAIM_ORDER
            .iter()
            .map(|q| (q.as_str().to_string(), QueueStats::default()))
            .collect();
        for task in inner.tasks.values() {
            let Some(stats) = out.get_mut(task.queue.as_str()) else {
                continue;
            };
            match task.state {
                TaskState::Queued => stats.queued += 1,
                TaskState::Started => stats.started += 1,
                TaskState::Finished => stats.finished += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => {}
            }
        }
        out
    }

    /// Pop the next task in priority order and mark it started.
    pub async fn claim_next(&self) -> Option<TaskRecord> {
        let mut inner = self.inner.lock().await;
        for queue in QueueName::CLAIM_ORDER {
            while let Some(handle) = inner.queues.entry(queue).or_default().pop_front() {
                let Some(task) = inner.tasks.get_mut(&handle) else {
                    continue;
                };
                if task.state != TaskState::Queued {
                    continue;
                }
                task.state = TaskState::Started;
                task.started_at = Some(Utc::now());
                return Some(task.clone());
            }
        }
        None
    }

    /// Block until a task is available, then claim it.
    pub async fn next_task(&self) -> TaskRecord {
        loop {
            if let Some(task) = self.claim_next().await {
                return task;
            }
            self.notify.notified().await;
        }
    }

    pub async fn finish(&self, handle: &str, result: JsonValue) {
        self.close(handle, TaskState::Finished, Some(result), None).await;
    }

    pub async fn fail(&self, handle: &str, error: String) {
        self.close(handle, TaskState::Failed, None, Some(error)).await;
    }

    /// A claimed task whose job was cancelled before it ever ran.
    pub async fn mark_cancelled(&self, handle: &str) {
        self.close(handle, TaskState::Cancelled, None, None).await;
    }

    async fn close(
        &self,
        handle: &str,
        state: TaskState,
        result: Option<JsonValue>,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(handle) {
            if task.state == TaskState::Started {
                task.state = state;
                task.result = result;
                task.error = error;
                task.ended_at = Some(Utc::now());
            }
        }
    }
}
