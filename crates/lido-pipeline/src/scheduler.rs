//! Recurring maintenance triggers on top of a cron scheduler, keyed by
//! stable ids so re-registration replaces instead of duplicating.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use uuid::Uuid;

use crate::queue::{TaskKind, TaskQueue};

pub const SCAN_TASK_ID: &str = "duplicate-scan-job";
pub const CLEANUP_TASK_ID: &str = "duplicate-cleanup-job";

/// Registry of recurring tasks. Every trigger only enqueues onto the
/// maintenance queue; the worker pool does the actual work.
pub struct RecurringTaskRegistry {
    scheduler: JobScheduler,
    queue: Arc<TaskQueue>,
    registered: Mutex<HashMap<String, Uuid>>,
}

impl RecurringTaskRegistry {
    pub async fn new(queue: Arc<TaskQueue>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self {
            scheduler,
            queue,
            registered: Mutex::new(HashMap::new()),
        })
    }

    /// Register `kind` under a stable id. A prior registration with the
    /// same id is removed first, which keeps restarts from stacking up
    /// duplicate triggers.
    pub async fn register(&self, id: &str, cron: &str, kind: TaskKind) -> anyhow::Result<()> {
        let mut registered = self.registered.lock().await;
        if let Some(previous) = registered.remove(id) {
            self.scheduler
                .remove(&previous)
                .await
                .with_context(|| format!("removing previous registration of {id}"))?;
        }

        let queue = self.queue.clone();
        let label = kind.label();
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let queue = queue.clone();
            let kind = kind.clone();
            Box::pin(async move {
                let handle = queue.enqueue_maintenance(kind).await;
                info!(handle = %handle, "scheduled maintenance task enqueued");
            })
        })
        .with_context(|| format!("creating scheduler job {id} for cron {cron}"))?;

        let uuid = self
            .scheduler
            .add(job)
            .await
            .with_context(|| format!("adding scheduler job {id}"))?;
        registered.insert(id.to_string(), uuid);
        info!(id, cron, task = label, "recurring task registered");
        Ok(())
    }

    /// The default maintenance pair: batch dedup scan + candidate cleanup.
    pub async fn register_defaults(
        &self,
        scan_cron: &str,
        cleanup_cron: &str,
    ) -> anyhow::Result<()> {
        self.register(SCAN_TASK_ID, scan_cron, TaskKind::DuplicateScan)
            .await?;
        self.register(CLEANUP_TASK_ID, cleanup_cron, TaskKind::CandidateCleanup)
            .await?;
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.start().await.context("starting scheduler")?;
        Ok(())
    }

    pub async fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registered.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn scheduler_job_id(&self, id: &str) -> Option<Uuid> {
        self.registered.lock().await.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lido_storage::MemoryStore;

    #[tokio::test]
    async fn re_registering_an_id_replaces_the_previous_job() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(store));
        let registry = RecurringTaskRegistry::new(queue).await.unwrap();

        registry
            .register(SCAN_TASK_ID, "0 0 2 * * *", TaskKind::DuplicateScan)
            .await
            .unwrap();
        let first = registry.scheduler_job_id(SCAN_TASK_ID).await.unwrap();

        registry
            .register(SCAN_TASK_ID, "0 30 4 * * *", TaskKind::DuplicateScan)
            .await
            .unwrap();
        let second = registry.scheduler_job_id(SCAN_TASK_ID).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.registered_ids().await, vec![SCAN_TASK_ID.to_string()]);
    }

    #[tokio::test]
    async fn default_registration_covers_scan_and_cleanup() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(store));
        let registry = RecurringTaskRegistry::new(queue).await.unwrap();

        registry
            .register_defaults("0 0 2 * * *", "0 0 3 * * Sun")
            .await
            .unwrap();
        assert_eq!(
            registry.registered_ids().await,
            vec![CLEANUP_TASK_ID.to_string(), SCAN_TASK_ID.to_string()]
        );
    }
}
