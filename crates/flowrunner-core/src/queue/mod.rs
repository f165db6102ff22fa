//! The logical Work Queue (§4.B): `Enqueue`/`Claim`/`Extend`/`Complete`/
//! `Fail`/`RecoverOrphaned` over a [`StateStore`], with the retry
//! backoff policy applied here rather than inside the store so the
//! store stays a dumb system of record.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::model::{
    NewQueueItem, QueueFailureOutcome, QueueItem, QueuePayload, QueueType, RetryPolicy,
};
use crate::persistence::{ClaimedQueueItem, StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The work-queue façade workers and the trigger ingress talk to; the
/// engine itself enqueues through here too, so the backoff policy is
/// applied in exactly one place. Cheap to clone (an `Arc<S>` and a
/// `Duration`) so each worker-pool background loop can own one.
#[derive(Clone)]
pub struct WorkQueue<S: StateStore> {
    store: std::sync::Arc<S>,
    default_lease: Duration,
}

impl<S: StateStore> WorkQueue<S> {
    pub fn new(store: std::sync::Arc<S>, default_lease: Duration) -> Self {
        Self { store, default_lease }
    }

    /// Enqueues work for a run or step. `priority` follows the run's
    /// configured priority unless overridden.
    pub async fn enqueue(
        &self,
        run_id: Uuid,
        queue_type: QueueType,
        step_id: Option<Uuid>,
        priority: i32,
        max_attempts: u32,
        available_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<QueueItem, QueueError> {
        let item = NewQueueItem {
            run_id,
            queue_type,
            priority,
            available_at: available_at.unwrap_or_else(Utc::now),
            max_attempts,
            payload: QueuePayload { run_id, step_id },
        };
        Ok(self.store.enqueue(item).await?)
    }

    /// Claims up to `limit` items matching `capabilities` for `worker_id`
    /// under this queue's default lease duration (§4.A Claim).
    pub async fn claim(
        &self,
        worker_id: &str,
        capabilities: &[QueueType],
        limit: u32,
    ) -> Result<Vec<ClaimedQueueItem>, QueueError> {
        Ok(self.store.claim(worker_id, capabilities, limit).await?)
    }

    pub async fn extend(&self, item_id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        Ok(self.store.extend_lease(item_id, worker_id, self.default_lease).await?)
    }

    pub async fn complete(&self, item_id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        Ok(self.store.complete_queue_item(item_id, worker_id).await?)
    }

    /// Fails a claimed item against `retry_policy`: requeues with
    /// jittered exponential backoff while attempts remain, otherwise
    /// dead-letters it (§4.B Fail).
    pub async fn fail(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        attempt: u32,
        retry_policy: &RetryPolicy,
    ) -> Result<QueueFailureOutcome, QueueError> {
        let next_available_at = retry_policy
            .has_attempts_remaining(attempt)
            .then(|| Utc::now() + chrono::Duration::milliseconds(retry_policy.backoff_millis_for_attempt(attempt) as i64));
        Ok(self.store.fail_queue_item(item_id, worker_id, error, next_available_at).await?)
    }

    /// Returns expired-lease items to the unclaimed pool (§4.B
    /// RecoverOrphaned); callers run this on a timer.
    pub async fn recover_orphaned(&self) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.store.recover_orphaned().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Envelope, NewRun, Trace, WorkflowGraph};
    use crate::persistence::InMemoryStateStore;

    async fn seeded_queue() -> (WorkQueue<InMemoryStateStore>, Uuid) {
        let store = std::sync::Arc::new(InMemoryStateStore::new());
        let id = Uuid::now_v7();
        let run = store
            .create_run(NewRun {
                id,
                workflow_id: Uuid::now_v7(),
                version_id: Uuid::now_v7(),
                trigger_id: None,
                input: Envelope::new(serde_json::json!({}), Trace::new(Uuid::now_v7(), id, "start", 1)),
                variables: serde_json::Map::new(),
                timeout_seconds: 3600,
                retry_policy: RetryPolicy::default(),
                priority: 0,
                graph: WorkflowGraph { nodes: vec![], edges: vec![] },
            })
            .await
            .unwrap();
        (WorkQueue::new(store, Duration::from_secs(120)), run.id)
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trips() {
        let (queue, run_id) = seeded_queue().await;
        queue.enqueue(run_id, QueueType::StartRun, None, 0, 3, None).await.unwrap();
        let claimed = queue.claim("worker-a", &[QueueType::StartRun], 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn fail_with_attempts_remaining_requeues() {
        let (queue, run_id) = seeded_queue().await;
        let item = queue.enqueue(run_id, QueueType::ExecuteStep, None, 0, 3, None).await.unwrap();
        queue.claim("worker-a", &[QueueType::ExecuteStep], 10).await.unwrap();
        let outcome = queue.fail(item.id, "worker-a", "boom", 1, &RetryPolicy::default()).await.unwrap();
        assert!(matches!(outcome, QueueFailureOutcome::Requeued { .. }));
    }

    #[tokio::test]
    async fn fail_without_attempts_remaining_dead_letters() {
        let (queue, run_id) = seeded_queue().await;
        let policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
        let item = queue.enqueue(run_id, QueueType::ExecuteStep, None, 0, 1, None).await.unwrap();
        queue.claim("worker-a", &[QueueType::ExecuteStep], 10).await.unwrap();
        let outcome = queue.fail(item.id, "worker-a", "boom", 1, &policy).await.unwrap();
        assert!(matches!(outcome, QueueFailureOutcome::DeadLettered));
    }
}
