//! Action executor with per-group in-flight accounting.
//!
//! Every submitted action belongs to a group (the invocation id). The
//! group count is the controller's quiescence signal: an invocation
//! with in-flight actions is not re-evaluated until they drain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::pool::{PoolError, WorkerPool};
use crate::rules::Action;

pub struct LocalExecutor {
    pool: WorkerPool,
    groups: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl LocalExecutor {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: WorkerPool::new(capacity),
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Apply `action` on a pool worker, tracked under `group`.
    pub async fn submit(
        &self,
        cancel: &CancellationToken,
        group: Uuid,
        action: Box<dyn Action>,
    ) -> Result<(), PoolError> {
        {
            let mut groups = self.groups.lock().expect("group registry poisoned");
            *groups.entry(group).or_insert(0) += 1;
        }

        let groups = Arc::clone(&self.groups);
        let kind = action.kind();
        let result = self
            .pool
            .submit(cancel, async move {
                if let Err(err) = action.apply().await {
                    metrics::counter!("headway_action_apply_errors_total").increment(1);
                    warn!(group_id = %group, kind, error = %err, "action apply failed");
                }
                release(&groups, group);
            })
            .await;

        if result.is_err() {
            release(&self.groups, group);
        }
        result
    }

    /// Actions currently in flight for a group.
    pub fn group_task_count(&self, group: Uuid) -> usize {
        self.groups
            .lock()
            .expect("group registry poisoned")
            .get(&group)
            .copied()
            .unwrap_or(0)
    }

    pub async fn graceful_stop(&self, deadline: Duration) -> Result<(), PoolError> {
        self.pool.graceful_stop(deadline).await
    }
}

fn release(groups: &Mutex<HashMap<Uuid, usize>>, group: Uuid) {
    let mut groups = groups.lock().expect("group registry poisoned");
    if let Some(count) = groups.get_mut(&group) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            groups.remove(&group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct GatedAction {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Action for GatedAction {
        fn kind(&self) -> &'static str {
            "gated"
        }

        async fn apply(&self) -> Result<(), ApiError> {
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn group_counts_track_in_flight_actions() {
        let executor = LocalExecutor::new(4);
        let cancel = CancellationToken::new();
        let group = Uuid::new_v4();
        let gate = Arc::new(Notify::new());

        for _ in 0..2 {
            executor
                .submit(
                    &cancel,
                    group,
                    Box::new(GatedAction {
                        gate: Arc::clone(&gate),
                    }),
                )
                .await
                .expect("submit");
        }
        assert_eq!(executor.group_task_count(group), 2);
        assert_eq!(executor.group_task_count(Uuid::new_v4()), 0);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while executor.group_task_count(group) > 0 {
            assert!(tokio::time::Instant::now() < deadline, "actions must drain");
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn rejected_submission_does_not_leak_group_count() {
        let executor = LocalExecutor::new(1);
        let cancel = CancellationToken::new();
        let group = Uuid::new_v4();

        executor
            .graceful_stop(Duration::from_millis(50))
            .await
            .expect("stop");
        let err = executor
            .submit(
                &cancel,
                group,
                Box::new(GatedAction {
                    gate: Arc::new(Notify::new()),
                }),
            )
            .await
            .expect_err("closed");
        assert!(matches!(err, PoolError::Closed));
        assert_eq!(executor.group_task_count(group), 0);
    }
}
