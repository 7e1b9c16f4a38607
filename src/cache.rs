//! Cache interfaces consumed by the controller, plus in-memory
//! implementations with pub/sub fan-out.
//!
//! The invocation cache is the externally owned source of truth. The
//! controller reads snapshots and subscribes to updates; the API layer
//! mutates it by applying events. The in-memory implementation here
//! enforces the aggregate invariants (terminal states are immutable)
//! and fans every applied event out to all subscribers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{
    Invocation, InvocationEvent, InvocationEventKind, InvocationPhase, TaskPhase, TaskRun,
    Workflow,
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invocation {0} not found")]
    NotFound(Uuid),
    #[error("invocation {0} already reached a terminal state")]
    AlreadyFinished(Uuid),
    #[error("{0}")]
    Message(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Read surface of the invocation cache.
#[async_trait]
pub trait InvocationCache: Send + Sync {
    async fn get(&self, id: Uuid) -> CacheResult<Option<Invocation>>;
    async fn list(&self) -> CacheResult<Vec<Invocation>>;
    /// Subscribe to the cache's update stream. Every event applied
    /// after this call is delivered to the returned receiver.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<InvocationEvent>;
}

/// Read surface of the workflow cache.
#[async_trait]
pub trait WorkflowCache: Send + Sync {
    async fn get(&self, id: Uuid) -> CacheResult<Option<Workflow>>;
}

/// Write surface used by the API layer to append events.
#[async_trait]
pub trait InvocationEventSink: Send + Sync {
    async fn apply(&self, event: InvocationEvent) -> CacheResult<()>;
}

/// In-memory invocation cache with subscriber fan-out.
#[derive(Default)]
pub struct MemoryInvocationCache {
    invocations: Mutex<HashMap<Uuid, Invocation>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InvocationEvent>>>,
}

impl MemoryInvocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, event: InvocationEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn apply_locked(
        invocations: &mut HashMap<Uuid, Invocation>,
        event: &InvocationEvent,
    ) -> CacheResult<bool> {
        let id = event.invocation_id;

        if let InvocationEventKind::InvocationCreated { spec } = &event.kind {
            if invocations.contains_key(&id) {
                return Ok(false);
            }
            invocations.insert(
                id,
                Invocation {
                    id,
                    spec: spec.clone(),
                    status: InvocationPhase::Scheduled,
                    tasks: HashMap::new(),
                    output: None,
                    error: None,
                    created_at: event.occurred_at,
                    finished_at: None,
                },
            );
            return Ok(true);
        }

        let invocation = invocations.get_mut(&id).ok_or(CacheError::NotFound(id))?;
        if invocation.status.is_finished() {
            return Err(CacheError::AlreadyFinished(id));
        }

        match &event.kind {
            InvocationEventKind::InvocationCreated { .. } => unreachable!(),
            InvocationEventKind::InvocationCompleted { output } => {
                invocation.status = InvocationPhase::Succeeded;
                invocation.output = output.clone();
                invocation.finished_at = Some(event.occurred_at);
            }
            InvocationEventKind::InvocationFailed { error } => {
                invocation.status = InvocationPhase::Failed;
                invocation.error = Some(error.clone());
                invocation.finished_at = Some(event.occurred_at);
            }
            InvocationEventKind::InvocationCanceled { reason } => {
                invocation.status = InvocationPhase::Aborted;
                invocation.error = Some(reason.clone());
                invocation.finished_at = Some(event.occurred_at);
            }
            InvocationEventKind::TaskStarted {
                task_id,
                task_invocation_id,
            } => {
                invocation.tasks.insert(
                    task_id.clone(),
                    TaskRun {
                        status: TaskPhase::Started,
                        task_invocation_id: Some(*task_invocation_id),
                        output: None,
                        error: None,
                        started_at: event.occurred_at,
                        finished_at: None,
                    },
                );
                invocation.status = InvocationPhase::InProgress;
            }
            InvocationEventKind::TaskSucceeded { task_id, output } => {
                let run = invocation
                    .tasks
                    .entry(task_id.clone())
                    .or_insert_with(|| TaskRun {
                        status: TaskPhase::Started,
                        task_invocation_id: None,
                        output: None,
                        error: None,
                        started_at: event.occurred_at,
                        finished_at: None,
                    });
                run.status = TaskPhase::Succeeded;
                run.output = output.clone();
                run.finished_at = Some(event.occurred_at);
            }
            InvocationEventKind::TaskFailed { task_id, error } => {
                let run = invocation
                    .tasks
                    .entry(task_id.clone())
                    .or_insert_with(|| TaskRun {
                        status: TaskPhase::Started,
                        task_invocation_id: None,
                        output: None,
                        error: None,
                        started_at: event.occurred_at,
                        finished_at: None,
                    });
                run.status = TaskPhase::Failed;
                run.error = Some(error.clone());
                run.finished_at = Some(event.occurred_at);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl InvocationCache for MemoryInvocationCache {
    async fn get(&self, id: Uuid) -> CacheResult<Option<Invocation>> {
        let invocations = self.invocations.lock().expect("invocation cache poisoned");
        Ok(invocations.get(&id).cloned())
    }

    async fn list(&self) -> CacheResult<Vec<Invocation>> {
        let invocations = self.invocations.lock().expect("invocation cache poisoned");
        Ok(invocations.values().cloned().collect())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<InvocationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }
}

#[async_trait]
impl InvocationEventSink for MemoryInvocationCache {
    async fn apply(&self, event: InvocationEvent) -> CacheResult<()> {
        let mutated = {
            let mut invocations = self.invocations.lock().expect("invocation cache poisoned");
            Self::apply_locked(&mut invocations, &event)?
        };
        if mutated {
            self.publish(event);
        }
        Ok(())
    }
}

/// In-memory workflow cache.
#[derive(Default)]
pub struct MemoryWorkflowCache {
    workflows: Mutex<HashMap<Uuid, Workflow>>,
}

impl MemoryWorkflowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workflow definition.
    pub fn insert(&self, workflow: Workflow) {
        let mut workflows = self.workflows.lock().expect("workflow cache poisoned");
        workflows.insert(workflow.id, workflow);
    }
}

#[async_trait]
impl WorkflowCache for MemoryWorkflowCache {
    async fn get(&self, id: Uuid) -> CacheResult<Option<Workflow>> {
        let workflows = self.workflows.lock().expect("workflow cache poisoned");
        Ok(workflows.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InvocationSpec;
    use serde_json::json;

    fn created_event(id: Uuid) -> InvocationEvent {
        InvocationEvent::new(
            id,
            InvocationEventKind::InvocationCreated {
                spec: InvocationSpec {
                    workflow_id: Uuid::new_v4(),
                    workflow: None,
                    inputs: HashMap::new(),
                    deadline: None,
                    parent: None,
                },
            },
        )
    }

    #[tokio::test]
    async fn apply_create_then_task_events() {
        let cache = MemoryInvocationCache::new();
        let id = Uuid::new_v4();
        cache.apply(created_event(id)).await.expect("create");

        cache
            .apply(InvocationEvent::new(
                id,
                InvocationEventKind::TaskStarted {
                    task_id: "t1".to_string(),
                    task_invocation_id: Uuid::new_v4(),
                },
            ))
            .await
            .expect("task started");
        cache
            .apply(InvocationEvent::new(
                id,
                InvocationEventKind::TaskSucceeded {
                    task_id: "t1".to_string(),
                    output: Some(json!(42)),
                },
            ))
            .await
            .expect("task succeeded");

        let invocation = cache.get(id).await.expect("get").expect("present");
        assert_eq!(invocation.status, InvocationPhase::InProgress);
        assert_eq!(invocation.task_output("t1"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn terminal_invocations_are_immutable() {
        let cache = MemoryInvocationCache::new();
        let id = Uuid::new_v4();
        cache.apply(created_event(id)).await.expect("create");
        cache
            .apply(InvocationEvent::new(
                id,
                InvocationEventKind::InvocationFailed {
                    error: "boom".to_string(),
                },
            ))
            .await
            .expect("fail");

        let err = cache
            .apply(InvocationEvent::new(
                id,
                InvocationEventKind::InvocationCompleted { output: None },
            ))
            .await
            .expect_err("terminal state must reject mutation");
        assert!(matches!(err, CacheError::AlreadyFinished(_)));

        let invocation = cache.get(id).await.expect("get").expect("present");
        assert_eq!(invocation.status, InvocationPhase::Failed);
        assert_eq!(invocation.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn subscribers_receive_applied_events() {
        let cache = MemoryInvocationCache::new();
        let mut rx = cache.subscribe();
        let id = Uuid::new_v4();
        cache.apply(created_event(id)).await.expect("create");

        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event.invocation_id, id);
        assert_eq!(event.kind.label(), "InvocationCreated");
    }

    #[tokio::test]
    async fn duplicate_create_is_ignored() {
        let cache = MemoryInvocationCache::new();
        let mut rx = cache.subscribe();
        let id = Uuid::new_v4();
        cache.apply(created_event(id)).await.expect("create");
        cache.apply(created_event(id)).await.expect("replay create");

        rx.recv().await.expect("first event");
        assert!(rx.try_recv().is_err(), "replayed create must not publish");
    }
}
