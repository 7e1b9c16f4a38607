//! Invocation and task APIs: the only paths through which the
//! controller mutates external state.
//!
//! Terminal transitions are idempotent: re-applying a fail or complete
//! on an already-terminal invocation is a silent no-op, so actions can
//! be retried without observable effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheError, InvocationEventSink};
use crate::model::{InvocationEvent, InvocationEventKind, InvocationSpec};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RuntimeError(pub String);

/// The function runtime that actually executes task code. External to
/// the controller; contracted only here.
#[async_trait]
pub trait FunctionRuntime: Send + Sync {
    async fn invoke(
        &self,
        function: &str,
        inputs: HashMap<String, Value>,
    ) -> Result<Value, RuntimeError>;
}

/// Lifecycle operations on invocations.
pub struct InvocationApi {
    sink: Arc<dyn InvocationEventSink>,
}

impl InvocationApi {
    pub fn new(sink: Arc<dyn InvocationEventSink>) -> Self {
        Self { sink }
    }

    /// Create a new invocation from a spec. Mostly a convenience for
    /// engine frontends and tests; the controller itself only reads.
    pub async fn create(&self, spec: InvocationSpec) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        self.sink
            .apply(InvocationEvent::new(
                id,
                InvocationEventKind::InvocationCreated { spec },
            ))
            .await?;
        Ok(id)
    }

    pub async fn complete(&self, id: Uuid, output: Option<Value>) -> Result<(), ApiError> {
        self.apply_terminal(InvocationEvent::new(
            id,
            InvocationEventKind::InvocationCompleted { output },
        ))
        .await
    }

    pub async fn fail(&self, id: Uuid, cause: String) -> Result<(), ApiError> {
        self.apply_terminal(InvocationEvent::new(
            id,
            InvocationEventKind::InvocationFailed { error: cause },
        ))
        .await
    }

    pub async fn cancel(&self, id: Uuid, reason: String) -> Result<(), ApiError> {
        self.apply_terminal(InvocationEvent::new(
            id,
            InvocationEventKind::InvocationCanceled { reason },
        ))
        .await
    }

    async fn apply_terminal(&self, event: InvocationEvent) -> Result<(), ApiError> {
        match self.sink.apply(event).await {
            Ok(()) => Ok(()),
            Err(CacheError::AlreadyFinished(id)) => {
                debug!(invocation_id = %id, "terminal transition on finished invocation ignored");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Task invocation: records the start, runs the function with its
/// timeout, and posts the result back through the cache.
pub struct TaskApi {
    sink: Arc<dyn InvocationEventSink>,
    runtime: Arc<dyn FunctionRuntime>,
}

impl TaskApi {
    pub fn new(sink: Arc<dyn InvocationEventSink>, runtime: Arc<dyn FunctionRuntime>) -> Self {
        Self { sink, runtime }
    }

    pub async fn invoke(
        &self,
        invocation_id: Uuid,
        task_id: &str,
        function: &str,
        inputs: HashMap<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Uuid, ApiError> {
        let task_invocation_id = Uuid::new_v4();

        match self
            .sink
            .apply(InvocationEvent::new(
                invocation_id,
                InvocationEventKind::TaskStarted {
                    task_id: task_id.to_string(),
                    task_invocation_id,
                },
            ))
            .await
        {
            Ok(()) => {}
            Err(CacheError::AlreadyFinished(_)) => {
                debug!(
                    invocation_id = %invocation_id,
                    task_id,
                    "invocation finished before task start; dropping"
                );
                return Ok(task_invocation_id);
            }
            Err(err) => return Err(err.into()),
        }

        let call = self.runtime.invoke(function, inputs);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError(format!(
                    "task '{task_id}' timed out after {limit:?}"
                ))),
            },
            None => call.await,
        };

        let kind = match result {
            Ok(output) => InvocationEventKind::TaskSucceeded {
                task_id: task_id.to_string(),
                output: Some(output),
            },
            Err(err) => InvocationEventKind::TaskFailed {
                task_id: task_id.to_string(),
                error: err.to_string(),
            },
        };

        match self
            .sink
            .apply(InvocationEvent::new(invocation_id, kind))
            .await
        {
            Ok(()) | Err(CacheError::AlreadyFinished(_)) => Ok(task_invocation_id),
            Err(err) => Err(err.into()),
        }
    }
}
