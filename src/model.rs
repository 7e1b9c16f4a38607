//! Invocation and workflow aggregates plus the event types that flow
//! between the caches and the controller.
//!
//! The controller never owns these aggregates; it reads snapshots from
//! the caches and reacts to the events the caches fan out.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a workflow invocation.
///
/// Progresses monotonically toward one of the terminal states; a
/// terminal invocation is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationPhase {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

impl InvocationPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Lifecycle status of a single task run within an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    Started,
    Succeeded,
    Failed,
}

impl TaskPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Readiness of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowPhase {
    Pending,
    Ready,
    Failed,
}

impl WorkflowPhase {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// A node in the workflow task DAG: a single function call with its
/// dependencies and input expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub function: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// A workflow definition: the task DAG and the task whose output
/// becomes the invocation output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tasks: HashMap<String, TaskSpec>,
    pub output_task: String,
    pub status: WorkflowPhase,
}

/// What to run: the workflow reference, inputs, and optional deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSpec {
    pub workflow_id: Uuid,
    /// Embedded workflow snapshot. When absent the controller resolves
    /// the workflow from its cache before evaluating.
    #[serde(default)]
    pub workflow: Option<Workflow>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub deadline: Option<Duration>,
    #[serde(default)]
    pub parent: Option<Uuid>,
}

/// State of one task run within an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub status: TaskPhase,
    pub task_invocation_id: Option<Uuid>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution of a workflow, as maintained by the invocation cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: Uuid,
    pub spec: InvocationSpec,
    pub status: InvocationPhase,
    pub tasks: HashMap<String, TaskRun>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Invocation {
    pub fn workflow(&self) -> Option<&Workflow> {
        self.spec.workflow.as_ref()
    }

    pub fn task_output(&self, task_id: &str) -> Option<&Value> {
        self.tasks.get(task_id).and_then(|run| run.output.as_ref())
    }
}

/// The payload of a single invocation-cache update.
#[derive(Debug, Clone)]
pub enum InvocationEventKind {
    InvocationCreated { spec: InvocationSpec },
    InvocationCompleted { output: Option<Value> },
    InvocationCanceled { reason: String },
    InvocationFailed { error: String },
    TaskStarted { task_id: String, task_invocation_id: Uuid },
    TaskSucceeded { task_id: String, output: Option<Value> },
    TaskFailed { task_id: String, error: String },
}

impl InvocationEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::InvocationCreated { .. } => "InvocationCreated",
            Self::InvocationCompleted { .. } => "InvocationCompleted",
            Self::InvocationCanceled { .. } => "InvocationCanceled",
            Self::InvocationFailed { .. } => "InvocationFailed",
            Self::TaskStarted { .. } => "TaskStarted",
            Self::TaskSucceeded { .. } => "TaskSucceeded",
            Self::TaskFailed { .. } => "TaskFailed",
        }
    }
}

/// An invocation-cache update, carrying the tracing span of whatever
/// produced it so downstream work appears as its child.
#[derive(Debug, Clone)]
pub struct InvocationEvent {
    pub invocation_id: Uuid,
    pub kind: InvocationEventKind,
    pub occurred_at: DateTime<Utc>,
    pub span: tracing::Span,
}

impl InvocationEvent {
    pub fn new(invocation_id: Uuid, kind: InvocationEventKind) -> Self {
        Self {
            invocation_id,
            kind,
            occurred_at: Utc::now(),
            span: tracing::Span::current(),
        }
    }
}
