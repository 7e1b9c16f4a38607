//! Headway - the invocation controller of a serverless workflow engine
//!
//! This crate drives each active workflow invocation from submission to
//! a terminal state by repeatedly evaluating its current snapshot
//! against a prioritized rule chain and dispatching the resulting
//! actions. The key components are:
//!
//! ## Control loop
//!
//! - [`Controller`]: wires everything together and owns the lifecycle
//! - [`EvalStore`]: per-invocation evaluation state with non-blocking
//!   exclusive tokens
//! - [`WorkQueue`]: deduplicating, backoff-aware queue of evaluation
//!   jobs
//! - [`WorkerPool`]: bounded concurrent executor
//!
//! ## Policy
//!
//! - [`rules`]: the rule chain (deadline, error count, completion,
//!   readiness, scheduling) and its actions
//! - [`scheduler`]: the workflow scheduling seam with a
//!   dependency-readiness default
//!
//! ## Edges
//!
//! - [`cache`]: invocation/workflow cache interfaces and in-memory
//!   implementations with pub/sub
//! - [`api`]: the invocation and task APIs through which actions
//!   mutate external state

pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod eval;
pub mod executor;
pub mod expr;
pub mod model;
pub mod pool;
pub mod queue;
pub mod rules;
pub mod scheduler;

// Configuration
pub use config::ControllerConfig;

// Control loop
pub use controller::{Controller, EvalJobOutcome};
pub use eval::{EvalGuard, EvalOutcome, EvalRecord, EvalState, EvalStore};
pub use executor::LocalExecutor;
pub use pool::{PoolError, WorkerPool};
pub use queue::WorkQueue;

// Aggregates and events
pub use model::{
    Invocation, InvocationEvent, InvocationEventKind, InvocationPhase, InvocationSpec, TaskPhase,
    TaskRun, TaskSpec, Workflow, WorkflowPhase,
};

// Cache edges
pub use cache::{
    CacheError, CacheResult, InvocationCache, InvocationEventSink, MemoryInvocationCache,
    MemoryWorkflowCache, WorkflowCache,
};

// API surface
pub use api::{ApiError, FunctionRuntime, InvocationApi, RuntimeError, TaskApi};

// Policy
pub use expr::{ExprError, ExpressionStore, Scope, resolve_inputs};
pub use rules::{Action, EvalContext, Rule, RuleEvalUntilDecision, default_policy};
pub use scheduler::{
    DependencyScheduler, ScheduleError, ScheduledTask, SchedulingPlan, WorkflowScheduler,
};
