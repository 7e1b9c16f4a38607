//! The evaluation policy: a prioritized chain of rules producing
//! side-effectful actions.
//!
//! A rule inspects an evaluation context and either makes no decision
//! (`None`, the chain moves on) or decides (`Some`, the chain stops) —
//! possibly with an empty action list, which defers the invocation
//! until the next trigger. The chain combinator is itself a rule, so
//! policies nest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::api::{ApiError, InvocationApi, TaskApi};
use crate::config::ControllerConfig;
use crate::eval::EvalState;
use crate::expr::{ExpressionStore, resolve_inputs};
use crate::model::{Invocation, TaskPhase, Workflow};
use crate::scheduler::WorkflowScheduler;

/// Everything a rule may inspect: the controller's own metadata for
/// the invocation and the latest snapshot (with workflow resolved).
pub struct EvalContext<'a> {
    pub state: &'a EvalState,
    pub invocation: &'a Invocation,
}

impl EvalContext<'_> {
    pub fn workflow(&self) -> Option<&Workflow> {
        self.invocation.workflow()
    }
}

/// A side-effectful intent produced by a rule, applied through the
/// external API surface. Applying an action against already-terminal
/// state is a silent no-op.
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn apply(&self) -> Result<(), ApiError>;
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;
    /// `None`: no decision, evaluate the next rule. `Some(actions)`:
    /// decision made, possibly empty (defer).
    fn eval(&self, ctx: &EvalContext<'_>) -> Option<Vec<Box<dyn Action>>>;
}

/// Evaluates sub-rules in order and returns the first decision.
pub struct RuleEvalUntilDecision {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleEvalUntilDecision {
    pub fn new(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    /// Like [`Rule::eval`], but names the deciding rule.
    pub fn eval_traced(
        &self,
        ctx: &EvalContext<'_>,
    ) -> Option<(&'static str, Vec<Box<dyn Action>>)> {
        for rule in &self.rules {
            if let Some(actions) = rule.eval(ctx) {
                return Some((rule.name(), actions));
            }
        }
        None
    }
}

impl Rule for RuleEvalUntilDecision {
    fn name(&self) -> &'static str {
        "untilDecision"
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Option<Vec<Box<dyn Action>>> {
        self.eval_traced(ctx).map(|(_, actions)| actions)
    }
}

/// Fails an invocation through the invocation API.
pub struct FailInvocation {
    pub api: Arc<InvocationApi>,
    pub invocation_id: Uuid,
    pub cause: String,
}

#[async_trait]
impl Action for FailInvocation {
    fn kind(&self) -> &'static str {
        "fail"
    }

    async fn apply(&self) -> Result<(), ApiError> {
        self.api.fail(self.invocation_id, self.cause.clone()).await
    }
}

/// Completes an invocation with the workflow output.
pub struct CompleteInvocation {
    pub api: Arc<InvocationApi>,
    pub invocation_id: Uuid,
    pub output: Option<Value>,
}

#[async_trait]
impl Action for CompleteInvocation {
    fn kind(&self) -> &'static str {
        "complete"
    }

    async fn apply(&self) -> Result<(), ApiError> {
        self.api
            .complete(self.invocation_id, self.output.clone())
            .await
    }
}

/// Starts one task through the task API.
pub struct InvokeTask {
    pub api: Arc<TaskApi>,
    pub invocation_id: Uuid,
    pub task_id: String,
    pub function: String,
    pub inputs: HashMap<String, Value>,
    pub timeout: Option<Duration>,
}

#[async_trait]
impl Action for InvokeTask {
    fn kind(&self) -> &'static str {
        "invoke"
    }

    async fn apply(&self) -> Result<(), ApiError> {
        self.api
            .invoke(
                self.invocation_id,
                &self.task_id,
                &self.function,
                self.inputs.clone(),
                self.timeout,
            )
            .await?;
        Ok(())
    }
}

/// Fails invocations that outlived their deadline. The spec deadline
/// wins over the configured default.
pub struct RuleTimedOut {
    pub api: Arc<InvocationApi>,
    pub default_timeout: Duration,
}

impl Rule for RuleTimedOut {
    fn name(&self) -> &'static str {
        "timedOut"
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Option<Vec<Box<dyn Action>>> {
        let invocation = ctx.invocation;
        let timeout = invocation.spec.deadline.unwrap_or(self.default_timeout);
        let delta = ChronoDuration::from_std(timeout).ok()?;
        let deadline = invocation.created_at.checked_add_signed(delta)?;
        if Utc::now() <= deadline {
            return None;
        }
        Some(vec![Box::new(FailInvocation {
            api: Arc::clone(&self.api),
            invocation_id: invocation.id,
            cause: "timed out".to_string(),
        })])
    }
}

/// Fails invocations whose evaluation history carries more errors than
/// tolerated.
pub struct RuleExceededErrorCount {
    pub api: Arc<InvocationApi>,
    pub max_error_count: usize,
}

impl Rule for RuleExceededErrorCount {
    fn name(&self) -> &'static str {
        "exceededErrorCount"
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Option<Vec<Box<dyn Action>>> {
        let errors = ctx.state.error_count();
        if errors <= self.max_error_count {
            return None;
        }
        let cause = ctx
            .state
            .last_error_cause()
            .unwrap_or_else(|| format!("exceeded max error count of {}", self.max_error_count));
        Some(vec![Box::new(FailInvocation {
            api: Arc::clone(&self.api),
            invocation_id: ctx.invocation.id,
            cause,
        })])
    }
}

/// Completes or fails the invocation once every task has reached a
/// terminal state.
pub struct RuleCheckIfCompleted {
    pub api: Arc<InvocationApi>,
}

impl Rule for RuleCheckIfCompleted {
    fn name(&self) -> &'static str {
        "checkIfCompleted"
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Option<Vec<Box<dyn Action>>> {
        let workflow = ctx.workflow()?;
        let invocation = ctx.invocation;

        let mut failure: Option<(&str, &str)> = None;
        for task_id in workflow.tasks.keys() {
            match invocation.tasks.get(task_id) {
                Some(run) if run.status.is_finished() => {
                    if run.status == TaskPhase::Failed && failure.is_none() {
                        let error = run.error.as_deref().unwrap_or("unknown error");
                        failure = Some((task_id.as_str(), error));
                    }
                }
                // Not every task has finished; nothing to decide yet.
                _ => return None,
            }
        }

        if let Some((task_id, error)) = failure {
            return Some(vec![Box::new(FailInvocation {
                api: Arc::clone(&self.api),
                invocation_id: invocation.id,
                cause: format!("task '{task_id}' failed: {error}"),
            })]);
        }

        let output = invocation.task_output(&workflow.output_task).cloned();
        Some(vec![Box::new(CompleteInvocation {
            api: Arc::clone(&self.api),
            invocation_id: invocation.id,
            output,
        })])
    }
}

/// Defers evaluation while the workflow definition is not ready.
pub struct RuleWorkflowIsReady;

impl Rule for RuleWorkflowIsReady {
    fn name(&self) -> &'static str {
        "workflowIsReady"
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Option<Vec<Box<dyn Action>>> {
        let workflow = ctx.workflow()?;
        if !workflow.status.is_ready() {
            // Decision with no actions: defer until re-triggered.
            return Some(Vec::new());
        }
        None
    }
}

/// Consults the workflow scheduler and turns its plan into task
/// invocations with resolved inputs.
pub struct RuleSchedule {
    pub scheduler: Arc<dyn WorkflowScheduler>,
    pub invocation_api: Arc<InvocationApi>,
    pub task_api: Arc<TaskApi>,
    pub expr_store: Arc<ExpressionStore>,
}

impl Rule for RuleSchedule {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Option<Vec<Box<dyn Action>>> {
        let workflow = ctx.workflow()?;
        let invocation = ctx.invocation;

        let plan = match self.scheduler.schedule(invocation, workflow) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(
                    invocation_id = %invocation.id,
                    error = %err,
                    "scheduler rejected invocation"
                );
                return Some(vec![Box::new(FailInvocation {
                    api: Arc::clone(&self.invocation_api),
                    invocation_id: invocation.id,
                    cause: format!("scheduling failed: {err}"),
                })]);
            }
        };
        if plan.tasks.is_empty() {
            return None;
        }

        let scope = self.expr_store.scope_for(invocation);
        let mut actions: Vec<Box<dyn Action>> = Vec::with_capacity(plan.tasks.len());
        for task in &plan.tasks {
            let Some(spec) = workflow.tasks.get(&task.task_id) else {
                warn!(
                    invocation_id = %invocation.id,
                    task_id = %task.task_id,
                    "plan references a task the workflow does not define"
                );
                continue;
            };
            match resolve_inputs(&spec.inputs, &scope) {
                Ok(inputs) => actions.push(Box::new(InvokeTask {
                    api: Arc::clone(&self.task_api),
                    invocation_id: invocation.id,
                    task_id: task.task_id.clone(),
                    function: spec.function.clone(),
                    inputs,
                    timeout: spec.timeout,
                })),
                Err(err) => {
                    return Some(vec![Box::new(FailInvocation {
                        api: Arc::clone(&self.invocation_api),
                        invocation_id: invocation.id,
                        cause: format!(
                            "failed to resolve inputs for task '{}': {err}",
                            task.task_id
                        ),
                    })]);
                }
            }
        }
        Some(actions)
    }
}

/// The default policy, in priority order. API handles are built first
/// and passed in, then the resulting policy is attached to the
/// controller.
pub fn default_policy(
    config: &ControllerConfig,
    invocation_api: Arc<InvocationApi>,
    task_api: Arc<TaskApi>,
    scheduler: Arc<dyn WorkflowScheduler>,
    expr_store: Arc<ExpressionStore>,
) -> RuleEvalUntilDecision {
    RuleEvalUntilDecision::new(vec![
        Box::new(RuleTimedOut {
            api: Arc::clone(&invocation_api),
            default_timeout: config.default_invocation_timeout,
        }),
        Box::new(RuleExceededErrorCount {
            api: Arc::clone(&invocation_api),
            max_error_count: config.max_error_count,
        }),
        Box::new(RuleCheckIfCompleted {
            api: Arc::clone(&invocation_api),
        }),
        Box::new(RuleWorkflowIsReady),
        Box::new(RuleSchedule {
            scheduler,
            invocation_api,
            task_api,
            expr_store,
        }),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FunctionRuntime, RuntimeError};
    use crate::cache::MemoryInvocationCache;
    use crate::eval::{EvalRecord, EvalStore};
    use crate::model::{
        InvocationPhase, InvocationSpec, TaskRun, TaskSpec, WorkflowPhase,
    };
    use crate::scheduler::DependencyScheduler;
    use serde_json::json;

    struct NullRuntime;

    #[async_trait]
    impl FunctionRuntime for NullRuntime {
        async fn invoke(
            &self,
            _function: &str,
            _inputs: HashMap<String, Value>,
        ) -> Result<Value, RuntimeError> {
            Ok(Value::Null)
        }
    }

    fn apis() -> (Arc<InvocationApi>, Arc<TaskApi>) {
        let cache = Arc::new(MemoryInvocationCache::new());
        (
            Arc::new(InvocationApi::new(cache.clone())),
            Arc::new(TaskApi::new(cache, Arc::new(NullRuntime))),
        )
    }

    fn one_task_workflow() -> Workflow {
        let mut tasks = HashMap::new();
        tasks.insert(
            "t1".to_string(),
            TaskSpec {
                function: "echo".to_string(),
                requires: Vec::new(),
                inputs: HashMap::from([("value".to_string(), json!("{{ inputs.n }}"))]),
                timeout: None,
            },
        );
        Workflow {
            id: Uuid::new_v4(),
            tasks,
            output_task: "t1".to_string(),
            status: WorkflowPhase::Ready,
        }
    }

    fn invocation_for(workflow: Workflow) -> Invocation {
        Invocation {
            id: Uuid::new_v4(),
            spec: InvocationSpec {
                workflow_id: workflow.id,
                workflow: Some(workflow),
                inputs: HashMap::from([("n".to_string(), json!(3))]),
                deadline: None,
                parent: None,
            },
            status: InvocationPhase::Scheduled,
            tasks: HashMap::new(),
            output: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    fn eval_state() -> (EvalStore, std::sync::Arc<EvalState>) {
        let store = EvalStore::new();
        let (state, _) = store.load_or_store(Uuid::new_v4(), tracing::Span::none());
        (store, state)
    }

    #[test]
    fn timed_out_rule_fires_past_deadline() {
        let (invocation_api, _) = apis();
        let rule = RuleTimedOut {
            api: invocation_api,
            default_timeout: Duration::from_secs(600),
        };
        let (_store, state) = eval_state();

        let mut invocation = invocation_for(one_task_workflow());
        invocation.created_at = Utc::now() - ChronoDuration::minutes(11);
        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        let actions = rule.eval(&ctx).expect("decision");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), "fail");
    }

    #[test]
    fn timed_out_rule_respects_spec_deadline() {
        let (invocation_api, _) = apis();
        let rule = RuleTimedOut {
            api: invocation_api,
            default_timeout: Duration::from_secs(600),
        };
        let (_store, state) = eval_state();

        let mut invocation = invocation_for(one_task_workflow());
        invocation.created_at = Utc::now() - ChronoDuration::minutes(11);
        invocation.spec.deadline = Some(Duration::from_secs(3600));
        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        assert!(rule.eval(&ctx).is_none(), "wider spec deadline must win");
    }

    #[test]
    fn error_count_rule_uses_history() {
        let (invocation_api, _) = apis();
        let rule = RuleExceededErrorCount {
            api: invocation_api,
            max_error_count: 0,
        };
        let (_store, state) = eval_state();
        let invocation = invocation_for(one_task_workflow());

        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        assert!(rule.eval(&ctx).is_none(), "clean history passes");

        state.record(EvalRecord::error("cache read failed"));
        let actions = rule.eval(&ctx).expect("decision");
        assert_eq!(actions[0].kind(), "fail");
    }

    #[test]
    fn completion_rule_completes_with_output_task_result() {
        let (invocation_api, _) = apis();
        let rule = RuleCheckIfCompleted {
            api: invocation_api,
        };
        let (_store, state) = eval_state();

        let mut invocation = invocation_for(one_task_workflow());
        invocation.tasks.insert(
            "t1".to_string(),
            TaskRun {
                status: TaskPhase::Succeeded,
                task_invocation_id: Some(Uuid::new_v4()),
                output: Some(json!(42)),
                error: None,
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
            },
        );
        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        let actions = rule.eval(&ctx).expect("decision");
        assert_eq!(actions[0].kind(), "complete");
    }

    #[test]
    fn completion_rule_fails_on_failed_task() {
        let (invocation_api, _) = apis();
        let rule = RuleCheckIfCompleted {
            api: invocation_api,
        };
        let (_store, state) = eval_state();

        let mut invocation = invocation_for(one_task_workflow());
        invocation.tasks.insert(
            "t1".to_string(),
            TaskRun {
                status: TaskPhase::Failed,
                task_invocation_id: Some(Uuid::new_v4()),
                output: None,
                error: Some("exploded".to_string()),
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
            },
        );
        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        let actions = rule.eval(&ctx).expect("decision");
        assert_eq!(actions[0].kind(), "fail");
    }

    #[test]
    fn completion_rule_waits_for_running_tasks() {
        let (invocation_api, _) = apis();
        let rule = RuleCheckIfCompleted {
            api: invocation_api,
        };
        let (_store, state) = eval_state();

        let mut invocation = invocation_for(one_task_workflow());
        invocation.tasks.insert(
            "t1".to_string(),
            TaskRun {
                status: TaskPhase::Started,
                task_invocation_id: Some(Uuid::new_v4()),
                output: None,
                error: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        assert!(rule.eval(&ctx).is_none());
    }

    #[test]
    fn not_ready_workflow_defers_with_empty_decision() {
        let (_store, state) = eval_state();
        let mut workflow = one_task_workflow();
        workflow.status = WorkflowPhase::Pending;
        let invocation = invocation_for(workflow);

        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        let actions = RuleWorkflowIsReady.eval(&ctx).expect("decision");
        assert!(actions.is_empty());
    }

    #[test]
    fn schedule_rule_resolves_inputs_into_invokes() {
        let (invocation_api, task_api) = apis();
        let rule = RuleSchedule {
            scheduler: Arc::new(DependencyScheduler::new()),
            invocation_api,
            task_api,
            expr_store: Arc::new(ExpressionStore::new()),
        };
        let (_store, state) = eval_state();
        let invocation = invocation_for(one_task_workflow());

        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        let actions = rule.eval(&ctx).expect("decision");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), "invoke");
    }

    #[test]
    fn chain_returns_first_decision() {
        let (invocation_api, task_api) = apis();
        let config = ControllerConfig::default();
        let policy = default_policy(
            &config,
            invocation_api,
            task_api,
            Arc::new(DependencyScheduler::new()),
            Arc::new(ExpressionStore::new()),
        );
        let (_store, state) = eval_state();

        // Fresh invocation with a ready workflow: the schedule rule
        // decides.
        let invocation = invocation_for(one_task_workflow());
        let ctx = EvalContext {
            state: &state,
            invocation: &invocation,
        };
        let (rule_path, actions) = policy.eval_traced(&ctx).expect("decision");
        assert_eq!(rule_path, "schedule");
        assert_eq!(actions.len(), 1);

        // Past its deadline: the deadline rule preempts everything.
        let mut expired = invocation_for(one_task_workflow());
        expired.created_at = Utc::now() - ChronoDuration::minutes(11);
        let ctx = EvalContext {
            state: &state,
            invocation: &expired,
        };
        let (rule_path, _) = policy.eval_traced(&ctx).expect("decision");
        assert_eq!(rule_path, "timedOut");
    }
}
