//! The invocation controller: wires the evaluation registry, work
//! queue, worker pool, sweeper, and rule chain into one reactive loop.
//!
//! Data flow: cache events -> [`Controller::notify`] -> registry upsert
//! + queue add. The worker loop drains the queue into the bounded pool,
//! each job running [`Controller::evaluate`]. The sweeper re-enqueues
//! stale registry entries (short loop) and rediscovers orphaned
//! invocations from the cache (long loop). Every evaluation is
//! best-effort: on failure it records a metric, releases the lock, and
//! leaves recovery to the sweeper.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::api::{InvocationApi, TaskApi};
use crate::cache::{InvocationCache, WorkflowCache};
use crate::config::ControllerConfig;
use crate::eval::{EvalOutcome, EvalRecord, EvalState, EvalStore};
use crate::executor::LocalExecutor;
use crate::expr::ExpressionStore;
use crate::model::{InvocationEvent, InvocationEventKind};
use crate::pool::{PoolError, WorkerPool};
use crate::queue::WorkQueue;
use crate::rules::{EvalContext, RuleEvalUntilDecision, default_policy};
use crate::scheduler::WorkflowScheduler;

/// How a single `evaluate` entry resolved, for the outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalJobOutcome {
    /// Another evaluator held the invocation's token.
    Duplicate,
    /// The evaluation was abandoned on an error.
    Error,
    /// Nothing to do.
    Noop,
    /// The rule chain produced actions.
    Action,
}

impl EvalJobOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Error => "error",
            Self::Noop => "noop",
            Self::Action => "action",
        }
    }
}

pub struct Controller {
    invocations: Arc<dyn InvocationCache>,
    workflows: Arc<dyn WorkflowCache>,
    expr_store: Arc<ExpressionStore>,
    eval_store: Arc<EvalStore>,
    work_queue: Arc<WorkQueue>,
    pool: WorkerPool,
    executor: LocalExecutor,
    policy: RuleEvalUntilDecision,
    config: ControllerConfig,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        invocations: Arc<dyn InvocationCache>,
        workflows: Arc<dyn WorkflowCache>,
        scheduler: Arc<dyn WorkflowScheduler>,
        invocation_api: Arc<InvocationApi>,
        task_api: Arc<TaskApi>,
        expr_store: Arc<ExpressionStore>,
    ) -> Arc<Self> {
        let policy = default_policy(
            &config,
            invocation_api,
            task_api,
            scheduler,
            Arc::clone(&expr_store),
        );
        Arc::new(Self {
            invocations,
            workflows,
            expr_store,
            eval_store: Arc::new(EvalStore::new()),
            work_queue: Arc::new(WorkQueue::new()),
            pool: WorkerPool::new(config.max_parallel_evals),
            executor: LocalExecutor::new(config.max_parallel_actions),
            policy,
            config,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn eval_store(&self) -> &EvalStore {
        &self.eval_store
    }

    /// Pending evaluation jobs (queued plus delayed).
    pub fn queue_len(&self) -> usize {
        self.work_queue.len()
    }

    /// Build a controller and start its background loops.
    pub fn start(
        config: ControllerConfig,
        invocations: Arc<dyn InvocationCache>,
        workflows: Arc<dyn WorkflowCache>,
        scheduler: Arc<dyn WorkflowScheduler>,
        invocation_api: Arc<InvocationApi>,
        task_api: Arc<TaskApi>,
        expr_store: Arc<ExpressionStore>,
    ) -> Arc<Self> {
        let controller = Self::new(
            config,
            invocations,
            workflows,
            scheduler,
            invocation_api,
            task_api,
            expr_store,
        );
        Arc::clone(&controller).init();
        controller
    }

    /// Start the notification listener, the queue-draining worker
    /// loop, and the sweep ticker.
    pub fn init(self: Arc<Self>) {
        let mut events = self.invocations.subscribe();

        let listener = {
            let ctrl = Arc::clone(&self);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("notification listener stopped");
                            break;
                        }
                        event = events.recv() => match event {
                            Some(event) => ctrl.notify(event).await,
                            None => {
                                info!("notification stream closed");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let worker = {
            let ctrl = Arc::clone(&self);
            tokio::spawn(async move {
                ctrl.run_worker().await;
                info!("evaluation worker stopped");
            })
        };

        let ticker = {
            let ctrl = Arc::clone(&self);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut ticks = interval(ctrl.config.tick_interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut tick: u64 = 0;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticks.tick() => {
                            tick = tick.wrapping_add(1);
                            ctrl.tick(tick).await;
                        }
                    }
                }
            })
        };

        let mut handles = self.handles.lock().expect("handle list poisoned");
        handles.extend([listener, worker, ticker]);
    }

    /// Route one cache event: terminal events tear the evaluation
    /// state down, progress events upsert and enqueue it.
    pub async fn notify(&self, event: InvocationEvent) {
        debug!(
            invocation_id = %event.invocation_id,
            event = event.kind.label(),
            "controller event"
        );
        if let Some(state) = self.eval_store.load(event.invocation_id) {
            let label = event.kind.label();
            state.span().in_scope(|| debug!(event = label, "invocation event"));
        }
        match &event.kind {
            InvocationEventKind::InvocationCompleted { .. } => {
                self.finish_and_delete(event.invocation_id, true, "completion reason: InvocationCompleted")
                    .await;
            }
            InvocationEventKind::InvocationCanceled { .. } => {
                self.finish_and_delete(event.invocation_id, false, "completion reason: InvocationCanceled")
                    .await;
            }
            InvocationEventKind::InvocationFailed { .. } => {
                self.finish_and_delete(event.invocation_id, false, "completion reason: InvocationFailed")
                    .await;
            }
            InvocationEventKind::InvocationCreated { .. }
            | InvocationEventKind::TaskSucceeded { .. }
            | InvocationEventKind::TaskFailed { .. } => {
                let (state, _) = self
                    .eval_store
                    .load_or_store(event.invocation_id, event.span.clone());
                self.work_queue.add(state);
            }
            other => {
                debug!(event = other.label(), "controller ignored event");
            }
        }
    }

    /// Advance the recovery sweeper. Driven by `init`'s ticker at the
    /// configured cadence; public so external clock drivers can take
    /// over.
    pub async fn tick(&self, tick: u64) {
        if tick % self.config.short_loop_period.max(1) == 0 {
            self.check_eval_store();
        }
        if tick % self.config.long_loop_period.max(1) == 0 {
            self.check_caches().await;
        }
    }

    /// Short loop: re-enqueue tracked invocations whose evaluation has
    /// gone stale.
    fn check_eval_store(&self) {
        let Ok(stale_after) = ChronoDuration::from_std(self.config.eval_stale_threshold) else {
            return;
        };
        for state in self.eval_store.list() {
            if state.is_finished() {
                continue;
            }
            let Some(last) = state.last() else {
                continue;
            };
            let Some(_guard) = state.try_acquire() else {
                // Evaluation in progress.
                continue;
            };
            if Utc::now() > last.timestamp + stale_after {
                metrics::counter!("headway_eval_recovered_total", "source" => "evalStore")
                    .increment(1);
                debug!(
                    invocation_id = %state.invocation_id(),
                    "re-enqueueing stale invocation"
                );
                self.work_queue.add(Arc::clone(&state));
            }
        }
    }

    /// Long loop: pick up unfinished invocations the registry has
    /// never seen (startup, missed subscriptions).
    async fn check_caches(&self) {
        let invocations = match self.invocations.list().await {
            Ok(invocations) => invocations,
            Err(err) => {
                error!(error = %err, "failed to list invocation cache");
                return;
            }
        };
        for invocation in invocations {
            if self.eval_store.load(invocation.id).is_some() {
                continue;
            }
            if invocation.status.is_finished() {
                continue;
            }
            let span = tracing::info_span!("recover_from_cache", invocation_id = %invocation.id);
            metrics::counter!("headway_eval_recovered_total", "source" => "cache").increment(1);
            let (state, _) = self.eval_store.load_or_store(invocation.id, span);
            self.work_queue.add(state);
        }
    }

    /// Evaluate one invocation end to end: claim, snapshot, run the
    /// rule chain, dispatch actions, record.
    pub async fn evaluate(&self, invocation_id: Uuid) -> EvalJobOutcome {
        let outcome = self.evaluate_inner(invocation_id).await;
        metrics::counter!("headway_eval_jobs_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn evaluate_inner(&self, invocation_id: Uuid) -> EvalJobOutcome {
        let start = Instant::now();

        let Some(state) = self.eval_store.load(invocation_id) else {
            warn!(invocation_id = %invocation_id, "skipping evaluation of unknown invocation");
            return EvalJobOutcome::Error;
        };
        if state.is_finished() {
            debug!(invocation_id = %invocation_id, "skipping evaluation of finished state");
            return EvalJobOutcome::Noop;
        }
        let Some(_guard) = state.try_acquire() else {
            debug!(invocation_id = %invocation_id, "failed to obtain exclusive access");
            return EvalJobOutcome::Duplicate;
        };

        let span = tracing::debug_span!(parent: state.span(), "evaluate", invocation_id = %invocation_id);
        self.evaluate_locked(&state, invocation_id, start)
            .instrument(span)
            .await
    }

    async fn evaluate_locked(
        &self,
        state: &Arc<EvalState>,
        invocation_id: Uuid,
        start: Instant,
    ) -> EvalJobOutcome {
        debug!("evaluating invocation");

        // The task executor is the source of truth for in-flight work;
        // leave the invocation alone until its tasks drain.
        let in_flight = self.executor.group_task_count(invocation_id);
        if in_flight > 0 {
            debug!(in_flight, "tasks still running, deferring evaluation");
            state.record(EvalRecord::new(
                None,
                EvalOutcome::Noop,
                Some(format!("{in_flight} tasks in flight")),
            ));
            return EvalJobOutcome::Noop;
        }

        let mut invocation = match self.invocations.get(invocation_id).await {
            Ok(Some(invocation)) => invocation,
            Ok(None) => {
                error!("invocation missing from cache");
                state.record(EvalRecord::error("invocation missing from cache"));
                self.work_queue.add_rate_limited(Arc::clone(state));
                return EvalJobOutcome::Error;
            }
            Err(err) => {
                error!(error = %err, "failed to read invocation from cache");
                state.record(EvalRecord::error(format!("cache read failed: {err}")));
                self.work_queue.add_rate_limited(Arc::clone(state));
                return EvalJobOutcome::Error;
            }
        };

        if invocation.status.is_finished() {
            debug!("invocation already finished");
            self.finish_and_delete(invocation_id, true, "finished").await;
            return EvalJobOutcome::Noop;
        }

        if invocation.spec.workflow.is_none() {
            let workflow = match self.workflows.get(invocation.spec.workflow_id).await {
                Ok(Some(workflow)) => workflow,
                Ok(None) => {
                    error!(workflow_id = %invocation.spec.workflow_id, "workflow missing from cache");
                    state.record(EvalRecord::error("workflow missing from cache"));
                    self.work_queue.add_rate_limited(Arc::clone(state));
                    return EvalJobOutcome::Error;
                }
                Err(err) => {
                    error!(
                        workflow_id = %invocation.spec.workflow_id,
                        error = %err,
                        "failed to read workflow from cache"
                    );
                    state.record(EvalRecord::error(format!("workflow read failed: {err}")));
                    self.work_queue.add_rate_limited(Arc::clone(state));
                    return EvalJobOutcome::Error;
                }
            };
            if !workflow.status.is_ready() {
                warn!(workflow_id = %workflow.id, "workflow is not ready");
                state.record(EvalRecord::new(
                    None,
                    EvalOutcome::Noop,
                    Some("workflow not ready".to_string()),
                ));
                self.work_queue
                    .add_after(Arc::clone(state), self.config.not_ready_retry_delay);
                return EvalJobOutcome::Error;
            }
            invocation.spec.workflow = Some(workflow);
        }

        let ctx = EvalContext {
            state,
            invocation: &invocation,
        };
        let Some((rule_path, actions)) = self.policy.eval_traced(&ctx) else {
            state.record(EvalRecord::noop());
            return EvalJobOutcome::Noop;
        };
        if actions.is_empty() {
            state.record(EvalRecord::new(Some(rule_path), EvalOutcome::Noop, None));
            return EvalJobOutcome::Noop;
        }

        let kinds: Vec<&'static str> = actions.iter().map(|a| a.kind()).collect();
        for action in actions {
            if let Err(err) = self
                .executor
                .submit(&self.cancel, invocation_id, action)
                .await
            {
                error!(error = %err, "failed to submit action");
                state.record(EvalRecord::error(format!("action submit failed: {err}")));
                self.work_queue.add_rate_limited(Arc::clone(state));
                return EvalJobOutcome::Error;
            }
        }

        let action_kind = kinds.first().copied().unwrap_or("none");
        state.record(EvalRecord::new(
            Some(rule_path),
            EvalOutcome::Actions(kinds),
            None,
        ));
        metrics::histogram!("headway_eval_duration_seconds", "action" => action_kind)
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(
            "headway_invocation_status_total",
            "status" => invocation.status.as_str()
        )
        .increment(1);

        if let Ok(Some(current)) = self.invocations.get(invocation_id).await
            && current.status.is_finished()
        {
            self.finish_and_delete(invocation_id, true, "").await;
        }

        EvalJobOutcome::Action
    }

    async fn finish_and_delete(&self, invocation_id: Uuid, success: bool, reason: &str) {
        let Some(state) = self.eval_store.load(invocation_id) else {
            return;
        };
        let created_at = self
            .invocations
            .get(invocation_id)
            .await
            .ok()
            .flatten()
            .map(|invocation| invocation.created_at);

        state.finish(success, reason);
        self.eval_store.delete(invocation_id);
        self.expr_store.delete(invocation_id);
        self.work_queue.forget(invocation_id);
        debug!(invocation_id = %invocation_id, "removed invocation from evaluation registry");

        if let Some(created_at) = created_at {
            let elapsed = (Utc::now() - created_at).to_std().unwrap_or_default();
            metrics::histogram!("headway_invocation_finished_duration_seconds")
                .record(elapsed.as_secs_f64());
        }
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let Some(state) = self.work_queue.get().await else {
                break;
            };
            let invocation_id = state.invocation_id();
            let ctrl = Arc::clone(&self);
            let submitted = self
                .pool
                .submit(&self.cancel, async move {
                    let outcome = ctrl.evaluate(invocation_id).await;
                    if outcome != EvalJobOutcome::Error {
                        ctrl.work_queue.forget(invocation_id);
                    }
                    ctrl.work_queue.done(invocation_id);
                })
                .await;
            match submitted {
                Ok(()) => {}
                Err(PoolError::Closed) | Err(PoolError::Canceled) => {
                    self.work_queue.done(invocation_id);
                    break;
                }
                Err(err) => {
                    warn!(
                        invocation_id = %invocation_id,
                        error = %err,
                        "failed to submit evaluation job"
                    );
                    self.work_queue.done(invocation_id);
                }
            }
        }
    }

    /// Stop accepting work, drain in-flight evaluations and actions up
    /// to the configured grace period, and tear the registry down.
    pub async fn close(&self) {
        info!("closing invocation controller");
        self.work_queue.shut_down();
        self.cancel.cancel();
        if let Err(err) = self.pool.graceful_stop(self.config.graceful_stop_timeout).await {
            warn!(error = %err, "evaluation pool did not stop cleanly");
        }
        if let Err(err) = self
            .executor
            .graceful_stop(self.config.graceful_stop_timeout)
            .await
        {
            warn!(error = %err, "action executor did not stop cleanly");
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().expect("handle list poisoned");
            handles.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(error = %err, "controller task panicked");
            }
        }

        self.eval_store.close();
        info!("invocation controller closed");
    }
}
