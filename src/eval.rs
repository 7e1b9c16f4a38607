//! Per-invocation evaluation state and the process-wide registry.
//!
//! An [`EvalState`] carries the controller's own metadata for one live
//! invocation: the append-only record history, the tracing span the
//! invocation was created under, and the exclusive token that
//! serializes evaluations. The token is acquired non-blockingly; a
//! loser abandons the attempt and relies on re-enqueueing rather than
//! waiting.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Guard proving exclusive access to an invocation's evaluation.
/// Dropping it releases the token.
pub type EvalGuard = OwnedMutexGuard<()>;

/// Outcome of a single evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// The rule chain produced actions of the given kinds.
    Actions(Vec<&'static str>),
    /// The rule chain made no decision, or deliberately deferred.
    Noop,
    /// The evaluation was abandoned on an error.
    Error,
    /// The state was finished.
    Finished { success: bool },
}

impl EvalOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

/// One entry in an evaluation state's history.
#[derive(Debug, Clone)]
pub struct EvalRecord {
    pub timestamp: DateTime<Utc>,
    pub rule_path: Option<&'static str>,
    pub outcome: EvalOutcome,
    pub cause: Option<String>,
}

impl EvalRecord {
    pub fn new(rule_path: Option<&'static str>, outcome: EvalOutcome, cause: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            rule_path,
            outcome,
            cause,
        }
    }

    pub fn noop() -> Self {
        Self::new(None, EvalOutcome::Noop, None)
    }

    pub fn error(cause: impl Into<String>) -> Self {
        Self::new(None, EvalOutcome::Error, Some(cause.into()))
    }
}

#[derive(Debug, Clone)]
struct Finished {
    success: bool,
    reason: String,
}

/// In-memory coordination object for the controller's work on one
/// invocation.
pub struct EvalState {
    invocation_id: Uuid,
    span: tracing::Span,
    records: Mutex<Vec<EvalRecord>>,
    finished: Mutex<Option<Finished>>,
    token: Arc<tokio::sync::Mutex<()>>,
}

impl EvalState {
    fn new(invocation_id: Uuid, span: tracing::Span) -> Self {
        Self {
            invocation_id,
            span,
            records: Mutex::new(Vec::new()),
            finished: Mutex::new(None),
            token: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Attempt to claim the exclusive evaluation token without
    /// waiting. Returns `None` when another evaluator holds it.
    pub fn try_acquire(&self) -> Option<EvalGuard> {
        Arc::clone(&self.token).try_lock_owned().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.lock().expect("finished flag poisoned").is_some()
    }

    /// Success flag and reason, once finished.
    pub fn finished_reason(&self) -> Option<(bool, String)> {
        self.finished
            .lock()
            .expect("finished flag poisoned")
            .as_ref()
            .map(|f| (f.success, f.reason.clone()))
    }

    /// Mark the state terminal and append a final record. The first
    /// call wins; later calls are no-ops.
    pub fn finish(&self, success: bool, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut finished = self.finished.lock().expect("finished flag poisoned");
            if finished.is_some() {
                return;
            }
            *finished = Some(Finished {
                success,
                reason: reason.clone(),
            });
        }
        self.record(EvalRecord::new(
            None,
            EvalOutcome::Finished { success },
            Some(reason),
        ));
    }

    /// Append a record to the history.
    pub fn record(&self, record: EvalRecord) {
        self.records
            .lock()
            .expect("record history poisoned")
            .push(record);
    }

    /// The most recent record, if any.
    pub fn last(&self) -> Option<EvalRecord> {
        self.records
            .lock()
            .expect("record history poisoned")
            .last()
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().expect("record history poisoned").len()
    }

    /// Number of error-outcome records in the history.
    pub fn error_count(&self) -> usize {
        self.records
            .lock()
            .expect("record history poisoned")
            .iter()
            .filter(|r| r.outcome.is_error())
            .count()
    }

    /// Cause of the newest error-outcome record.
    pub fn last_error_cause(&self) -> Option<String> {
        self.records
            .lock()
            .expect("record history poisoned")
            .iter()
            .rev()
            .find(|r| r.outcome.is_error())
            .and_then(|r| r.cause.clone())
    }
}

/// Process-wide registry of live evaluation states.
#[derive(Default)]
pub struct EvalStore {
    states: Mutex<HashMap<Uuid, Arc<EvalState>>>,
}

impl EvalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, id: Uuid) -> Option<Arc<EvalState>> {
        self.states
            .lock()
            .expect("eval store poisoned")
            .get(&id)
            .cloned()
    }

    /// Return the existing state for `id`, or create one carrying the
    /// given span. Atomic: two concurrent creators observe the same
    /// resulting state. The boolean is true when this call created it.
    pub fn load_or_store(&self, id: Uuid, span: tracing::Span) -> (Arc<EvalState>, bool) {
        let mut states = self.states.lock().expect("eval store poisoned");
        match states.entry(id) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let state = Arc::new(EvalState::new(id, span));
                entry.insert(Arc::clone(&state));
                (state, true)
            }
        }
    }

    pub fn delete(&self, id: Uuid) {
        self.states.lock().expect("eval store poisoned").remove(&id);
    }

    pub fn list(&self) -> Vec<Arc<EvalState>> {
        self.states
            .lock()
            .expect("eval store poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.lock().expect("eval store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finish every live state with reason "shutdown" and drop them.
    pub fn close(&self) {
        let mut states = self.states.lock().expect("eval store poisoned");
        for state in states.values() {
            state.finish(false, "shutdown");
        }
        states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_store_returns_same_state() {
        let store = EvalStore::new();
        let id = Uuid::new_v4();
        let (first, created) = store.load_or_store(id, tracing::Span::none());
        assert!(created);
        let (second, created) = store.load_or_store(id, tracing::Span::none());
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn try_acquire_is_exclusive() {
        let store = EvalStore::new();
        let (state, _) = store.load_or_store(Uuid::new_v4(), tracing::Span::none());

        let guard = state.try_acquire().expect("first acquire");
        assert!(state.try_acquire().is_none(), "token must be exclusive");
        drop(guard);
        assert!(state.try_acquire().is_some(), "drop must release the token");
    }

    #[test]
    fn finish_is_first_writer_wins() {
        let store = EvalStore::new();
        let (state, _) = store.load_or_store(Uuid::new_v4(), tracing::Span::none());

        state.finish(true, "completed");
        state.finish(false, "late failure");

        let (success, reason) = state.finished_reason().expect("finished");
        assert!(success);
        assert_eq!(reason, "completed");
        assert_eq!(state.record_count(), 1);
    }

    #[test]
    fn error_history_helpers() {
        let store = EvalStore::new();
        let (state, _) = store.load_or_store(Uuid::new_v4(), tracing::Span::none());

        state.record(EvalRecord::noop());
        state.record(EvalRecord::error("first"));
        state.record(EvalRecord::error("second"));

        assert_eq!(state.error_count(), 2);
        assert_eq!(state.last_error_cause().as_deref(), Some("second"));
    }

    #[test]
    fn close_finishes_and_drops_all() {
        let store = EvalStore::new();
        let (state, _) = store.load_or_store(Uuid::new_v4(), tracing::Span::none());
        store.load_or_store(Uuid::new_v4(), tracing::Span::none());

        store.close();

        assert!(store.is_empty());
        let (success, reason) = state.finished_reason().expect("finished");
        assert!(!success);
        assert_eq!(reason, "shutdown");
    }
}
