//! Task handles: the caller-held side of a pending task.
//!
//! A [`TaskHandle`] is returned by `submit` and resolves asynchronously
//! when a result arrives. State travels over a `watch` channel and the
//! outcome sits in a shared holder, so `poll` after resolution returns the
//! same outcome indefinitely.
//!
//! Resolution is exactly-once by construction: the single
//! [`HandleResolver`] is consumed by `resolve`, and the per-profile
//! [`HandleTable`] hands it out through `remove`: completion, cancel and
//! timeout race on the removal, and whichever path wins performs the one
//! resolution.

use crate::task::{TaskId, TaskOutcome};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Caller-visible state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The task is queued or in flight.
    Pending,

    /// A result arrived (any variant other than `Canceled`).
    Resolved,

    /// The task was canceled.
    Canceled,
}

/// Raised by [`TaskHandle::wait_within`] when the deadline passes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded while awaiting task result")]
pub struct DeadlineExceeded;

struct Shared {
    outcome: Mutex<Option<TaskOutcome>>,
}

/// Caller-held reference to a pending or resolved task.
///
/// Cloneable; all clones observe the same resolution.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    profile: String,
    state_rx: watch::Receiver<HandleState>,
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Current state without consuming anything.
    pub fn state(&self) -> HandleState {
        *self.state_rx.borrow()
    }

    /// Non-blocking poll: `None` while pending, otherwise the outcome.
    ///
    /// Stable after resolution: repeated polls return the same value.
    pub fn poll(&self) -> Option<TaskOutcome> {
        if self.state() == HandleState::Pending {
            return None;
        }
        self.shared.outcome.lock().expect("handle holder poisoned").clone()
    }

    /// Suspends until the handle resolves.
    ///
    /// If the resolver is dropped without resolving (abnormal pool death),
    /// the handle reports `TransportLost`; loss is signalled, never
    /// silent.
    pub async fn wait(&mut self) -> TaskOutcome {
        loop {
            if let Some(outcome) = self.poll() {
                return outcome;
            }
            if self.state_rx.changed().await.is_err() {
                return self.poll().unwrap_or(TaskOutcome::TransportLost);
            }
        }
    }

    /// Suspends until the handle resolves or the deadline passes.
    pub async fn wait_within(&mut self, deadline: Duration) -> Result<TaskOutcome, DeadlineExceeded> {
        tokio::time::timeout(deadline, self.wait())
            .await
            .map_err(|_| DeadlineExceeded)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("profile", &self.profile)
            .field("state", &self.state())
            .finish()
    }
}

/// The single writer for a handle; consumed by [`HandleResolver::resolve`].
pub struct HandleResolver {
    task_id: TaskId,
    state_tx: watch::Sender<HandleState>,
    shared: Arc<Shared>,
}

impl HandleResolver {
    /// Resolves the handle. `Canceled` outcomes land in the `Canceled`
    /// state; everything else in `Resolved`.
    pub fn resolve(self, outcome: TaskOutcome) {
        let state = if matches!(outcome, TaskOutcome::Canceled) {
            HandleState::Canceled
        } else {
            HandleState::Resolved
        };
        *self.shared.outcome.lock().expect("handle holder poisoned") = Some(outcome);
        let _ = self.state_tx.send(state);
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

/// Creates a pending handle and its resolver.
pub fn pair(task_id: TaskId, profile: impl Into<String>) -> (TaskHandle, HandleResolver) {
    let (state_tx, state_rx) = watch::channel(HandleState::Pending);
    let shared = Arc::new(Shared {
        outcome: Mutex::new(None),
    });
    let handle = TaskHandle {
        task_id: task_id.clone(),
        profile: profile.into(),
        state_rx,
        shared: Arc::clone(&shared),
    };
    let resolver = HandleResolver {
        task_id,
        state_tx,
        shared,
    };
    (handle, resolver)
}

/// Per-profile table of unresolved handles.
///
/// Removing an entry transfers the sole right to resolve it, which makes
/// every completion path exactly-once without further coordination.
#[derive(Default)]
pub struct HandleTable {
    entries: DashMap<TaskId, HandleResolver>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resolver: HandleResolver) {
        self.entries.insert(resolver.task_id().clone(), resolver);
    }

    /// Whether the task still has an unresolved handle.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves the task's handle if it is still pending.
    ///
    /// Returns `false` when the handle was already resolved by another
    /// path (the caller should drop the outcome).
    pub fn resolve(&self, id: &TaskId, outcome: TaskOutcome) -> bool {
        match self.entries.remove(id) {
            Some((_, resolver)) => {
                resolver.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolves every remaining handle with clones of `outcome` (teardown
    /// flush).
    pub fn drain_resolve(&self, outcome: TaskOutcome) -> usize {
        let ids: Vec<TaskId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut resolved = 0;
        for id in ids {
            if self.resolve(&id, outcome.clone()) {
                resolved += 1;
            }
        }
        resolved
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("pending", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ok_outcome() -> TaskOutcome {
        TaskOutcome::Ok {
            payload: Bytes::from_static(b"result"),
            refs: vec![],
        }
    }

    #[tokio::test]
    async fn test_handle_starts_pending() {
        let (handle, _resolver) = pair(TaskId::new("t"), "default");
        assert_eq!(handle.state(), HandleState::Pending);
        assert_eq!(handle.poll(), None);
    }

    #[tokio::test]
    async fn test_resolve_then_poll_is_stable() {
        let (handle, resolver) = pair(TaskId::new("t"), "default");
        resolver.resolve(ok_outcome());

        assert_eq!(handle.state(), HandleState::Resolved);
        assert_eq!(handle.poll(), Some(ok_outcome()));
        // Repeated polls keep returning the same outcome.
        assert_eq!(handle.poll(), Some(ok_outcome()));
    }

    #[tokio::test]
    async fn test_canceled_outcome_lands_in_canceled_state() {
        let (handle, resolver) = pair(TaskId::new("t"), "default");
        resolver.resolve(TaskOutcome::Canceled);
        assert_eq!(handle.state(), HandleState::Canceled);
        assert_eq!(handle.poll(), Some(TaskOutcome::Canceled));
    }

    #[tokio::test]
    async fn test_wait_sees_late_resolution() {
        let (mut handle, resolver) = pair(TaskId::new("t"), "default");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(ok_outcome());
        });
        assert_eq!(handle.wait().await, ok_outcome());
    }

    #[tokio::test]
    async fn test_wait_within_times_out() {
        let (mut handle, _resolver) = pair(TaskId::new("t"), "default");
        let err = handle.wait_within(Duration::from_millis(20)).await;
        assert_eq!(err, Err(DeadlineExceeded));
        // Still pending afterwards.
        assert_eq!(handle.state(), HandleState::Pending);
    }

    #[tokio::test]
    async fn test_dropped_resolver_reports_transport_lost() {
        let (mut handle, resolver) = pair(TaskId::new("t"), "default");
        drop(resolver);
        assert_eq!(handle.wait().await, TaskOutcome::TransportLost);
    }

    #[tokio::test]
    async fn test_table_resolves_exactly_once() {
        let table = HandleTable::new();
        let (handle, resolver) = pair(TaskId::new("t"), "default");
        table.insert(resolver);

        assert!(table.resolve(handle.id(), ok_outcome()));
        // Second resolution attempt loses the race and reports false.
        assert!(!table.resolve(handle.id(), TaskOutcome::Timeout));
        assert_eq!(handle.poll(), Some(ok_outcome()));
    }

    #[tokio::test]
    async fn test_table_drain_resolves_all_pending() {
        let table = HandleTable::new();
        let mut handles = Vec::new();
        for i in 0..5 {
            let (handle, resolver) = pair(TaskId::new(format!("t-{}", i)), "default");
            table.insert(resolver);
            handles.push(handle);
        }
        assert_eq!(table.drain_resolve(TaskOutcome::Canceled), 5);
        assert!(table.is_empty());
        for handle in handles {
            assert_eq!(handle.poll(), Some(TaskOutcome::Canceled));
        }
    }
}
