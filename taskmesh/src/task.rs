//! Task and outcome types.
//!
//! A [`Task`] is immutable once submitted: an opaque payload, its
//! extension-table entries, an optional host-side timeout and the owning
//! profile. Results come back as [`TaskOutcome`] values; remote-origin
//! failures are data, never errors raised across the public boundary.

use crate::codec::{ExtEntry, ExternalRef};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global counter for generating unique task IDs.
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sentinel error value: task timed out.
pub const ERROR_VALUE_TIMEOUT: u8 = 5;

/// Sentinel error value: connection reset.
pub const ERROR_VALUE_CONNECTION_RESET: u8 = 7;

/// Sentinel error value: evaluation aborted.
pub const ERROR_VALUE_ABORTED: u8 = 19;

/// Sentinel error value: task canceled.
pub const ERROR_VALUE_CANCELED: u8 = 20;

/// Opaque unique identifier for a submitted task.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task ID with the given string value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a unique auto-generated task ID (`task-{counter}`).
    pub fn auto() -> Self {
        let counter = TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("task-{}", counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A unit of work queued or in flight on a profile.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: Bytes,
    pub extensions: Vec<ExtEntry>,
    pub timeout: Option<Duration>,
    pub profile: String,
    pub submitted_at: Instant,
}

impl Task {
    pub fn new(
        payload: Bytes,
        extensions: Vec<ExtEntry>,
        timeout: Option<Duration>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::auto(),
            payload,
            extensions,
            timeout,
            profile: profile.into(),
            submitted_at: Instant::now(),
        }
    }
}

/// Result of a task, delivered through its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Successful evaluation: result payload plus decoded reference objects.
    Ok {
        payload: Bytes,
        refs: Vec<ExternalRef>,
    },

    /// The daemon's evaluation failed; stack frames captured up to the
    /// point of failure.
    EvalError { message: String, stack: Vec<String> },

    /// Evaluation was interrupted on the daemon.
    Interrupt,

    /// The host-side timeout expired before a result arrived.
    Timeout,

    /// The caller canceled the task.
    Canceled,

    /// The connection carrying the task was lost while it was in flight.
    TransportLost,
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Ok { .. })
    }

    /// True for structured evaluation failures returned by a daemon.
    pub fn is_eval_error(&self) -> bool {
        matches!(self, TaskOutcome::EvalError { .. })
    }

    /// True when the daemon's evaluation was interrupted.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TaskOutcome::Interrupt)
    }

    /// Union predicate over every sentinel-bearing failure.
    pub fn is_error_value(&self) -> bool {
        self.error_value().is_some()
    }

    /// The numeric transport-level sentinel for this outcome, if any.
    pub fn error_value(&self) -> Option<u8> {
        match self {
            TaskOutcome::Timeout => Some(ERROR_VALUE_TIMEOUT),
            TaskOutcome::TransportLost => Some(ERROR_VALUE_CONNECTION_RESET),
            TaskOutcome::Interrupt => Some(ERROR_VALUE_ABORTED),
            TaskOutcome::Canceled => Some(ERROR_VALUE_CANCELED),
            TaskOutcome::Ok { .. } | TaskOutcome::EvalError { .. } => None,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Ok { payload, refs } => {
                write!(f, "ok ({} bytes, {} refs)", payload.len(), refs.len())
            }
            TaskOutcome::EvalError { message, .. } => write!(f, "evaluation error: {}", message),
            TaskOutcome::Interrupt => write!(f, "interrupted"),
            TaskOutcome::Timeout => write!(f, "timed out"),
            TaskOutcome::Canceled => write!(f, "canceled"),
            TaskOutcome::TransportLost => write!(f, "transport lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_ids_are_unique() {
        let a = TaskId::auto();
        let b = TaskId::auto();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("task-"));
    }

    #[test]
    fn test_error_values_match_sentinels() {
        assert_eq!(TaskOutcome::Timeout.error_value(), Some(5));
        assert_eq!(TaskOutcome::TransportLost.error_value(), Some(7));
        assert_eq!(TaskOutcome::Interrupt.error_value(), Some(19));
        assert_eq!(TaskOutcome::Canceled.error_value(), Some(20));
    }

    #[test]
    fn test_eval_error_is_not_an_error_value() {
        let err = TaskOutcome::EvalError {
            message: "division by zero".into(),
            stack: vec!["frame 1".into()],
        };
        assert!(err.is_eval_error());
        assert!(!err.is_error_value());
        assert_eq!(err.error_value(), None);
    }

    #[test]
    fn test_error_value_union_predicate() {
        assert!(TaskOutcome::Timeout.is_error_value());
        assert!(TaskOutcome::Canceled.is_error_value());
        assert!(TaskOutcome::TransportLost.is_error_value());
        assert!(TaskOutcome::Interrupt.is_error_value());
        let ok = TaskOutcome::Ok {
            payload: Bytes::new(),
            refs: vec![],
        };
        assert!(!ok.is_error_value());
    }

    #[test]
    fn test_task_records_profile_and_timeout() {
        let task = Task::new(
            Bytes::from_static(b"payload"),
            vec![],
            Some(Duration::from_millis(250)),
            "gpu",
        );
        assert_eq!(task.profile, "gpu");
        assert_eq!(task.timeout, Some(Duration::from_millis(250)));
    }
}
