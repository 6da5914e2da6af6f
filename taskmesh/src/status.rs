//! Profile status snapshots.

use crate::dispatcher::roster::DaemonRecord;

/// Point-in-time view of one profile's pool.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Number of live daemon connections.
    pub connections: usize,

    /// Daemon details, shaped by the profile's mode.
    pub daemons: DaemonView,
}

impl StatusSnapshot {
    /// Status of a profile with no configured pool.
    pub fn empty() -> Self {
        Self {
            connections: 0,
            daemons: DaemonView::Urls(Vec::new()),
        }
    }
}

/// Daemon details: direct mode reports listen URLs, dispatcher mode the
/// full per-slot matrix `[i, online, instance, assigned, complete]`.
#[derive(Debug, Clone)]
pub enum DaemonView {
    Urls(Vec<String>),
    Matrix(Vec<DaemonRecord>),
}

impl DaemonView {
    /// Rows of the dispatcher matrix, if this is one.
    pub fn matrix(&self) -> Option<&[DaemonRecord]> {
        match self {
            DaemonView::Matrix(rows) => Some(rows),
            DaemonView::Urls(_) => None,
        }
    }

    /// Listen URLs, if this is the direct-mode view.
    pub fn urls(&self) -> Option<&[String]> {
        match self {
            DaemonView::Urls(urls) => Some(urls),
            DaemonView::Matrix(_) => None,
        }
    }
}
