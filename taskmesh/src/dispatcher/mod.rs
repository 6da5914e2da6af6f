//! Dispatcher-mediated task distribution.
//!
//! The dispatcher is the optional intermediary between the host client
//! and a profile's daemons. It owns the FIFO queue and the daemon
//! roster, speaks to each daemon over a dedicated pair pipe, and
//! dispatches whenever some daemon is idle and the queue is nonempty:
//! least-loaded first, ties to the lowest slot index.
//!
//! Both the dispatcher and the direct-mode pool are driven through the
//! same [`PoolCommand`] channel, wrapped by a [`PoolClient`].

pub mod core;
pub mod queue;
pub mod roster;

pub use self::core::{Dispatcher, DispatcherConfig};
pub use self::queue::TaskQueue;
pub use self::roster::{DaemonRecord, Roster};

use crate::status::StatusSnapshot;
use crate::task::{Task, TaskId};
use crate::url::TransportUrl;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Errors from the `saisei` (URL regeneration) operation.
#[derive(Debug, thiserror::Error)]
pub enum SaiseiError {
    #[error("no daemon slot {0}")]
    InvalidSlot(usize),

    #[error("failed to bind regenerated URL: {0}")]
    Bind(String),

    #[error("URL regeneration requires dispatcher mode")]
    DirectMode,

    #[error("pool is shut down")]
    PoolClosed,
}

/// Commands accepted by a running pool (dispatcher or direct).
pub enum PoolCommand {
    /// Queue a task for dispatch.
    Submit(Task),

    /// Remove a queued task, or forward a cancel frame for an in-flight
    /// one. The handle is already resolved by the host at this point.
    Cancel(TaskId),

    /// Install a new sticky-setup payload and replay it to connected
    /// daemons.
    Everywhere(Bytes),

    /// Regenerate the listen URL of one daemon slot.
    Saisei {
        index: usize,
        reply: oneshot::Sender<Result<TransportUrl, SaiseiError>>,
    },

    /// Snapshot connections and daemon state.
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },

    /// Flush pending tasks as `Canceled`, close daemon pipes, exit.
    Shutdown { done: oneshot::Sender<()> },
}

/// Handle to a running pool task.
pub struct PoolClient {
    commands: mpsc::UnboundedSender<PoolCommand>,
    urls: Vec<TransportUrl>,
    join: Option<JoinHandle<()>>,
}

impl PoolClient {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<PoolCommand>,
        urls: Vec<TransportUrl>,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            urls,
            join: Some(join),
        }
    }

    /// The listen URLs daemons dial (one per slot in dispatcher mode, a
    /// single shared URL in direct mode).
    pub fn urls(&self) -> &[TransportUrl] {
        &self.urls
    }

    pub fn submit(&self, task: Task) {
        let _ = self.commands.send(PoolCommand::Submit(task));
    }

    pub fn cancel(&self, id: TaskId) {
        let _ = self.commands.send(PoolCommand::Cancel(id));
    }

    pub fn everywhere(&self, payload: Bytes) {
        let _ = self.commands.send(PoolCommand::Everywhere(payload));
    }

    pub async fn saisei(&self, index: usize) -> Result<TransportUrl, SaiseiError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Saisei { index, reply })
            .map_err(|_| SaiseiError::PoolClosed)?;
        rx.await.map_err(|_| SaiseiError::PoolClosed)?
    }

    /// `None` when the pool task is already gone.
    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(PoolCommand::Status { reply }).ok()?;
        rx.await.ok()
    }

    /// Shuts the pool down and waits (bounded by `grace`) for it to exit.
    pub async fn shutdown(mut self, grace: Duration) {
        let (done, done_rx) = oneshot::channel();
        if self.commands.send(PoolCommand::Shutdown { done }).is_ok() {
            let _ = tokio::time::timeout(grace, done_rx).await;
        }
        if let Some(join) = self.join.take() {
            let _ = tokio::time::timeout(grace, join).await;
        }
    }
}

impl std::fmt::Debug for PoolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolClient").field("urls", &self.urls).finish()
    }
}
