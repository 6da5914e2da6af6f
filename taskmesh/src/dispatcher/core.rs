//! The dispatcher event loop.
//!
//! A single task owns all dispatcher state (the FIFO queue, the roster,
//! and the per-slot pipe senders) and reacts to two channels: commands
//! from the host client and slot events from the acceptor/reader tasks.
//! Every event is followed by a dispatch pass, so the "some daemon idle
//! and queue nonempty" condition is re-checked whenever it can change.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                             │
//! │  PoolCommand ──►┌───────────┐      ┌────────────────────┐     │
//! │                 │  handle   │──────│  FIFO TaskQueue    │     │
//! │  SlotEvent  ──►│  event    │      └────────────────────┘     │
//! │                 └─────┬─────┘      ┌────────────────────┐     │
//! │                       ▼            │  Roster (records)  │     │
//! │                 try_dispatch ──────│  + slot pipes      │     │
//! │                                    └────────────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::codec::CodecRegistry;
use crate::dispatcher::queue::TaskQueue;
use crate::dispatcher::roster::Roster;
use crate::dispatcher::{PoolClient, PoolCommand, SaiseiError};
use crate::handle::HandleTable;
use crate::protocol::Message;
use crate::status::{DaemonView, StatusSnapshot};
use crate::task::{TaskId, TaskOutcome};
use crate::transport::{Connection, ConnectionSender, Listener, TlsMaterial, TransportError};
use crate::url::TransportUrl;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dispatcher construction parameters.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Base URL; slot `i` listens on [`TransportUrl::for_slot`]`(i)`.
    pub base_url: TransportUrl,

    /// Number of daemon slots.
    pub count: usize,

    /// TLS credentials for the slot listeners.
    pub tls: Option<TlsMaterial>,

    /// Initial sticky-setup payload.
    pub sticky: Bytes,
}

enum SlotEvent {
    Accepted { slot: usize, conn: Connection },
    Frame { slot: usize, gen: u64, message: Message },
    Closed { slot: usize, gen: u64 },
}

struct SlotLink {
    sender: ConnectionSender,
    gen: u64,
    /// Set while a sticky-setup ack is outstanding; the slot is not
    /// released to the queue until it clears.
    awaiting_ack: Option<TaskId>,
}

struct AcceptorHandle {
    cancel: CancellationToken,
}

/// The dispatcher actor.
pub struct Dispatcher {
    profile: String,
    queue: TaskQueue,
    roster: Roster,
    links: Vec<Option<SlotLink>>,
    acceptors: Vec<AcceptorHandle>,
    handles: Arc<HandleTable>,
    codecs: CodecRegistry,
    sticky: Bytes,
    tls: Option<TlsMaterial>,
    commands_rx: mpsc::UnboundedReceiver<PoolCommand>,
    events_tx: mpsc::UnboundedSender<SlotEvent>,
    events_rx: mpsc::UnboundedReceiver<SlotEvent>,
    next_gen: u64,
}

impl Dispatcher {
    /// Binds one listener per slot and spawns the dispatcher task.
    ///
    /// Fails fast on bind errors (invalid URL, port taken) before any
    /// task is accepted.
    pub async fn spawn(
        profile: String,
        config: DispatcherConfig,
        handles: Arc<HandleTable>,
        codecs: CodecRegistry,
    ) -> Result<PoolClient, TransportError> {
        let tls = config.tls.as_ref();
        let listeners = futures::future::try_join_all((0..config.count).map(|i| {
            let slot_url = config.base_url.for_slot(i);
            async move { Listener::bind(&slot_url, tls).await }
        }))
        .await?;
        let urls: Vec<TransportUrl> = listeners.iter().map(|l| l.url().clone()).collect();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut dispatcher = Dispatcher {
            profile,
            queue: TaskQueue::new(),
            roster: Roster::new(urls.clone()),
            links: (0..config.count).map(|_| None).collect(),
            acceptors: Vec::with_capacity(config.count),
            handles,
            codecs,
            sticky: config.sticky,
            tls: config.tls,
            commands_rx,
            events_tx,
            events_rx,
            next_gen: 0,
        };
        for (slot, listener) in listeners.into_iter().enumerate() {
            let acceptor = dispatcher.spawn_acceptor(slot, listener);
            dispatcher.acceptors.push(acceptor);
        }

        let join = tokio::spawn(dispatcher.run());
        Ok(PoolClient::new(commands_tx, urls, join))
    }

    async fn run(mut self) {
        info!(
            profile = %self.profile,
            daemons = self.roster.len(),
            "dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                command = self.commands_rx.recv() => match command {
                    Some(PoolCommand::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Host side dropped the client; same as shutdown.
                        self.shutdown();
                        break;
                    }
                },

                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_slot_event(event);
                    }
                }
            }

            // Re-check the dispatch condition after any activity.
            self.try_dispatch();
        }

        info!(profile = %self.profile, "dispatcher stopped");
    }

    async fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit(task) => {
                debug!(
                    profile = %self.profile,
                    task_id = %task.id,
                    queue_depth = self.queue.len(),
                    "task queued"
                );
                self.queue.push_back(task);
            }
            PoolCommand::Cancel(id) => {
                if self.queue.remove(&id).is_some() {
                    debug!(task_id = %id, "canceled task removed from queue");
                    return;
                }
                // In flight: forward a cancel frame; the daemon keeps
                // running to completion and the late result is dropped.
                for slot in 0..self.roster.len() {
                    if self.roster.get(slot).and_then(|r| r.inflight.clone()) == Some(id.clone()) {
                        if let Some(link) = &self.links[slot] {
                            let _ = link.sender.send(Message::Cancel { id: id.clone() });
                            debug!(task_id = %id, slot, "cancel frame sent");
                        }
                        return;
                    }
                }
                debug!(task_id = %id, "cancel for unknown task");
            }
            PoolCommand::Everywhere(payload) => {
                self.sticky = payload;
                for slot in 0..self.links.len() {
                    self.send_sticky(slot);
                }
            }
            PoolCommand::Saisei { index, reply } => {
                let result = self.do_saisei(index).await;
                let _ = reply.send(result);
            }
            PoolCommand::Status { reply } => {
                let _ = reply.send(StatusSnapshot {
                    connections: self.roster.online_count(),
                    daemons: DaemonView::Matrix(self.roster.snapshot()),
                });
            }
            PoolCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn handle_slot_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::Accepted { slot, conn } => {
                if let Some(old) = self.links[slot].take() {
                    // A replacement connection supersedes the stale one.
                    old.sender.close();
                    if let Some(lost) = self.roster.mark_disconnected(slot) {
                        self.handles.resolve(&lost, TaskOutcome::TransportLost);
                    }
                }

                self.next_gen += 1;
                let gen = self.next_gen;
                let (sender, mut receiver) = conn.split();

                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    while let Some(message) = receiver.recv().await {
                        if events.send(SlotEvent::Frame { slot, gen, message }).is_err() {
                            return;
                        }
                    }
                    let _ = events.send(SlotEvent::Closed { slot, gen });
                });

                self.roster.mark_connected(slot);
                self.links[slot] = Some(SlotLink {
                    sender,
                    gen,
                    awaiting_ack: None,
                });
                info!(
                    profile = %self.profile,
                    slot,
                    instance = self.roster.get(slot).map(|r| r.instance_counter).unwrap_or(0),
                    "daemon connected"
                );

                // Replay sticky setup before releasing the slot to the
                // queue; the ack clears `awaiting_ack`.
                self.send_sticky(slot);
            }

            SlotEvent::Frame { slot, gen, message } => {
                let Some(link) = &mut self.links[slot] else {
                    return;
                };
                if link.gen != gen {
                    return;
                }

                match message {
                    Message::ResultOk {
                        id,
                        payload,
                        extensions,
                    } => {
                        if link.awaiting_ack.as_ref() == Some(&id) {
                            link.awaiting_ack = None;
                            debug!(slot, "sticky setup acknowledged");
                            return;
                        }
                        let outcome = match self.codecs.decode(&extensions) {
                            Ok(refs) => TaskOutcome::Ok { payload, refs },
                            Err(err) => TaskOutcome::EvalError {
                                message: err.to_string(),
                                stack: Vec::new(),
                            },
                        };
                        self.complete(slot, id, outcome);
                    }
                    Message::ResultErr { id, message, stack } => {
                        self.complete(slot, id, TaskOutcome::EvalError { message, stack });
                    }
                    Message::ResultInterrupt { id } => {
                        self.complete(slot, id, TaskOutcome::Interrupt);
                    }
                    other => {
                        warn!(slot, message = ?other.task_id(), "unexpected frame from daemon");
                    }
                }
            }

            SlotEvent::Closed { slot, gen } => {
                let stale = match &self.links[slot] {
                    Some(link) => link.gen != gen,
                    None => true,
                };
                if stale {
                    return;
                }
                self.links[slot] = None;
                match self.roster.mark_disconnected(slot) {
                    Some(lost) => {
                        // Never silent: the in-flight task surfaces as
                        // TransportLost. It is not requeued.
                        warn!(
                            profile = %self.profile,
                            slot,
                            task_id = %lost,
                            "daemon lost with task in flight"
                        );
                        self.handles.resolve(&lost, TaskOutcome::TransportLost);
                    }
                    None => {
                        info!(profile = %self.profile, slot, "daemon disconnected");
                    }
                }
            }
        }
    }

    /// Completion accounting. Runs even when the handle is already gone
    /// (timed out or canceled): the slot frees up and `complete_count`
    /// still advances.
    fn complete(&mut self, slot: usize, id: TaskId, outcome: TaskOutcome) {
        self.roster.complete(slot);
        if self.handles.resolve(&id, outcome) {
            debug!(profile = %self.profile, task_id = %id, slot, "task completed");
        } else {
            debug!(task_id = %id, slot, "late result dropped");
        }
    }

    fn send_sticky(&mut self, slot: usize) {
        let sticky = self.sticky.clone();
        if let Some(link) = &mut self.links[slot] {
            let setup_id = TaskId::auto();
            let message = Message::Setup {
                id: setup_id.clone(),
                payload: sticky,
            };
            if link.sender.send(message).is_ok() {
                link.awaiting_ack = Some(setup_id);
            }
        }
    }

    fn try_dispatch(&mut self) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let links = &self.links;
            let Some(slot) = self
                .roster
                .select_idle(|i| links[i].as_ref().is_some_and(|l| l.awaiting_ack.is_none()))
            else {
                return;
            };

            // Skip tasks whose handle is already resolved (canceled
            // before dispatch).
            let task = loop {
                match self.queue.pop_front() {
                    Some(task) if self.handles.contains(&task.id) => break Some(task),
                    Some(task) => debug!(task_id = %task.id, "skipping resolved task"),
                    None => break None,
                }
            };
            let Some(task) = task else { return };

            let link = self.links[slot].as_ref().expect("selected slot has a link");
            let message = Message::Task {
                id: task.id.clone(),
                payload: task.payload.clone(),
                extensions: task.extensions.clone(),
            };
            if link.sender.send(message).is_err() {
                // The pipe died between selection and send; the closed
                // event is still in flight. Requeue and retry elsewhere.
                warn!(slot, "daemon pipe closed during dispatch");
                self.links[slot] = None;
                self.roster.mark_disconnected(slot);
                self.queue.push_front(task);
                continue;
            }

            info!(
                profile = %self.profile,
                task_id = %task.id,
                slot,
                "task dispatched"
            );
            self.roster.assign(slot, task.id.clone());
        }
    }

    async fn do_saisei(&mut self, index: usize) -> Result<TransportUrl, SaiseiError> {
        if index >= self.roster.len() {
            return Err(SaiseiError::InvalidSlot(index));
        }

        self.acceptors[index].cancel.cancel();
        if let Some(link) = self.links[index].take() {
            link.sender.close();
        }
        if let Some(lost) = self.roster.mark_disconnected(index) {
            self.handles.resolve(&lost, TaskOutcome::TransportLost);
        }

        let fresh = self
            .roster
            .get(index)
            .expect("index validated above")
            .url
            .regenerate();
        let listener = Listener::bind(&fresh, self.tls.as_ref())
            .await
            .map_err(|err| SaiseiError::Bind(err.to_string()))?;
        let bound = listener.url().clone();
        self.acceptors[index] = self.spawn_acceptor(index, listener);
        self.roster.regenerate(index, bound.clone());

        info!(profile = %self.profile, slot = index, url = %bound, "slot URL regenerated");
        Ok(bound)
    }

    fn spawn_acceptor(&self, slot: usize, mut listener: Listener) -> AcceptorHandle {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Some(conn) => {
                            if events.send(SlotEvent::Accepted { slot, conn }).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            listener.close();
        });

        AcceptorHandle { cancel }
    }

    fn shutdown(&mut self) {
        info!(profile = %self.profile, "dispatcher shutting down");

        // Flush: every pending handle (queued or in flight) resolves as
        // Canceled before the pipes go down.
        let canceled = self.handles.drain_resolve(TaskOutcome::Canceled);
        if canceled > 0 {
            debug!(profile = %self.profile, count = canceled, "pending handles canceled");
        }
        self.queue.drain();

        for acceptor in &self.acceptors {
            acceptor.cancel.cancel();
        }
        for link in self.links.iter_mut() {
            if let Some(link) = link.take() {
                // Dropping the sender after this lets the write pump
                // flush the frame before the connection dies, which
                // triggers autoexit on the daemon.
                let _ = link.sender.send(Message::Shutdown);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use crate::handle;
    use crate::task::Task;
    use crate::transport::dial;
    use std::time::Duration;

    async fn spawn_dispatcher(
        count: usize,
    ) -> (PoolClient, Arc<HandleTable>) {
        let handles = Arc::new(HandleTable::new());
        let config = DispatcherConfig {
            base_url: "tcp://127.0.0.1:0".parse().unwrap(),
            count,
            tls: None,
            sticky: Bytes::new(),
        };
        let client = Dispatcher::spawn(
            "test".into(),
            config,
            Arc::clone(&handles),
            CodecRegistry::new(),
        )
        .await
        .unwrap();
        (client, handles)
    }

    /// Connects a hand-driven daemon to a slot URL and completes the
    /// sticky handshake.
    async fn connect_fake_daemon(url: &TransportUrl) -> Connection {
        let cancel = CancellationToken::new();
        let mut conn = dial(url, None, &RetrySettings::default(), &cancel)
            .await
            .unwrap();
        match conn.recv().await.unwrap() {
            Message::Setup { id, .. } => {
                conn.send(Message::ResultOk {
                    id,
                    payload: Bytes::new(),
                    extensions: vec![],
                })
                .unwrap();
            }
            other => panic!("expected sticky setup, got {:?}", other),
        }
        conn
    }

    fn submit_task(client: &PoolClient, handles: &HandleTable) -> (TaskId, crate::handle::TaskHandle) {
        let task = Task::new(Bytes::from_static(b"work"), vec![], None, "test");
        let id = task.id.clone();
        let (h, resolver) = handle::pair(id.clone(), "test");
        handles.insert(resolver);
        client.submit(task);
        (id, h)
    }

    #[tokio::test]
    async fn test_assignment_is_fifo_on_a_single_daemon() {
        let (client, handles) = spawn_dispatcher(1).await;
        let mut conn = connect_fake_daemon(&client.urls()[0]).await;

        let mut submitted = Vec::new();
        for _ in 0..3 {
            submitted.push(submit_task(&client, &handles).0);
        }

        for expected in submitted {
            match conn.recv().await.unwrap() {
                Message::Task { id, .. } => {
                    assert_eq!(id, expected);
                    conn.send(Message::ResultOk {
                        id,
                        payload: Bytes::from_static(b"done"),
                        extensions: vec![],
                    })
                    .unwrap();
                }
                other => panic!("expected task frame, got {:?}", other),
            }
        }

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_completion_resolves_handle() {
        let (client, handles) = spawn_dispatcher(1).await;
        let mut conn = connect_fake_daemon(&client.urls()[0]).await;

        let (_id, mut h) = submit_task(&client, &handles);
        match conn.recv().await.unwrap() {
            Message::Task { id, payload, .. } => {
                conn.send(Message::ResultOk {
                    id,
                    payload,
                    extensions: vec![],
                })
                .unwrap();
            }
            other => panic!("expected task frame, got {:?}", other),
        }

        let outcome = h.wait_within(Duration::from_secs(1)).await.unwrap();
        assert!(outcome.is_ok());
        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_disconnect_in_flight_surfaces_transport_lost() {
        let (client, handles) = spawn_dispatcher(1).await;
        let mut conn = connect_fake_daemon(&client.urls()[0]).await;

        let (_id, mut h) = submit_task(&client, &handles);
        // Take the task, then die without answering.
        match conn.recv().await.unwrap() {
            Message::Task { .. } => conn.close(),
            other => panic!("expected task frame, got {:?}", other),
        }

        let outcome = h.wait_within(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::TransportLost);
        assert_eq!(outcome.error_value(), Some(7));
        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight_per_daemon() {
        let (client, handles) = spawn_dispatcher(1).await;
        let mut conn = connect_fake_daemon(&client.urls()[0]).await;

        let (first, _h1) = submit_task(&client, &handles);
        let (_second, _h2) = submit_task(&client, &handles);

        match conn.recv().await.unwrap() {
            Message::Task { id, .. } => assert_eq!(id, first),
            other => panic!("expected first task, got {:?}", other),
        }

        // Nothing else arrives until the first task completes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!conn.poll());

        conn.send(Message::ResultOk {
            id: first,
            payload: Bytes::new(),
            extensions: vec![],
        })
        .unwrap();
        match conn.recv().await.unwrap() {
            Message::Task { .. } => {}
            other => panic!("expected second task, got {:?}", other),
        }

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_late_result_still_counts_completion() {
        let (client, handles) = spawn_dispatcher(1).await;
        let mut conn = connect_fake_daemon(&client.urls()[0]).await;

        let (id, mut h) = submit_task(&client, &handles);
        match conn.recv().await.unwrap() {
            Message::Task { .. } => {}
            other => panic!("expected task frame, got {:?}", other),
        }

        // Host-side timeout fires first.
        assert!(handles.resolve(&id, TaskOutcome::Timeout));
        assert_eq!(h.wait().await, TaskOutcome::Timeout);

        // The daemon eventually answers; the result is dropped but the
        // counters advance.
        conn.send(Message::ResultOk {
            id: id.clone(),
            payload: Bytes::new(),
            extensions: vec![],
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = client.status().await.unwrap();
        let rows = status.daemons.matrix().unwrap().to_vec();
        assert_eq!(rows[0].assigned_count, 1);
        assert_eq!(rows[0].complete_count, 1);
        assert!(rows[0].inflight.is_none());
        // Handle keeps its first resolution.
        assert_eq!(h.poll(), Some(TaskOutcome::Timeout));

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_as_canceled() {
        let (client, handles) = spawn_dispatcher(1).await;
        // No daemon connects; tasks stay queued.
        let (_ida, mut ha) = submit_task(&client, &handles);
        let (_idb, mut hb) = submit_task(&client, &handles);

        client.shutdown(Duration::from_secs(1)).await;

        assert_eq!(ha.wait().await, TaskOutcome::Canceled);
        assert_eq!(hb.wait().await, TaskOutcome::Canceled);
    }

    #[tokio::test]
    async fn test_saisei_regenerates_slot_url() {
        let (client, _handles) = spawn_dispatcher(1).await;
        let old_url = client.urls()[0].clone();

        let fresh = client.saisei(0).await.unwrap();
        assert_ne!(fresh, old_url);

        let status = client.status().await.unwrap();
        let rows = status.daemons.matrix().unwrap().to_vec();
        assert!(rows[0].instance_counter <= 0);
        assert!(!rows[0].online);

        // A daemon connecting on the fresh URL goes positive again.
        let _conn = connect_fake_daemon(&fresh).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = client.status().await.unwrap();
        let rows = status.daemons.matrix().unwrap().to_vec();
        assert!(rows[0].online);
        assert!(rows[0].instance_counter > 0);

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_saisei_rejects_invalid_slot() {
        let (client, _handles) = spawn_dispatcher(1).await;
        assert!(matches!(
            client.saisei(9).await,
            Err(SaiseiError::InvalidSlot(9))
        ));
        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_least_loaded_selection_across_two_daemons() {
        let (client, handles) = spawn_dispatcher(2).await;
        let mut first = connect_fake_daemon(&client.urls()[0]).await;
        let mut second = connect_fake_daemon(&client.urls()[1]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Two tasks land on distinct daemons.
        submit_task(&client, &handles);
        submit_task(&client, &handles);

        let a = tokio::time::timeout(Duration::from_secs(1), first.recv())
            .await
            .unwrap()
            .unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), second.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(a, Message::Task { .. }));
        assert!(matches!(b, Message::Task { .. }));

        client.shutdown(Duration::from_secs(1)).await;
    }
}
