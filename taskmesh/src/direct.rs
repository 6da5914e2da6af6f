//! Direct-mode pool: no intermediary scheduler.
//!
//! One shared listener; every daemon of the profile dials the same URL.
//! Each submission goes to whichever connected daemon is free first,
//! the push/pull trade-off: no central FIFO queue discipline and no
//! least-loaded guarantee across daemons, in exchange for no
//! intermediary. Per connection the discipline is req/rep: one task
//! out, one result back.
//!
//! Handle semantics (timeout, cancel, transport loss) match dispatcher
//! mode; status reports the listen URL instead of the slot matrix.

use crate::codec::CodecRegistry;
use crate::dispatcher::queue::TaskQueue;
use crate::dispatcher::{PoolClient, PoolCommand, SaiseiError};
use crate::handle::HandleTable;
use crate::protocol::Message;
use crate::status::{DaemonView, StatusSnapshot};
use crate::task::{TaskId, TaskOutcome};
use crate::transport::{Connection, ConnectionSender, Listener, TlsMaterial, TransportError};
use crate::url::TransportUrl;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Direct-mode construction parameters.
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// The single shared listen URL daemons dial.
    pub url: TransportUrl,

    /// TLS credentials for the listener.
    pub tls: Option<TlsMaterial>,

    /// Initial sticky-setup payload.
    pub sticky: Bytes,
}

enum ConnEvent {
    Accepted(Connection),
    Frame { gen: u64, message: Message },
    Closed { gen: u64 },
}

struct DirectLink {
    sender: ConnectionSender,
    inflight: Option<TaskId>,
    awaiting_ack: Option<TaskId>,
}

/// The direct-mode pool actor.
pub struct DirectPool {
    profile: String,
    url: TransportUrl,
    queue: TaskQueue,
    conns: HashMap<u64, DirectLink>,
    handles: Arc<HandleTable>,
    codecs: CodecRegistry,
    sticky: Bytes,
    accept_cancel: CancellationToken,
    commands_rx: mpsc::UnboundedReceiver<PoolCommand>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    next_gen: u64,
}

impl DirectPool {
    /// Binds the shared listener and spawns the pool task.
    pub async fn spawn(
        profile: String,
        config: DirectConfig,
        handles: Arc<HandleTable>,
        codecs: CodecRegistry,
    ) -> Result<PoolClient, TransportError> {
        let mut listener = Listener::bind(&config.url, config.tls.as_ref()).await?;
        let bound = listener.url().clone();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let accept_cancel = CancellationToken::new();
        let acceptor_cancel = accept_cancel.clone();
        let acceptor_events = events_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = acceptor_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Some(conn) => {
                            if acceptor_events.send(ConnEvent::Accepted(conn)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            listener.close();
        });

        let pool = DirectPool {
            profile,
            url: bound.clone(),
            queue: TaskQueue::new(),
            conns: HashMap::new(),
            handles,
            codecs,
            sticky: config.sticky,
            accept_cancel,
            commands_rx,
            events_tx,
            events_rx,
            next_gen: 0,
        };
        let join = tokio::spawn(pool.run());
        Ok(PoolClient::new(commands_tx, vec![bound], join))
    }

    async fn run(mut self) {
        info!(profile = %self.profile, url = %self.url, "direct pool started");

        loop {
            tokio::select! {
                biased;

                command = self.commands_rx.recv() => match command {
                    Some(PoolCommand::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
            }

            self.try_dispatch();
        }

        info!(profile = %self.profile, "direct pool stopped");
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit(task) => {
                debug!(profile = %self.profile, task_id = %task.id, "task queued");
                self.queue.push_back(task);
            }
            PoolCommand::Cancel(id) => {
                if self.queue.remove(&id).is_some() {
                    debug!(task_id = %id, "canceled task removed from queue");
                    return;
                }
                for link in self.conns.values() {
                    if link.inflight.as_ref() == Some(&id) {
                        let _ = link.sender.send(Message::Cancel { id: id.clone() });
                        debug!(task_id = %id, "cancel frame sent");
                        return;
                    }
                }
            }
            PoolCommand::Everywhere(payload) => {
                self.sticky = payload;
                let sticky = self.sticky.clone();
                for link in self.conns.values_mut() {
                    let setup_id = TaskId::auto();
                    let message = Message::Setup {
                        id: setup_id.clone(),
                        payload: sticky.clone(),
                    };
                    if link.sender.send(message).is_ok() {
                        link.awaiting_ack = Some(setup_id);
                    }
                }
            }
            PoolCommand::Saisei { reply, .. } => {
                let _ = reply.send(Err(SaiseiError::DirectMode));
            }
            PoolCommand::Status { reply } => {
                let _ = reply.send(StatusSnapshot {
                    connections: self.conns.len(),
                    daemons: DaemonView::Urls(vec![self.url.to_string()]),
                });
            }
            PoolCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Accepted(conn) => {
                self.next_gen += 1;
                let gen = self.next_gen;
                let (sender, mut receiver) = conn.split();

                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    while let Some(message) = receiver.recv().await {
                        if events.send(ConnEvent::Frame { gen, message }).is_err() {
                            return;
                        }
                    }
                    let _ = events.send(ConnEvent::Closed { gen });
                });

                let setup_id = TaskId::auto();
                let handshake = Message::Setup {
                    id: setup_id.clone(),
                    payload: self.sticky.clone(),
                };
                let awaiting_ack = sender.send(handshake).ok().map(|_| setup_id);

                self.conns.insert(
                    gen,
                    DirectLink {
                        sender,
                        inflight: None,
                        awaiting_ack,
                    },
                );
                info!(profile = %self.profile, connections = self.conns.len(), "daemon connected");
            }

            ConnEvent::Frame { gen, message } => {
                let Some(link) = self.conns.get_mut(&gen) else {
                    return;
                };
                match message {
                    Message::ResultOk {
                        id,
                        payload,
                        extensions,
                    } => {
                        if link.awaiting_ack.as_ref() == Some(&id) {
                            link.awaiting_ack = None;
                            debug!(profile = %self.profile, "sticky setup acknowledged");
                            return;
                        }
                        link.inflight = None;
                        let outcome = match self.codecs.decode(&extensions) {
                            Ok(refs) => TaskOutcome::Ok { payload, refs },
                            Err(err) => TaskOutcome::EvalError {
                                message: err.to_string(),
                                stack: Vec::new(),
                            },
                        };
                        if !self.handles.resolve(&id, outcome) {
                            debug!(task_id = %id, "late result dropped");
                        }
                    }
                    Message::ResultErr { id, message, stack } => {
                        link.inflight = None;
                        self.handles
                            .resolve(&id, TaskOutcome::EvalError { message, stack });
                    }
                    Message::ResultInterrupt { id } => {
                        link.inflight = None;
                        self.handles.resolve(&id, TaskOutcome::Interrupt);
                    }
                    other => {
                        warn!(message = ?other.task_id(), "unexpected frame from daemon");
                    }
                }
            }

            ConnEvent::Closed { gen } => {
                let Some(link) = self.conns.remove(&gen) else {
                    return;
                };
                match link.inflight {
                    Some(lost) => {
                        warn!(
                            profile = %self.profile,
                            task_id = %lost,
                            "daemon lost with task in flight"
                        );
                        self.handles.resolve(&lost, TaskOutcome::TransportLost);
                    }
                    None => {
                        info!(profile = %self.profile, connections = self.conns.len(), "daemon disconnected");
                    }
                }
            }
        }
    }

    fn try_dispatch(&mut self) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let Some(gen) = self
                .conns
                .iter()
                .find(|(_, l)| l.inflight.is_none() && l.awaiting_ack.is_none())
                .map(|(gen, _)| *gen)
            else {
                return;
            };

            let task = loop {
                match self.queue.pop_front() {
                    Some(task) if self.handles.contains(&task.id) => break Some(task),
                    Some(task) => debug!(task_id = %task.id, "skipping resolved task"),
                    None => break None,
                }
            };
            let Some(task) = task else { return };

            let link = self.conns.get_mut(&gen).expect("selected connection exists");
            let message = Message::Task {
                id: task.id.clone(),
                payload: task.payload.clone(),
                extensions: task.extensions.clone(),
            };
            if link.sender.send(message).is_err() {
                self.conns.remove(&gen);
                self.queue.push_front(task);
                continue;
            }

            debug!(profile = %self.profile, task_id = %task.id, "task sent");
            link.inflight = Some(task.id);
        }
    }

    fn shutdown(&mut self) {
        info!(profile = %self.profile, "direct pool shutting down");

        let canceled = self.handles.drain_resolve(TaskOutcome::Canceled);
        if canceled > 0 {
            debug!(profile = %self.profile, count = canceled, "pending handles canceled");
        }
        self.queue.drain();

        self.accept_cancel.cancel();
        for (_, link) in self.conns.drain() {
            let _ = link.sender.send(Message::Shutdown);
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

    async fn spawn_pool() -> (PoolClient, Arc<HandleTable>) {
        let handles = Arc::new(HandleTable::new());
        let config = DirectConfig {
            url: "tcp://127.0.0.1:0".parse().unwrap(),
            tls: None,
            sticky: Bytes::new(),
        };
        let client = DirectPool::spawn(
            "test".into(),
            config,
            Arc::clone(&handles),
            CodecRegistry::new(),
        )
        .await
        .unwrap();
        (client, handles)
    }

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

    #[tokio::test]
    async fn test_direct_round_trip() {
        let (client, handles) = spawn_pool().await;
        let mut conn = connect_fake_daemon(&client.urls()[0]).await;

        let task = Task::new(Bytes::from_static(b"job"), vec![], None, "test");
        let (mut h, resolver) = handle::pair(task.id.clone(), "test");
        handles.insert(resolver);
        client.submit(task);

        match conn.recv().await.unwrap() {
            Message::Task { id, payload, .. } => {
                assert_eq!(payload, Bytes::from_static(b"job"));
                conn.send(Message::ResultOk {
                    id,
                    payload: Bytes::from_static(b"answer"),
                    extensions: vec![],
                })
                .unwrap();
            }
            other => panic!("expected task frame, got {:?}", other),
        }

        match h.wait_within(Duration::from_secs(1)).await.unwrap() {
            TaskOutcome::Ok { payload, .. } => assert_eq!(payload, Bytes::from_static(b"answer")),
            other => panic!("expected ok outcome, got {:?}", other),
        }

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_direct_status_reports_urls() {
        let (client, _handles) = spawn_pool().await;
        let _conn = connect_fake_daemon(&client.urls()[0]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = client.status().await.unwrap();
        assert_eq!(status.connections, 1);
        let urls = status.daemons.urls().unwrap().to_vec();
        assert_eq!(urls, vec![client.urls()[0].to_string()]);

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_direct_saisei_is_rejected() {
        let (client, _handles) = spawn_pool().await;
        assert!(matches!(
            client.saisei(0).await,
            Err(SaiseiError::DirectMode)
        ));
        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_direct_transport_loss_in_flight() {
        let (client, handles) = spawn_pool().await;
        let mut conn = connect_fake_daemon(&client.urls()[0]).await;

        let task = Task::new(Bytes::from_static(b"job"), vec![], None, "test");
        let (mut h, resolver) = handle::pair(task.id.clone(), "test");
        handles.insert(resolver);
        client.submit(task);

        match conn.recv().await.unwrap() {
            Message::Task { .. } => conn.close(),
            other => panic!("expected task frame, got {:?}", other),
        }

        assert_eq!(
            h.wait_within(Duration::from_secs(1)).await.unwrap(),
            TaskOutcome::TransportLost
        );
        client.shutdown(Duration::from_secs(1)).await;
    }
}
