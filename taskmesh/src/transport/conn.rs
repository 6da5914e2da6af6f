//! Framed connection with read/write pump tasks.
//!
//! A [`Connection`] wraps any async byte stream with two background
//! pumps: the read pump decodes frames into an inbound channel, the
//! write pump drains an outbound channel onto the wire. Either pump
//! stopping (peer loss, decode failure, explicit close) cancels the
//! other, so loss is always observable: `recv` returns
//! `ConnectionLost` and `send` starts failing.

use crate::protocol::{self, Message};
use crate::transport::TransportError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A live framed connection to a peer.
pub struct Connection {
    peer: String,
    inbound: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl Connection {
    /// Spawns the pump tasks over `stream` and returns the connection.
    pub fn spawn<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();

        let read_cancel = cancel.clone();
        let read_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    frame = protocol::read_frame(&mut read_half) => match frame {
                        Ok(frame) => match Message::from_frame(frame) {
                            Ok(message) => {
                                if in_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(peer = %read_peer, error = %err, "dropping undecodable frame");
                            }
                        },
                        Err(err) => {
                            debug!(peer = %read_peer, error = %err, "read side closed");
                            break;
                        }
                    }
                }
            }
            read_cancel.cancel();
        });

        let write_cancel = cancel.clone();
        let write_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    message = out_rx.recv() => match message {
                        Some(message) => {
                            if let Err(err) =
                                protocol::write_frame(&mut write_half, &message.into_frame()).await
                            {
                                debug!(peer = %write_peer, error = %err, "write side closed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            write_cancel.cancel();
        });

        Self {
            peer,
            inbound: in_rx,
            outbound: out_tx,
            cancel,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Receives the next message; `ConnectionLost` once the peer is gone
    /// and the inbound buffer is drained.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        self.inbound
            .recv()
            .await
            .ok_or(TransportError::ConnectionLost)
    }

    /// Queues a message for the write pump.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::ConnectionLost)
    }

    /// Non-blocking readiness probe: true when `recv` would not wait.
    pub fn poll(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Whether the write side still accepts messages.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Tears both pumps down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Splits into independently owned send and receive halves.
    pub fn split(self) -> (ConnectionSender, ConnectionReceiver) {
        (
            ConnectionSender {
                peer: self.peer.clone(),
                outbound: self.outbound,
                cancel: self.cancel,
            },
            ConnectionReceiver {
                inbound: self.inbound,
            },
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Send half of a split connection. Cloneable.
#[derive(Clone)]
pub struct ConnectionSender {
    peer: String,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl ConnectionSender {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::ConnectionLost)
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Receive half of a split connection.
pub struct ConnectionReceiver {
    inbound: mpsc::UnboundedReceiver<Message>,
}

impl ConnectionReceiver {
    /// `None` once the connection is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    pub fn poll(&self) -> bool {
        !self.inbound.is_empty()
    }
}
