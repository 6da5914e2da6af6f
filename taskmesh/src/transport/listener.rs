//! Listening side of the transport.
//!
//! A [`Listener`] binds a transport URL, reports the bound URL back
//! (meaningful with port 0), and feeds accepted, already-framed
//! [`Connection`]s through a channel. TLS URLs perform the server-side
//! handshake before the connection surfaces.

use crate::transport::conn::Connection;
use crate::transport::tls::TlsMaterial;
use crate::transport::TransportError;
use crate::url::{Scheme, TransportUrl};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the accepted-connection channel.
const ACCEPT_CHANNEL_CAPACITY: usize = 16;

/// A bound listener producing framed connections.
pub struct Listener {
    url: TransportUrl,
    accept_rx: mpsc::Receiver<Connection>,
    cancel: CancellationToken,
}

impl Listener {
    /// Binds `url` and starts accepting.
    ///
    /// TLS-activating schemes require `tls` material; port 0 is resolved
    /// to the OS-assigned port in [`Listener::url`].
    pub async fn bind(
        url: &TransportUrl,
        tls: Option<&TlsMaterial>,
    ) -> Result<Self, TransportError> {
        if url.is_tls() && tls.is_none() {
            return Err(TransportError::TlsRequired(url.to_string()));
        }

        match url.scheme() {
            s if s.is_inet() => Self::bind_inet(url, tls).await,
            Scheme::Ipc => {
                #[cfg(unix)]
                {
                    Self::bind_unix(url).await
                }
                #[cfg(not(unix))]
                {
                    Err(TransportError::UnsupportedScheme("ipc".into()))
                }
            }
            Scheme::Abstract => {
                #[cfg(target_os = "linux")]
                {
                    Self::bind_abstract(url).await
                }
                #[cfg(not(target_os = "linux"))]
                {
                    Err(TransportError::UnsupportedScheme("abstract".into()))
                }
            }
            _ => unreachable!("scheme families are exhaustive"),
        }
    }

    async fn bind_inet(
        url: &TransportUrl,
        tls: Option<&TlsMaterial>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(url.authority()).await?;
        let bound = url.with_port(listener.local_addr()?.port());
        let acceptor = match tls {
            Some(material) if url.is_tls() => Some(TlsAcceptor::from(material.server_config()?)),
            _ => None,
        };

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let listen_url = bound.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let conn = match &acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        Connection::spawn(tls_stream, addr.to_string())
                                    }
                                    Err(err) => {
                                        warn!(
                                            url = %listen_url,
                                            peer = %addr,
                                            error = %err,
                                            "TLS handshake failed"
                                        );
                                        continue;
                                    }
                                },
                                None => Connection::spawn(stream, addr.to_string()),
                            };
                            if accept_tx.send(conn).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(url = %listen_url, error = %err, "accept failed");
                        }
                    }
                }
            }
        });

        Ok(Self {
            url: bound,
            accept_rx,
            cancel,
        })
    }

    #[cfg(unix)]
    async fn bind_unix(url: &TransportUrl) -> Result<Self, TransportError> {
        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(url.path());
        let listener = tokio::net::UnixListener::bind(url.path())?;
        Ok(Self::spawn_unix_accept(url.clone(), listener))
    }

    #[cfg(target_os = "linux")]
    async fn bind_abstract(url: &TransportUrl) -> Result<Self, TransportError> {
        use std::os::linux::net::SocketAddrExt;

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(url.path().as_bytes())?;
        let std_listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;
        Ok(Self::spawn_unix_accept(url.clone(), listener))
    }

    #[cfg(unix)]
    fn spawn_unix_accept(url: TransportUrl, listener: tokio::net::UnixListener) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let listen_url = url.to_string();

        tokio::spawn(async move {
            let mut peer_seq = 0u64;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            peer_seq += 1;
                            let peer = format!("{}#{}", listen_url, peer_seq);
                            let conn = Connection::spawn(stream, peer);
                            if accept_tx.send(conn).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(url = %listen_url, error = %err, "accept failed");
                        }
                    }
                }
            }
        });

        Self {
            url,
            accept_rx,
            cancel,
        }
    }

    /// The bound URL, with port 0 replaced by the OS-assigned port.
    pub fn url(&self) -> &TransportUrl {
        &self.url
    }

    /// Next accepted connection; `None` after [`Listener::close`].
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accept_rx.recv().await
    }

    /// Stops accepting and releases the bound endpoint.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("url", &self.url).finish()
    }
}
