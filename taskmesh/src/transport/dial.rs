//! Dialing side of the transport, with automatic redial.
//!
//! Daemons dial the host and must survive the host not being up yet, so
//! [`dial`] retries with exponential backoff until it connects, the
//! attempt budget runs out, or the caller cancels.

use crate::config::RetrySettings;
use crate::transport::conn::Connection;
use crate::transport::tls::{self, TlsClientMaterial};
use crate::transport::TransportError;
use crate::url::{Scheme, TransportUrl};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Dials `url`, retrying per `retry` until connected or cancelled.
pub async fn dial(
    url: &TransportUrl,
    tls: Option<&TlsClientMaterial>,
    retry: &RetrySettings,
    cancel: &CancellationToken,
) -> Result<Connection, TransportError> {
    if url.is_tls() && tls.is_none() {
        return Err(TransportError::TlsRequired(url.to_string()));
    }

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        match connect_once(url, tls).await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                attempt += 1;
                if let Some(max) = retry.max_attempts {
                    if attempt >= max {
                        return Err(TransportError::DialFailed {
                            url: url.to_string(),
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                }
                let delay = retry.delay_for_attempt(attempt - 1);
                debug!(
                    url = %url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "dial attempt failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn connect_once(
    url: &TransportUrl,
    tls: Option<&TlsClientMaterial>,
) -> Result<Connection, TransportError> {
    match url.scheme() {
        s if s.is_inet() => {
            let stream = TcpStream::connect(url.authority()).await?;
            let _ = stream.set_nodelay(true);
            if url.is_tls() {
                let material = tls.ok_or_else(|| TransportError::TlsRequired(url.to_string()))?;
                let connector = TlsConnector::from(material.client_config()?);
                let name = tls::server_name(url.host())?;
                let stream = connector.connect(name, stream).await?;
                Ok(Connection::spawn(stream, url.to_string()))
            } else {
                Ok(Connection::spawn(stream, url.to_string()))
            }
        }
        Scheme::Ipc => {
            #[cfg(unix)]
            {
                let stream = tokio::net::UnixStream::connect(url.path()).await?;
                Ok(Connection::spawn(stream, url.to_string()))
            }
            #[cfg(not(unix))]
            {
                Err(TransportError::UnsupportedScheme("ipc".into()))
            }
        }
        Scheme::Abstract => {
            #[cfg(target_os = "linux")]
            {
                use std::os::linux::net::SocketAddrExt;

                let addr =
                    std::os::unix::net::SocketAddr::from_abstract_name(url.path().as_bytes())?;
                let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                std_stream.set_nonblocking(true)?;
                let stream = tokio::net::UnixStream::from_std(std_stream)?;
                Ok(Connection::spawn(stream, url.to_string()))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(TransportError::UnsupportedScheme("abstract".into()))
            }
        }
        _ => unreachable!("scheme families are exhaustive"),
    }
}
