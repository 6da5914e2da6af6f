//! Message-oriented transport between the host side and daemons.
//!
//! The dispatch core uses three socket arrangements over the same framed
//! byte protocol:
//!
//! - **Pair**: one persistent bidirectional pipe per daemon slot
//!   (dispatcher mode): a [`Listener`] bound to the slot URL accepting a
//!   single live [`Connection`].
//! - **Req/Rep**: the per-connection request/reply discipline of direct
//!   mode: one task out, one result back per daemon connection.
//! - **Push/Pull**: direct mode's distribution across connections:
//!   submissions go to whichever connected daemon is free first.
//!
//! The delivery contract is *deliver-or-lose-with-signal*: a lost
//! connection is always observable (channel closure on the receiving
//! side, send errors on the sending side), never silent. Daemons redial
//! automatically; listeners accept replacement connections.

pub mod conn;
pub mod dial;
pub mod listener;
pub mod tls;

pub use conn::{Connection, ConnectionReceiver, ConnectionSender};
pub use dial::dial;
pub use listener::Listener;
pub use tls::{TlsClientMaterial, TlsError, TlsMaterial};

use crate::protocol::ProtocolError;
use crate::url::UrlError;

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Url(#[from] UrlError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("connection lost")]
    ConnectionLost,

    #[error("dial canceled")]
    Canceled,

    #[error("dial to {url} failed after {attempts} attempts: {last}")]
    DialFailed {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("scheme {0:?} is not supported on this platform")]
    UnsupportedScheme(String),

    #[error("URL {0} activates TLS but no TLS material was provided")]
    TlsRequired(String),
}
