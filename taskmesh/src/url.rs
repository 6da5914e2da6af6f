//! Transport URL parsing and generation.
//!
//! The dispatch core addresses every listener and dialer with a URL:
//!
//! - `tcp://host:port` - plain TCP
//! - `ws://host:port/path` - TCP carrying the same framed byte protocol
//! - `tls+tcp://host:port` - TCP with TLS
//! - `wss://host:port/path` - as `ws` with TLS
//! - `abstract://id` - Linux abstract-namespace socket
//! - `ipc://path` - Unix domain socket bound to a filesystem path
//!
//! IPv6 hosts are bracketed (`tcp://[::1]:5555`). Port `0` requests an
//! ephemeral port from the OS; the bound port is reported back by the
//! listener via [`TransportUrl::with_port`].

use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Errors produced while parsing a transport URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("missing '://' separator in {0:?}")]
    MissingSeparator(String),

    #[error("unknown scheme {0:?}")]
    UnknownScheme(String),

    #[error("missing host in {0:?}")]
    MissingHost(String),

    #[error("missing or invalid port in {0:?}")]
    InvalidPort(String),

    #[error("unterminated IPv6 bracket in {0:?}")]
    UnterminatedBracket(String),

    #[error("missing identifier in {0:?}")]
    MissingIdentifier(String),
}

/// URL scheme recognised by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Ws,
    TlsTcp,
    Wss,
    Abstract,
    Ipc,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            Scheme::TlsTcp => "tls+tcp",
            Scheme::Wss => "wss",
            Scheme::Abstract => "abstract",
            Scheme::Ipc => "ipc",
        }
    }

    /// Whether this scheme activates TLS (`tls+` prefix or `wss`).
    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::TlsTcp | Scheme::Wss)
    }

    /// Whether this scheme addresses an internet socket (host + port).
    pub fn is_inet(&self) -> bool {
        matches!(self, Scheme::Tcp | Scheme::Ws | Scheme::TlsTcp | Scheme::Wss)
    }

    /// The TLS-activating counterpart of this scheme.
    pub fn to_tls(self) -> Scheme {
        match self {
            Scheme::Tcp => Scheme::TlsTcp,
            Scheme::Ws => Scheme::Wss,
            other => other,
        }
    }

    fn parse(s: &str) -> Result<Self, UrlError> {
        match s {
            "tcp" => Ok(Scheme::Tcp),
            "ws" => Ok(Scheme::Ws),
            "tls+tcp" => Ok(Scheme::TlsTcp),
            "wss" => Ok(Scheme::Wss),
            "abstract" => Ok(Scheme::Abstract),
            "ipc" => Ok(Scheme::Ipc),
            other => Err(UrlError::UnknownScheme(other.to_string())),
        }
    }
}

/// A parsed transport URL.
///
/// For inet schemes `host`/`port` are meaningful and `path` holds any
/// trailing `/path` component. For `abstract` and `ipc`, `path` holds the
/// identifier or filesystem path and `host`/`port` are unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl TransportUrl {
    /// Builds an inet URL.
    pub fn inet(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            path: String::new(),
        }
    }

    /// Builds a local (abstract/ipc) URL.
    pub fn local(scheme: Scheme, path: impl Into<String>) -> Self {
        Self {
            scheme,
            host: String::new(),
            port: 0,
            path: path.into(),
        }
    }

    /// Default loopback URL with an ephemeral port.
    pub fn loopback() -> Self {
        Self::inet(Scheme::Tcp, "127.0.0.1", 0)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether connections on this URL use TLS.
    pub fn is_tls(&self) -> bool {
        self.scheme.is_tls()
    }

    /// The `host:port` string suitable for `TcpListener::bind`, with IPv6
    /// hosts re-bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same URL with the scheme upgraded to its TLS counterpart.
    pub fn upgraded_to_tls(&self) -> Self {
        let mut url = self.clone();
        url.scheme = url.scheme.to_tls();
        url
    }

    /// Same URL with a concrete port (used to report the bound ephemeral
    /// port back to callers).
    pub fn with_port(&self, port: u16) -> Self {
        let mut url = self.clone();
        url.port = port;
        url
    }

    /// Derives the listen URL for daemon slot `i`.
    ///
    /// With an explicit base port, slot `i` listens on `port + i`; port 0
    /// leaves every slot to request its own ephemeral port. Local schemes
    /// get an `-{i}` suffix on the identifier.
    pub fn for_slot(&self, i: usize) -> Self {
        let mut url = self.clone();
        if self.scheme.is_inet() {
            if self.port != 0 {
                url.port = self.port.saturating_add(i as u16);
            }
        } else {
            url.path = format!("{}-{}", self.path, i);
        }
        url
    }

    /// Produces a fresh URL for the same endpoint family, invalidating the
    /// previous one (the `saisei` operation).
    ///
    /// Inet URLs fall back to port 0 so the rebind picks a new ephemeral
    /// port; local URLs get a random suffix.
    pub fn regenerate(&self) -> Self {
        let mut url = self.clone();
        if self.scheme.is_inet() {
            url.port = 0;
        } else {
            let suffix: u32 = rand::thread_rng().gen();
            let base = self.path.rsplit_once('.').map_or(self.path.as_str(), |(b, _)| b);
            url.path = format!("{}.{:08x}", base, suffix);
        }
        url
    }
}

impl fmt::Display for TransportUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.is_inet() {
            write!(f, "{}://{}", self.scheme.as_str(), self.authority())?;
            if !self.path.is_empty() {
                write!(f, "{}", self.path)?;
            }
            Ok(())
        } else {
            write!(f, "{}://{}", self.scheme.as_str(), self.path)
        }
    }
}

impl FromStr for TransportUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, UrlError> {
        let (scheme_str, rest) = s
            .split_once("://")
            .ok_or_else(|| UrlError::MissingSeparator(s.to_string()))?;
        let scheme = Scheme::parse(scheme_str)?;

        if !scheme.is_inet() {
            if rest.is_empty() {
                return Err(UrlError::MissingIdentifier(s.to_string()));
            }
            return Ok(TransportUrl::local(scheme, rest));
        }

        // Split any trailing /path off the authority first.
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
            // Bracketed IPv6 literal.
            let end = stripped
                .find(']')
                .ok_or_else(|| UrlError::UnterminatedBracket(s.to_string()))?;
            let host = &stripped[..end];
            let after = &stripped[end + 1..];
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| UrlError::InvalidPort(s.to_string()))?;
            (host, port)
        } else {
            authority
                .rsplit_once(':')
                .ok_or_else(|| UrlError::InvalidPort(s.to_string()))?
        };

        if host.is_empty() {
            return Err(UrlError::MissingHost(s.to_string()));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| UrlError::InvalidPort(s.to_string()))?;

        Ok(TransportUrl {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let url: TransportUrl = "tcp://10.0.0.5:5555".parse().unwrap();
        assert_eq!(url.scheme(), Scheme::Tcp);
        assert_eq!(url.host(), "10.0.0.5");
        assert_eq!(url.port(), 5555);
        assert!(!url.is_tls());
        assert_eq!(url.to_string(), "tcp://10.0.0.5:5555");
    }

    #[test]
    fn test_parse_ws_with_path() {
        let url: TransportUrl = "ws://example.net:80/dispatch".parse().unwrap();
        assert_eq!(url.scheme(), Scheme::Ws);
        assert_eq!(url.path(), "/dispatch");
        assert_eq!(url.to_string(), "ws://example.net:80/dispatch");
    }

    #[test]
    fn test_tls_schemes_activate_tls() {
        let tls: TransportUrl = "tls+tcp://127.0.0.1:0".parse().unwrap();
        assert!(tls.is_tls());
        let wss: TransportUrl = "wss://127.0.0.1:9001/x".parse().unwrap();
        assert!(wss.is_tls());
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let url: TransportUrl = "tcp://[::1]:7000".parse().unwrap();
        assert_eq!(url.host(), "::1");
        assert_eq!(url.port(), 7000);
        assert_eq!(url.authority(), "[::1]:7000");
        assert_eq!(url.to_string(), "tcp://[::1]:7000");
    }

    #[test]
    fn test_parse_abstract_and_ipc() {
        let a: TransportUrl = "abstract://mesh-1".parse().unwrap();
        assert_eq!(a.scheme(), Scheme::Abstract);
        assert_eq!(a.path(), "mesh-1");

        let i: TransportUrl = "ipc:///tmp/mesh.sock".parse().unwrap();
        assert_eq!(i.scheme(), Scheme::Ipc);
        assert_eq!(i.path(), "/tmp/mesh.sock");
        assert_eq!(i.to_string(), "ipc:///tmp/mesh.sock");
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let err = "ftp://x:1".parse::<TransportUrl>().unwrap_err();
        assert!(matches!(err, UrlError::UnknownScheme(_)));
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        let err = "tcp://justahost".parse::<TransportUrl>().unwrap_err();
        assert!(matches!(err, UrlError::InvalidPort(_)));
    }

    #[test]
    fn test_slot_urls_offset_explicit_port() {
        let base: TransportUrl = "tcp://127.0.0.1:6000".parse().unwrap();
        assert_eq!(base.for_slot(0).port(), 6000);
        assert_eq!(base.for_slot(3).port(), 6003);
    }

    #[test]
    fn test_slot_urls_keep_ephemeral_port() {
        let base: TransportUrl = "tcp://127.0.0.1:0".parse().unwrap();
        assert_eq!(base.for_slot(5).port(), 0);
    }

    #[test]
    fn test_slot_urls_suffix_local_schemes() {
        let base: TransportUrl = "abstract://mesh".parse().unwrap();
        assert_eq!(base.for_slot(2).path(), "mesh-2");
    }

    #[test]
    fn test_regenerate_inet_resets_port() {
        let url: TransportUrl = "tcp://127.0.0.1:6100".parse().unwrap();
        assert_eq!(url.regenerate().port(), 0);
    }

    #[test]
    fn test_regenerate_local_changes_identifier() {
        let url: TransportUrl = "abstract://mesh-0".parse().unwrap();
        let fresh = url.regenerate();
        assert_ne!(fresh.path(), url.path());
        assert!(fresh.path().starts_with("mesh-0."));
    }

    #[test]
    fn test_upgrade_to_tls() {
        let url: TransportUrl = "tcp://127.0.0.1:1234".parse().unwrap();
        assert_eq!(url.upgraded_to_tls().scheme(), Scheme::TlsTcp);
        let ws: TransportUrl = "ws://127.0.0.1:1234/a".parse().unwrap();
        assert_eq!(ws.upgraded_to_tls().scheme(), Scheme::Wss);
    }
}
