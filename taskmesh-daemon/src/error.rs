//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;
use taskmesh::TransportError;

/// Daemon CLI errors.
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line argument value
    Argument(String),
    /// Failed to read the TLS certificate file
    TlsRead { path: String, error: std::io::Error },
    /// Transport failure while running
    Transport(TransportError),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Transport(_) = self {
            eprintln!();
            eprintln!("Common issues:");
            eprintln!("  1. The host is not listening yet: it binds on configure_daemons");
            eprintln!("  2. TLS URL without --tls: pass the certificate from the launch command");
            eprintln!("  3. Firewall: the daemon opens an outbound connection to the host");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Argument(msg) => write!(f, "invalid argument: {}", msg),
            CliError::TlsRead { path, error } => {
                write!(f, "failed to read TLS certificate '{}': {}", path, error)
            }
            CliError::Transport(e) => write!(f, "transport failure: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::TlsRead { error, .. } => Some(error),
            CliError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for CliError {
    fn from(e: TransportError) -> Self {
        CliError::Transport(e)
    }
}
