//! TaskMesh daemon - worker process binary.
//!
//! Dials a host-side listener, performs the sticky-setup handshake, then
//! evaluates one task at a time until shut down. Exit code 0 on clean
//! shutdown; 1 on transport failure with autoexit.
//!
//! The stock build evaluates with the echo evaluator; applications with
//! their own evaluation embed [`taskmesh::Daemon`] instead.

mod error;

use clap::Parser;
use error::CliError;
use std::process;
use std::sync::Arc;
use taskmesh::daemon::{Daemon, DaemonConfig};
use taskmesh::{DaemonExit, EchoEvaluator, TlsClientMaterial, TransportUrl};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "taskmesh-daemon")]
#[command(version = taskmesh::VERSION)]
#[command(about = "TaskMesh worker daemon", long_about = None)]
struct Cli {
    /// Host URL to dial (tcp://, tls+tcp://, ws://, wss://, ipc://, abstract://)
    #[arg(long, value_name = "URL")]
    dial: String,

    /// TLS certificate: inline PEM or a path to a PEM file
    #[arg(long, value_name = "CERT_PEM")]
    tls: Option<String>,

    /// Wait for reconnection on transport loss instead of exiting
    #[arg(long)]
    no_autoexit: bool,

    /// Seed for evaluation-side randomness (cluster reproducibility)
    #[arg(long, value_name = "SEED")]
    rs: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    taskmesh::logging::init_console_logging();

    if let Err(e) = run(cli) {
        e.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let url: TransportUrl = cli
        .dial
        .parse()
        .map_err(|e| CliError::Argument(format!("--dial: {}", e)))?;

    let tls = match cli.tls {
        Some(value) => Some(resolve_tls(value)?),
        None => None,
    };

    let mut config = DaemonConfig::new(url).autoexit(!cli.no_autoexit);
    if let Some(material) = tls {
        config = config.with_tls(material);
    }
    if let Some(seed) = cli.rs {
        config = config.with_rng_seed(seed);
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::Argument(format!("failed to start runtime: {}", e)))?;
    let exit = runtime.block_on(async {
        let daemon = Daemon::new(config, Arc::new(EchoEvaluator));
        let shutdown = CancellationToken::new();

        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                signal_shutdown.cancel();
            }
        });

        daemon.run(shutdown).await
    })?;

    match exit {
        DaemonExit::Clean => Ok(()),
        DaemonExit::TransportLost => {
            eprintln!("transport lost");
            process::exit(1)
        }
    }
}

/// `--tls` accepts the PEM inline (as launch commands embed it) or a
/// path to a PEM file.
fn resolve_tls(value: String) -> Result<TlsClientMaterial, CliError> {
    if value.contains("-----BEGIN") {
        return Ok(TlsClientMaterial::new(value));
    }
    let pem = std::fs::read_to_string(&value).map_err(|error| CliError::TlsRead {
        path: value.clone(),
        error,
    })?;
    Ok(TlsClientMaterial::new(pem))
}
