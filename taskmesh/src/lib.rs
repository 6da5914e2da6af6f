//! TaskMesh - asynchronous task dispatch for distributed evaluation.
//!
//! A client submits opaque computation requests ("tasks"); persistent
//! worker processes ("daemons"), local or spread across a network,
//! evaluate them and return results. Submission returns a handle that
//! resolves asynchronously; failures (evaluation errors, cancellation,
//! interrupt, timeout, transport loss) are first-class result values,
//! never exceptions across the public boundary.
//!
//! # High-Level API
//!
//! The [`host::Host`] facade covers most use cases:
//!
//! ```ignore
//! use taskmesh::{DaemonSpec, Host, TaskSpec};
//!
//! let host = Host::new();
//! host.configure_daemons(DaemonSpec::new(4)).await?;
//! // launch daemons with host.launch_commands("default", "taskmesh-daemon")
//!
//! let mut handle = host.submit(TaskSpec::new("payload"));
//! let outcome = handle.wait().await;
//! ```
//!
//! Tasks flow either through the dispatcher (FIFO ordering, least-loaded
//! assignment, one pipe per daemon) or directly (a shared queue daemons
//! pull from, no ordering guarantees). Worker processes are built from
//! [`daemon::Daemon`] plus a user [`daemon::Evaluator`].

pub mod codec;
pub mod config;
pub mod daemon;
pub mod direct;
pub mod dispatcher;
pub mod handle;
pub mod host;
pub mod launch;
pub mod logging;
pub mod profile;
pub mod protocol;
pub mod status;
pub mod task;
pub mod transport;
pub mod url;

pub use codec::{CodecRegistry, DeserializeFn, ExtEntry, ExternalRef, SerializeFn};
pub use daemon::{Daemon, DaemonConfig, DaemonExit, EchoEvaluator, Evaluation, Evaluator};
pub use handle::{DeadlineExceeded, HandleState, TaskHandle};
pub use host::{DaemonSpec, Host, HostError, TaskSpec};
pub use launch::{daemon_command, LaunchError, LaunchPlan};
pub use profile::{DispatchMode, DEFAULT_PROFILE};
pub use status::{DaemonView, StatusSnapshot};
pub use task::{Task, TaskId, TaskOutcome};
pub use transport::{TlsClientMaterial, TlsMaterial, TransportError};
pub use url::{Scheme, TransportUrl};

/// Version of the TaskMesh library and daemon binary.
///
/// Synchronized across the workspace; injected at compile time from
/// `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
