//! The daemon: a long-lived worker evaluating one task at a time.
//!
//! Lifecycle:
//!
//! 1. Dial the configured URL (with backoff; the host may not be up yet).
//! 2. Handshake: the first frame is the sticky-setup payload (possibly
//!    empty). Apply it and ack; state it establishes persists across
//!    tasks.
//! 3. Loop: evaluate task frames strictly one at a time. Cancel frames
//!    matching the in-flight id trip the evaluation's interrupt token.
//!    Setup frames re-apply sticky setup (deferred until idle when they
//!    arrive mid-evaluation) and are acked. A shutdown frame ends the
//!    session cleanly.
//! 4. On transport loss: exit when `autoexit` is set, otherwise redial
//!    and wait indefinitely for the host to return.
//!
//! Evaluation itself is pluggable through [`Evaluator`]; the core treats
//! payloads as opaque bytes plus decoded reference objects.

use crate::codec::{CodecRegistry, ExternalRef};
use crate::config::RetrySettings;
use crate::protocol::Message;
use crate::task::TaskId;
use crate::transport::{dial, Connection, TlsClientMaterial, TransportError};
use crate::url::TransportUrl;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one evaluation on the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Result payload plus reference objects to ship back.
    Ok { payload: Bytes, refs: Vec<ExternalRef> },

    /// Evaluation failed; stack frames captured up to the failure point.
    Error { message: String, stack: Vec<String> },

    /// Evaluation observed its interrupt token and stopped.
    Interrupted,
}

/// User-supplied evaluation of opaque task payloads.
///
/// Implementations must not assume more than one task at a time; the
/// daemon never interleaves evaluations.
pub trait Evaluator: Send + Sync + 'static {
    /// Applies a sticky-setup payload. Whatever state this establishes
    /// persists across tasks on this daemon.
    fn apply_setup(&self, payload: &[u8]) -> Result<(), String>;

    /// Seeds evaluation-side randomness (the `--rs` flag).
    fn seed(&self, _seed: u64) {}

    /// Evaluates one task. `interrupt` is cancelled when the host asks
    /// for this task to stop; cooperative implementations return
    /// [`Evaluation::Interrupted`] when they observe it.
    fn evaluate<'a>(
        &'a self,
        payload: Bytes,
        refs: Vec<ExternalRef>,
        interrupt: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Evaluation> + Send + 'a>>;
}

/// Evaluator that returns every task unchanged.
///
/// The stock behaviour of the daemon binary when the embedding
/// application supplies nothing else; also convenient in tests.
pub struct EchoEvaluator;

impl Evaluator for EchoEvaluator {
    fn apply_setup(&self, _payload: &[u8]) -> Result<(), String> {
        Ok(())
    }

    fn evaluate<'a>(
        &'a self,
        payload: Bytes,
        refs: Vec<ExternalRef>,
        _interrupt: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Evaluation> + Send + 'a>> {
        Box::pin(async move { Evaluation::Ok { payload, refs } })
    }
}

/// How a daemon run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// Shutdown frame received or run cancelled locally.
    Clean,

    /// Transport lost with `autoexit` set.
    TransportLost,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// URL of the host-side listener to dial.
    pub url: TransportUrl,

    /// TLS certificate material when the URL activates TLS.
    pub tls: Option<TlsClientMaterial>,

    /// Exit on transport loss instead of waiting for reconnection.
    pub autoexit: bool,

    /// Seed handed to the evaluator for reproducible randomness.
    pub rng_seed: Option<u64>,

    /// Redial behaviour.
    pub retry: RetrySettings,
}

impl DaemonConfig {
    pub fn new(url: TransportUrl) -> Self {
        Self {
            url,
            tls: None,
            autoexit: true,
            rng_seed: None,
            retry: RetrySettings::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsClientMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn autoexit(mut self, autoexit: bool) -> Self {
        self.autoexit = autoexit;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }
}

enum SessionEnd {
    Shutdown,
    Cancelled,
    Lost,
}

struct InflightEval {
    id: TaskId,
    interrupt: CancellationToken,
    fut: Pin<Box<dyn Future<Output = Evaluation> + Send>>,
}

/// The daemon process body.
pub struct Daemon {
    config: DaemonConfig,
    evaluator: Arc<dyn Evaluator>,
    codecs: CodecRegistry,
}

impl Daemon {
    pub fn new(config: DaemonConfig, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            config,
            evaluator,
            codecs: CodecRegistry::new(),
        }
    }

    /// Installs the codec registry used to decode incoming extension
    /// entries and encode outgoing ones. Matching codecs must already be
    /// loaded here (typically via the sticky-setup payload).
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Runs until shutdown, cancellation, or (with `autoexit`) transport
    /// loss.
    pub async fn run(self, shutdown: CancellationToken) -> Result<DaemonExit, TransportError> {
        if let Some(seed) = self.config.rng_seed {
            self.evaluator.seed(seed);
        }

        loop {
            let conn = match dial(
                &self.config.url,
                self.config.tls.as_ref(),
                &self.config.retry,
                &shutdown,
            )
            .await
            {
                Ok(conn) => conn,
                Err(TransportError::Canceled) => return Ok(DaemonExit::Clean),
                Err(err) => return Err(err),
            };
            info!(url = %self.config.url, "daemon connected");

            match self.session(conn, &shutdown).await {
                SessionEnd::Shutdown => {
                    info!(url = %self.config.url, "daemon shutting down");
                    return Ok(DaemonExit::Clean);
                }
                SessionEnd::Cancelled => return Ok(DaemonExit::Clean),
                SessionEnd::Lost => {
                    if self.config.autoexit {
                        warn!(url = %self.config.url, "transport lost, exiting");
                        return Ok(DaemonExit::TransportLost);
                    }
                    info!(url = %self.config.url, "transport lost, redialing");
                }
            }
        }
    }

    async fn session(&self, mut conn: Connection, shutdown: &CancellationToken) -> SessionEnd {
        // Handshake: the host opens with the current sticky-setup payload.
        match conn.recv().await {
            Ok(Message::Setup { id, payload }) => {
                if !self.apply_setup(&conn, id, &payload) {
                    return SessionEnd::Lost;
                }
            }
            Ok(Message::Shutdown) => return SessionEnd::Shutdown,
            Ok(other) => {
                warn!(message = ?other.task_id(), "unexpected handshake frame");
                return SessionEnd::Lost;
            }
            Err(_) => return SessionEnd::Lost,
        }

        let mut inflight: Option<InflightEval> = None;
        let mut deferred_setup: Option<(TaskId, Bytes)> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return SessionEnd::Cancelled,

                evaluation = poll_eval(&mut inflight), if inflight.is_some() => {
                    let done = inflight.take().expect("guarded by inflight.is_some()");
                    debug!(task_id = %done.id, "evaluation finished");
                    if !self.send_result(&conn, done.id, evaluation) {
                        return SessionEnd::Lost;
                    }
                    if let Some((id, payload)) = deferred_setup.take() {
                        if !self.apply_setup(&conn, id, &payload) {
                            return SessionEnd::Lost;
                        }
                    }
                }

                received = conn.recv() => {
                    let message = match received {
                        Ok(message) => message,
                        Err(_) => return SessionEnd::Lost,
                    };
                    match message {
                        Message::Task { id, payload, extensions } => {
                            if inflight.is_some() {
                                warn!(task_id = %id, "task received while busy, dropping");
                                continue;
                            }
                            match self.codecs.decode(&extensions) {
                                Ok(refs) => {
                                    debug!(task_id = %id, bytes = payload.len(), "evaluating task");
                                    let interrupt = CancellationToken::new();
                                    let evaluator = Arc::clone(&self.evaluator);
                                    let token = interrupt.clone();
                                    let fut = Box::pin(async move {
                                        evaluator.evaluate(payload, refs, token).await
                                    });
                                    inflight = Some(InflightEval { id, interrupt, fut });
                                }
                                Err(err) => {
                                    let reply = Message::ResultErr {
                                        id,
                                        message: err.to_string(),
                                        stack: Vec::new(),
                                    };
                                    if conn.send(reply).is_err() {
                                        return SessionEnd::Lost;
                                    }
                                }
                            }
                        }
                        Message::Setup { id, payload } => {
                            if inflight.is_some() {
                                deferred_setup = Some((id, payload));
                            } else if !self.apply_setup(&conn, id, &payload) {
                                return SessionEnd::Lost;
                            }
                        }
                        Message::Cancel { id } => match &inflight {
                            Some(eval) if eval.id == id => {
                                debug!(task_id = %id, "interrupting evaluation");
                                eval.interrupt.cancel();
                            }
                            _ => debug!(task_id = %id, "cancel for task not in flight"),
                        },
                        Message::Shutdown => return SessionEnd::Shutdown,
                        other => {
                            warn!(message = ?other.task_id(), "unexpected frame on daemon pipe");
                        }
                    }
                }
            }
        }
    }

    fn apply_setup(&self, conn: &Connection, id: TaskId, payload: &Bytes) -> bool {
        if !payload.is_empty() {
            if let Err(message) = self.evaluator.apply_setup(payload) {
                warn!(setup_id = %id, error = %message, "sticky setup failed");
            }
        }
        let ack = Message::ResultOk {
            id,
            payload: Bytes::new(),
            extensions: Vec::new(),
        };
        conn.send(ack).is_ok()
    }

    fn send_result(&self, conn: &Connection, id: TaskId, evaluation: Evaluation) -> bool {
        let reply = match evaluation {
            Evaluation::Ok { payload, refs } => match self.codecs.encode(&refs) {
                Ok(extensions) => Message::ResultOk {
                    id,
                    payload,
                    extensions,
                },
                Err(err) => Message::ResultErr {
                    id,
                    message: err.to_string(),
                    stack: Vec::new(),
                },
            },
            Evaluation::Error { message, stack } => Message::ResultErr { id, message, stack },
            Evaluation::Interrupted => Message::ResultInterrupt { id },
        };
        conn.send(reply).is_ok()
    }
}

async fn poll_eval(inflight: &mut Option<InflightEval>) -> Evaluation {
    match inflight {
        Some(eval) => eval.fut.as_mut().await,
        None => std::future::pending().await,
    }
}
