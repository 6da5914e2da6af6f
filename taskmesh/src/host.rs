//! The host client: the caller-facing surface of the dispatch core.
//!
//! A [`Host`] owns the process-wide profile registry and exposes the
//! public operations: `submit`, `poll`, `wait`, `cancel`,
//! `configure_daemons`, `status`, `everywhere`, `register_codec`,
//! `saisei`, `scoped_daemons` and launch-command rendering.
//!
//! `submit` never suspends and never errors: remote-origin failures
//! arrive as [`TaskOutcome`] variants on the handle. Local misuse
//! (invalid URL, port taken) surfaces as [`HostError`] from the
//! configuration calls.
//!
//! # Example
//!
//! ```ignore
//! use taskmesh::{Host, DaemonSpec, TaskSpec};
//!
//! let host = Host::new();
//! host.configure_daemons(DaemonSpec::new(4)).await?;
//! // start daemons with the commands from host.launch_commands(...)
//!
//! let mut handle = host.submit(TaskSpec::new("payload"));
//! let outcome = handle.wait().await;
//! ```

use crate::codec::{CodecRegistry, DeserializeFn, ExternalRef, SerializeFn};
use crate::config::PoolSettings;
use crate::daemon::{Daemon, DaemonConfig, EchoEvaluator, Evaluator};
use crate::direct::{DirectConfig, DirectPool};
use crate::dispatcher::{Dispatcher, DispatcherConfig, SaiseiError};
use crate::handle::{self, DeadlineExceeded, TaskHandle};
use crate::launch;
use crate::profile::{
    DispatchMode, LocalDaemon, ProfileRegistry, ProfileRuntime, ProfileState, DEFAULT_PROFILE,
};
use crate::status::StatusSnapshot;
use crate::task::{Task, TaskId, TaskOutcome};
use crate::transport::{TlsError, TlsMaterial, TransportError};
use crate::url::{TransportUrl, UrlError};
use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from host-side configuration calls.
///
/// Only local misuse lands here; remote-origin failures are delivered as
/// outcome variants on task handles.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("unknown profile {0:?}")]
    UnknownProfile(String),

    #[error("profile {0:?} has no configured daemons")]
    NotConfigured(String),

    #[error(transparent)]
    Saisei(#[from] SaiseiError),
}

/// Parameters for `configure_daemons`.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    count: usize,
    url: Option<String>,
    tls: Option<TlsMaterial>,
    dispatcher: bool,
    profile: String,
}

impl DaemonSpec {
    /// `count` daemons on a loopback URL, dispatcher-mediated, on the
    /// default profile.
    pub fn new(count: usize) -> Self {
        Self {
            count,
            url: None,
            tls: None,
            dispatcher: true,
            profile: DEFAULT_PROFILE.to_string(),
        }
    }

    /// Base listen URL. In dispatcher mode slot `i` listens on the
    /// slot-derived variant; port 0 requests ephemeral ports.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Explicit TLS credentials. A plain `tcp`/`ws` URL is upgraded to
    /// its TLS scheme; a TLS URL with no credentials gets ephemeral
    /// self-signed ones generated at configure time.
    pub fn tls(mut self, material: TlsMaterial) -> Self {
        self.tls = Some(material);
        self
    }

    /// Route through the dispatcher (`true`, default) or directly.
    pub fn dispatcher(mut self, enabled: bool) -> Self {
        self.dispatcher = enabled;
        self
    }

    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.profile = name.into();
        self
    }

    pub fn profile_name(&self) -> &str {
        &self.profile
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Parameters for `submit`.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    payload: Bytes,
    refs: Vec<ExternalRef>,
    timeout: Option<Duration>,
    profile: String,
}

impl TaskSpec {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            refs: Vec::new(),
            timeout: None,
            profile: DEFAULT_PROFILE.to_string(),
        }
    }

    /// Attaches an opaque reference object to travel out-of-band.
    pub fn with_ref(mut self, reference: ExternalRef) -> Self {
        self.refs.push(reference);
        self
    }

    pub fn with_refs(mut self, refs: impl IntoIterator<Item = ExternalRef>) -> Self {
        self.refs.extend(refs);
        self
    }

    /// Host-side timeout; the handle resolves `Timeout` at expiry. The
    /// daemon keeps evaluating unless the caller also cancels.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.profile = name.into();
        self
    }
}

struct HostInner {
    registry: ProfileRegistry,
    local_evaluator: Mutex<Arc<dyn Evaluator>>,
    settings: PoolSettings,
}

/// The host client. Cheap to clone; clones share all profile state.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HostInner {
                registry: ProfileRegistry::new(),
                local_evaluator: Mutex::new(Arc::new(EchoEvaluator)),
                settings: PoolSettings::default(),
            }),
        }
    }

    /// Evaluator used by auto-launched local daemons (default: echo).
    pub fn set_local_evaluator(&self, evaluator: Arc<dyn Evaluator>) {
        *self
            .inner
            .local_evaluator
            .lock()
            .expect("evaluator lock poisoned") = evaluator;
    }

    /// The profile's codec registry (shared, not a snapshot). Useful for
    /// wiring in-process daemons to the same codecs.
    pub fn codec_registry(&self, profile: &str) -> CodecRegistry {
        self.inner.registry.state(profile).codecs.clone()
    }

    // ------------------------------------------------------------------
    // Pool configuration
    // ------------------------------------------------------------------

    /// (Re)configures the profile's daemon pool.
    ///
    /// `count == 0` tears the pool down: every pending handle resolves
    /// `Canceled` and daemon pipes close (triggering autoexit on the
    /// daemons). A nonzero count replaces any existing pool.
    pub async fn configure_daemons(&self, spec: DaemonSpec) -> Result<usize, HostError> {
        let state = self.inner.registry.state(spec.profile_name());
        let mut runtime = state.runtime.lock().await;

        if let Some(existing) = runtime.take() {
            Self::teardown_runtime(existing, self.inner.settings.shutdown_grace).await;
        }
        if spec.count == 0 {
            info!(profile = %state.name, "daemon pool torn down");
            return Ok(0);
        }

        let mut url: TransportUrl = match &spec.url {
            Some(raw) => raw.parse()?,
            None => TransportUrl::loopback(),
        };
        if spec.tls.is_some() && !url.is_tls() {
            url = url.upgraded_to_tls();
        }
        let tls = match (url.is_tls(), spec.tls.clone()) {
            (true, Some(material)) => Some(material),
            (true, None) => {
                let mut hosts = vec![url.host().to_string()];
                if url.host() != "localhost" {
                    hosts.push("localhost".to_string());
                }
                Some(TlsMaterial::generate_ephemeral(&hosts)?)
            }
            (false, _) => None,
        };

        let sticky = state.sticky_payload();
        let (mode, client) = if spec.dispatcher {
            let config = DispatcherConfig {
                base_url: url,
                count: spec.count,
                tls: tls.clone(),
                sticky,
            };
            let client = Dispatcher::spawn(
                state.name.clone(),
                config,
                Arc::clone(&state.handles),
                state.codecs.clone(),
            )
            .await?;
            (DispatchMode::DispatcherMediated, client)
        } else {
            let config = DirectConfig {
                url,
                tls: tls.clone(),
                sticky,
            };
            let client = DirectPool::spawn(
                state.name.clone(),
                config,
                Arc::clone(&state.handles),
                state.codecs.clone(),
            )
            .await?;
            (DispatchMode::Direct, client)
        };

        // Tasks submitted before configuration flush in FIFO order.
        {
            let mut pending = state.pending.lock().expect("pending lock poisoned");
            while let Some(task) = pending.pop_front() {
                client.submit(task);
            }
        }

        info!(
            profile = %state.name,
            daemons = spec.count,
            mode = ?mode,
            "daemon pool configured"
        );
        *runtime = Some(ProfileRuntime {
            mode,
            client,
            tls,
            daemon_count: spec.count,
            local_daemons: Vec::new(),
        });
        Ok(spec.count)
    }

    async fn teardown_runtime(runtime: ProfileRuntime, grace: Duration) {
        runtime.client.shutdown(grace).await;
        for local in runtime.local_daemons {
            local.cancel.cancel();
            let _ = tokio::time::timeout(grace, local.join).await;
        }
    }

    /// Configures a short-lived pool, runs `body`, and tears the pool
    /// down on every exit path of the body; the body's output (errors
    /// included) is returned after teardown.
    pub async fn scoped_daemons<F, Fut>(
        &self,
        spec: DaemonSpec,
        body: F,
    ) -> Result<Fut::Output, HostError>
    where
        F: FnOnce(Host) -> Fut,
        Fut: Future,
    {
        let profile = spec.profile_name().to_string();
        self.configure_daemons(spec).await?;
        let output = body(self.clone()).await;
        let _ = self
            .configure_daemons(DaemonSpec::new(0).profile(profile))
            .await;
        Ok(output)
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Submits a task, returning its handle immediately.
    ///
    /// Never suspends and never errors: codec failures at submit time
    /// resolve the handle as `EvalError`, and a profile with no
    /// configured daemons warns and auto-launches one local in-process
    /// daemon. Must be called within a tokio runtime.
    pub fn submit(&self, spec: TaskSpec) -> TaskHandle {
        let state = self.inner.registry.state(&spec.profile);

        let extensions = match state.codecs.encode(&spec.refs) {
            Ok(extensions) => extensions,
            Err(err) => {
                let (handle, resolver) = handle::pair(TaskId::auto(), spec.profile.clone());
                resolver.resolve(TaskOutcome::EvalError {
                    message: err.to_string(),
                    stack: Vec::new(),
                });
                return handle;
            }
        };

        let task = Task::new(spec.payload, extensions, spec.timeout, spec.profile.clone());
        let (handle, resolver) = handle::pair(task.id.clone(), spec.profile);
        state.handles.insert(resolver);

        if let Some(timeout) = task.timeout {
            let handles = Arc::clone(&state.handles);
            let id = task.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if handles.resolve(&id, TaskOutcome::Timeout) {
                    debug!(task_id = %id, "task timed out on the host side");
                }
            });
        }

        debug!(profile = %task.profile, task_id = %task.id, "task submitted");
        match state.runtime.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(runtime) => {
                    let mut pending = state.pending.lock().expect("pending lock poisoned");
                    pending.push_back(task);
                    while let Some(next) = pending.pop_front() {
                        runtime.client.submit(next);
                    }
                }
                None => {
                    drop(guard);
                    self.route_unconfigured(&state, task);
                }
            },
            Err(_) => self.route_unconfigured(&state, task),
        }
        handle
    }

    /// Buffers the task and brings a pool up in the background (warning
    /// + one auto-launched local daemon when nothing was configured).
    fn route_unconfigured(&self, state: &Arc<ProfileState>, task: Task) {
        state
            .pending
            .lock()
            .expect("pending lock poisoned")
            .push_back(task);

        let host = self.clone();
        let state = Arc::clone(state);
        tokio::spawn(async move {
            if let Err(err) = host.ensure_runtime(&state).await {
                warn!(profile = %state.name, error = %err, "auto-launch failed");
                let ids: Vec<TaskId> = {
                    let mut pending = state.pending.lock().expect("pending lock poisoned");
                    pending.drain(..).map(|t| t.id).collect()
                };
                for id in ids {
                    state.handles.resolve(&id, TaskOutcome::TransportLost);
                }
                return;
            }
            let guard = state.runtime.lock().await;
            if let Some(runtime) = guard.as_ref() {
                let mut pending = state.pending.lock().expect("pending lock poisoned");
                while let Some(next) = pending.pop_front() {
                    runtime.client.submit(next);
                }
            }
        });
    }

    async fn ensure_runtime(&self, state: &Arc<ProfileState>) -> Result<(), HostError> {
        let mut runtime = state.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        if state.codecs.is_empty() {
            warn!(
                profile = %state.name,
                "no daemons configured; auto-launching one local daemon"
            );
        } else {
            warn!(
                profile = %state.name,
                codecs = state.codecs.len(),
                "no daemons configured for a profile with registered codecs; \
                 auto-launching one local daemon"
            );
        }

        let config = DirectConfig {
            url: TransportUrl::loopback(),
            tls: None,
            sticky: state.sticky_payload(),
        };
        let client = DirectPool::spawn(
            state.name.clone(),
            config,
            Arc::clone(&state.handles),
            state.codecs.clone(),
        )
        .await?;
        let dial_url = client.urls()[0].clone();

        let evaluator = self
            .inner
            .local_evaluator
            .lock()
            .expect("evaluator lock poisoned")
            .clone();
        let cancel = CancellationToken::new();
        let daemon =
            Daemon::new(DaemonConfig::new(dial_url), evaluator).with_codecs(state.codecs.clone());
        let join = tokio::spawn(daemon.run(cancel.clone()));

        *runtime = Some(ProfileRuntime {
            mode: DispatchMode::Direct,
            client,
            tls: None,
            daemon_count: 1,
            local_daemons: vec![LocalDaemon { cancel, join }],
        });
        Ok(())
    }

    /// Non-blocking result check; stable after resolution.
    pub fn poll(&self, handle: &TaskHandle) -> Option<TaskOutcome> {
        handle.poll()
    }

    /// Awaits the handle up to `deadline`.
    pub async fn wait(
        &self,
        handle: &mut TaskHandle,
        deadline: Duration,
    ) -> Result<TaskOutcome, DeadlineExceeded> {
        handle.wait_within(deadline).await
    }

    /// Cancels a task. Idempotent: a handle that already resolved keeps
    /// its outcome.
    ///
    /// A queued task is removed and resolves `Canceled` synchronously;
    /// an in-flight task resolves `Canceled` immediately while the
    /// daemon runs to completion and its late result is dropped.
    pub fn cancel(&self, handle: &TaskHandle) {
        let Some(state) = self.inner.registry.get(handle.profile()) else {
            return;
        };
        if !state.handles.resolve(handle.id(), TaskOutcome::Canceled) {
            return;
        }
        state
            .pending
            .lock()
            .expect("pending lock poisoned")
            .retain(|t| &t.id != handle.id());

        let id = handle.id().clone();
        match state.runtime.try_lock() {
            Ok(guard) => {
                if let Some(runtime) = guard.as_ref() {
                    runtime.client.cancel(id);
                }
            }
            Err(_) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let guard = state.runtime.lock().await;
                    if let Some(runtime) = guard.as_ref() {
                        runtime.client.cancel(id);
                    }
                });
            }
        };
    }

    // ------------------------------------------------------------------
    // Profile-scoped operations
    // ------------------------------------------------------------------

    /// Connections plus daemon details for the profile.
    pub async fn status(&self, profile: &str) -> StatusSnapshot {
        let Some(state) = self.inner.registry.get(profile) else {
            return StatusSnapshot::empty();
        };
        let guard = state.runtime.lock().await;
        match guard.as_ref() {
            Some(runtime) => runtime
                .client
                .status()
                .await
                .unwrap_or_else(StatusSnapshot::empty),
            None => StatusSnapshot::empty(),
        }
    }

    /// Installs the sticky-setup payload: replayed to every connected
    /// daemon now and to every future daemon on connect.
    pub async fn everywhere(&self, payload: impl Into<Bytes>, profile: &str) {
        let state = self.inner.registry.state(profile);
        let payload = payload.into();
        *state.sticky.lock().expect("sticky lock poisoned") = payload.clone();

        let guard = state.runtime.lock().await;
        if let Some(runtime) = guard.as_ref() {
            runtime.client.everywhere(payload);
        }
    }

    /// Registers a codec for a class tag on the profile.
    pub fn register_codec(
        &self,
        profile: &str,
        tag: impl Into<String>,
        serialize: SerializeFn,
        deserialize: DeserializeFn,
        vectorized: bool,
    ) {
        self.inner
            .registry
            .state(profile)
            .codecs
            .register(tag, serialize, deserialize, vectorized);
    }

    /// Regenerates the listen URL of daemon slot `index` (dispatcher
    /// mode only), invalidating stale connection attempts.
    pub async fn saisei(&self, profile: &str, index: usize) -> Result<TransportUrl, HostError> {
        let state = self
            .inner
            .registry
            .get(profile)
            .ok_or_else(|| HostError::UnknownProfile(profile.to_string()))?;
        let guard = state.runtime.lock().await;
        let runtime = guard
            .as_ref()
            .ok_or_else(|| HostError::NotConfigured(profile.to_string()))?;
        Ok(runtime.client.saisei(index).await?)
    }

    /// The listen URLs daemons of this profile dial.
    pub async fn daemon_urls(&self, profile: &str) -> Result<Vec<TransportUrl>, HostError> {
        let state = self
            .inner
            .registry
            .get(profile)
            .ok_or_else(|| HostError::UnknownProfile(profile.to_string()))?;
        let guard = state.runtime.lock().await;
        let runtime = guard
            .as_ref()
            .ok_or_else(|| HostError::NotConfigured(profile.to_string()))?;
        Ok(runtime.client.urls().to_vec())
    }

    /// Renders one daemon launch command per slot, TLS certificate
    /// embedded.
    pub async fn launch_commands(
        &self,
        profile: &str,
        program: &str,
    ) -> Result<Vec<String>, HostError> {
        let state = self
            .inner
            .registry
            .get(profile)
            .ok_or_else(|| HostError::UnknownProfile(profile.to_string()))?;
        let guard = state.runtime.lock().await;
        let runtime = guard
            .as_ref()
            .ok_or_else(|| HostError::NotConfigured(profile.to_string()))?;
        Ok(runtime
            .client
            .urls()
            .iter()
            .map(|url| launch::daemon_command(program, url, runtime.tls.as_ref(), true, None))
            .collect())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("profiles", &self.inner.registry.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::daemon::{DaemonExit, Evaluation};
    use crate::handle::HandleState;
    use std::pin::Pin;
    use std::time::Instant;
    use tokio::task::JoinHandle;

    /// Test evaluator: `sleep:<ms>` sleeps (interruptibly) then echoes,
    /// `fail:<msg>` errors, anything else echoes. Setup payloads are
    /// recorded.
    struct ScriptedEvaluator {
        setups: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedEvaluator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                setups: Mutex::new(Vec::new()),
            })
        }
    }

    impl Evaluator for ScriptedEvaluator {
        fn apply_setup(&self, payload: &[u8]) -> Result<(), String> {
            self.setups.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        fn evaluate<'a>(
            &'a self,
            payload: Bytes,
            refs: Vec<ExternalRef>,
            interrupt: CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Evaluation> + Send + 'a>> {
            Box::pin(async move {
                let text = String::from_utf8_lossy(&payload).to_string();
                if let Some(ms) = text.strip_prefix("sleep:") {
                    let ms: u64 = ms.parse().unwrap_or(0);
                    tokio::select! {
                        _ = interrupt.cancelled() => return Evaluation::Interrupted,
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                    return Evaluation::Ok { payload, refs };
                }
                if let Some(msg) = text.strip_prefix("fail:") {
                    return Evaluation::Error {
                        message: msg.to_string(),
                        stack: vec!["evaluate".into()],
                    };
                }
                Evaluation::Ok { payload, refs }
            })
        }
    }

    type DaemonHandle = (
        CancellationToken,
        JoinHandle<Result<DaemonExit, TransportError>>,
    );

    fn spawn_daemon(
        url: &TransportUrl,
        evaluator: Arc<dyn Evaluator>,
        codecs: Option<CodecRegistry>,
    ) -> DaemonHandle {
        let mut daemon = Daemon::new(DaemonConfig::new(url.clone()), evaluator);
        if let Some(codecs) = codecs {
            daemon = daemon.with_codecs(codecs);
        }
        let cancel = CancellationToken::new();
        let join = tokio::spawn(daemon.run(cancel.clone()));
        (cancel, join)
    }

    async fn spawn_pool_daemons(
        host: &Host,
        profile: &str,
        count: usize,
        evaluator: Arc<dyn Evaluator>,
    ) -> Vec<DaemonHandle> {
        let urls = host.daemon_urls(profile).await.unwrap();
        let mut daemons = Vec::new();
        for i in 0..count {
            // Dispatcher mode has one URL per slot; direct mode shares one.
            let url = urls.get(i).unwrap_or(&urls[0]);
            daemons.push(spawn_daemon(url, Arc::clone(&evaluator), None));
        }
        // Let connections and sticky handshakes settle.
        tokio::time::sleep(Duration::from_millis(100)).await;
        daemons
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_sleep_tasks_across_four_daemons() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(4)).await.unwrap();
        let _daemons = spawn_pool_daemons(&host, DEFAULT_PROFILE, 4, ScriptedEvaluator::new()).await;

        let start = Instant::now();
        let mut handles: Vec<TaskHandle> = (0..10)
            .map(|_| host.submit(TaskSpec::new("sleep:100")))
            .collect();
        for h in handles.iter_mut() {
            let outcome = h.wait_within(Duration::from_secs(5)).await.unwrap();
            assert!(outcome.is_ok(), "unexpected outcome {:?}", outcome);
        }
        let elapsed = start.elapsed();

        // 10 × 100ms over 4 daemons is three waves; far below the 1s a
        // single daemon would need.
        assert!(elapsed < Duration::from_millis(900), "took {:?}", elapsed);

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_keeps_daemon_and_counters() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(1)).await.unwrap();
        let _daemons = spawn_pool_daemons(&host, DEFAULT_PROFILE, 1, ScriptedEvaluator::new()).await;

        let started = Instant::now();
        let mut handle = host.submit(
            TaskSpec::new("sleep:500").timeout(Duration::from_millis(100)),
        );
        let outcome = handle.wait_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Timeout);
        assert_eq!(outcome.error_value(), Some(5));
        assert!(started.elapsed() < Duration::from_millis(400));

        // The daemon finishes anyway; its dropped result still advances
        // the completion counter.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let status = host.status(DEFAULT_PROFILE).await;
        let rows = status.daemons.matrix().unwrap().to_vec();
        assert_eq!(rows[0].assigned_count, 1);
        assert_eq!(rows[0].complete_count, 1);

        // The handle keeps its first resolution.
        assert_eq!(handle.poll(), Some(TaskOutcome::Timeout));

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_codec_round_trip_through_echo() {
        let host = Host::new();

        let serialize: SerializeFn = Arc::new(|refs| {
            let mut out = Vec::new();
            for r in refs {
                out.push(r.data.len() as u8);
                out.extend_from_slice(&r.data);
            }
            Ok(Bytes::from(out))
        });
        let deserialize: DeserializeFn = Arc::new(|blob| {
            let mut refs = Vec::new();
            let mut rest = &blob[..];
            while !rest.is_empty() {
                let len = rest[0] as usize;
                if rest.len() < 1 + len {
                    return Err(CodecError::Deserialize {
                        tag: "ExtRef".into(),
                        message: "truncated".into(),
                    });
                }
                refs.push(ExternalRef::new("ExtRef", rest[1..1 + len].to_vec()));
                rest = &rest[1 + len..];
            }
            Ok(refs)
        });
        host.register_codec(DEFAULT_PROFILE, "ExtRef", serialize, deserialize, true);

        host.configure_daemons(DaemonSpec::new(1)).await.unwrap();
        let urls = host.daemon_urls(DEFAULT_PROFILE).await.unwrap();
        let _daemon = spawn_daemon(
            &urls[0],
            Arc::new(EchoEvaluator),
            Some(host.codec_registry(DEFAULT_PROFILE)),
        );

        let reference = ExternalRef::new("ExtRef", vec![0xDE, 0xAD]);
        let mut handle = host.submit(TaskSpec::new("carrier").with_ref(reference.clone()));

        match handle.wait_within(Duration::from_secs(2)).await.unwrap() {
            TaskOutcome::Ok { refs, .. } => assert_eq!(refs, vec![reference]),
            other => panic!("expected ok outcome, got {:?}", other),
        }

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_death_mid_task_surfaces_transport_lost() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(2)).await.unwrap();
        let daemons =
            spawn_pool_daemons(&host, DEFAULT_PROFILE, 2, ScriptedEvaluator::new()).await;

        // First submission lands on slot 0, second on slot 1.
        let mut doomed = host.submit(TaskSpec::new("sleep:5000"));
        let mut quick = host.submit(TaskSpec::new("sleep:50"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Kill the first daemon mid-task.
        daemons[0].0.cancel();

        assert_eq!(
            doomed.wait_within(Duration::from_secs(2)).await.unwrap(),
            TaskOutcome::TransportLost
        );
        assert!(quick
            .wait_within(Duration::from_secs(2))
            .await
            .unwrap()
            .is_ok());

        // The surviving daemon keeps serving.
        let mut after = host.submit(TaskSpec::new("still here"));
        assert!(after
            .wait_within(Duration::from_secs(2))
            .await
            .unwrap()
            .is_ok());

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_immediate() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(1)).await.unwrap();
        let _daemons = spawn_pool_daemons(&host, DEFAULT_PROFILE, 1, ScriptedEvaluator::new()).await;

        let mut handle = host.submit(TaskSpec::new("sleep:5000"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        host.cancel(&handle);
        // Resolution is synchronous.
        assert_eq!(handle.state(), HandleState::Canceled);
        let outcome = handle.wait().await;
        assert_eq!(outcome, TaskOutcome::Canceled);
        assert_eq!(outcome.error_value(), Some(20));

        // Repeated cancellation changes nothing.
        host.cancel(&handle);
        host.cancel(&handle);
        assert_eq!(handle.poll(), Some(TaskOutcome::Canceled));

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_of_queued_task_never_dispatches() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(1)).await.unwrap();
        let _daemons = spawn_pool_daemons(&host, DEFAULT_PROFILE, 1, ScriptedEvaluator::new()).await;

        // Occupy the single daemon, then queue one more and cancel it.
        let mut busy = host.submit(TaskSpec::new("sleep:200"));
        let queued = host.submit(TaskSpec::new("sleep:0"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.cancel(&queued);
        assert_eq!(queued.poll(), Some(TaskOutcome::Canceled));

        assert!(busy
            .wait_within(Duration::from_secs(2))
            .await
            .unwrap()
            .is_ok());

        // The canceled task never reached the daemon: one assignment.
        let status = host.status(DEFAULT_PROFILE).await;
        let rows = status.daemons.matrix().unwrap().to_vec();
        assert_eq!(rows[0].assigned_count, 1);

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_eval_error_carries_stack_and_does_not_poison() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(1)).await.unwrap();
        let _daemons = spawn_pool_daemons(&host, DEFAULT_PROFILE, 1, ScriptedEvaluator::new()).await;

        let mut failing = host.submit(TaskSpec::new("fail:division by zero"));
        match failing.wait_within(Duration::from_secs(2)).await.unwrap() {
            TaskOutcome::EvalError { message, stack } => {
                assert_eq!(message, "division by zero");
                assert!(!stack.is_empty());
            }
            other => panic!("expected eval error, got {:?}", other),
        }

        // The daemon stays online and keeps serving.
        let mut next = host.submit(TaskSpec::new("still alive"));
        assert!(next
            .wait_within(Duration::from_secs(2))
            .await
            .unwrap()
            .is_ok());
        let status = host.status(DEFAULT_PROFILE).await;
        assert_eq!(status.connections, 1);

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_everywhere_reaches_current_and_future_daemons() {
        let host = Host::new();
        host.everywhere("library loads", DEFAULT_PROFILE).await;

        host.configure_daemons(DaemonSpec::new(2)).await.unwrap();
        let urls = host.daemon_urls(DEFAULT_PROFILE).await.unwrap();

        let early = ScriptedEvaluator::new();
        let _early_daemon = spawn_daemon(&urls[0], early.clone(), None);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A daemon connecting later still receives the sticky payload.
        let late = ScriptedEvaluator::new();
        let _late_daemon = spawn_daemon(&urls[1], late.clone(), None);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            early.setups.lock().unwrap().as_slice(),
            &[b"library loads".to_vec()]
        );
        assert_eq!(
            late.setups.lock().unwrap().as_slice(),
            &[b"library loads".to_vec()]
        );

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_scoped_daemons_tears_down_on_exit() {
        let host = Host::new();
        let evaluator = ScriptedEvaluator::new();

        let result = host
            .scoped_daemons(DaemonSpec::new(3), |host| {
                let evaluator = evaluator.clone();
                async move {
                    let daemons =
                        spawn_pool_daemons(&host, DEFAULT_PROFILE, 3, evaluator).await;
                    let mut handles: Vec<TaskHandle> = (0..20)
                        .map(|i| host.submit(TaskSpec::new(format!("task {}", i).into_bytes())))
                        .collect();
                    for h in handles.iter_mut() {
                        let outcome = h.wait_within(Duration::from_secs(5)).await.unwrap();
                        assert!(outcome.is_ok());
                    }
                    daemons
                }
            })
            .await
            .unwrap();

        // After the scope: pool gone, daemons exited (shutdown frames
        // trigger autoexit).
        let status = host.status(DEFAULT_PROFILE).await;
        assert_eq!(status.connections, 0);
        for (_, join) in result {
            let exit = tokio::time::timeout(Duration::from_secs(2), join)
                .await
                .expect("daemon did not exit")
                .unwrap()
                .unwrap();
            assert_eq!(exit, DaemonExit::Clean);
        }
    }

    #[tokio::test]
    async fn test_teardown_cancels_pending_handles() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(1)).await.unwrap();
        // No daemon processes: submissions stay queued.
        let mut handles: Vec<TaskHandle> = (0..3)
            .map(|_| host.submit(TaskSpec::new("never runs")))
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
        for h in handles.iter_mut() {
            assert_eq!(
                h.wait_within(Duration::from_secs(1)).await.unwrap(),
                TaskOutcome::Canceled
            );
        }
    }

    #[tokio::test]
    async fn test_direct_mode_round_trips() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(2).dispatcher(false))
            .await
            .unwrap();
        let _daemons = spawn_pool_daemons(&host, DEFAULT_PROFILE, 2, ScriptedEvaluator::new()).await;

        let mut handles: Vec<TaskHandle> = (0..6)
            .map(|i| host.submit(TaskSpec::new(format!("direct {}", i).into_bytes())))
            .collect();
        for h in handles.iter_mut() {
            assert!(h
                .wait_within(Duration::from_secs(2))
                .await
                .unwrap()
                .is_ok());
        }

        let status = host.status(DEFAULT_PROFILE).await;
        assert!(status.daemons.urls().is_some());

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unconfigured_submit_auto_launches_local_daemon() {
        let host = Host::new();
        // No configure_daemons at all: the echo evaluator answers.
        let mut handle = host.submit(TaskSpec::new("auto"));
        match handle.wait_within(Duration::from_secs(2)).await.unwrap() {
            TaskOutcome::Ok { payload, .. } => assert_eq!(payload, Bytes::from_static(b"auto")),
            other => panic!("expected ok outcome, got {:?}", other),
        }
        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_profiles_are_isolated() {
        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(1).profile("gpu"))
            .await
            .unwrap();
        let _daemons = spawn_pool_daemons(&host, "gpu", 1, ScriptedEvaluator::new()).await;

        // Work on "gpu" leaves "default" untouched.
        let mut handle = host.submit(TaskSpec::new("job").profile("gpu"));
        assert!(handle
            .wait_within(Duration::from_secs(2))
            .await
            .unwrap()
            .is_ok());

        let default_status = host.status(DEFAULT_PROFILE).await;
        assert_eq!(default_status.connections, 0);

        host.configure_daemons(DaemonSpec::new(0).profile("gpu"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_launch_commands_embed_tls_certificate() {
        let host = Host::new();
        host.configure_daemons(
            DaemonSpec::new(4).url("tls+tcp://127.0.0.1:0"),
        )
        .await
        .unwrap();

        let commands = host
            .launch_commands(DEFAULT_PROFILE, "taskmesh-daemon")
            .await
            .unwrap();
        assert_eq!(commands.len(), 4);
        for cmd in &commands {
            assert!(cmd.contains("--dial tls+tcp://127.0.0.1:"));
            assert!(cmd.contains("-----BEGIN CERTIFICATE-----"));
        }

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_daemons_connect_with_pinned_certificate() {
        use crate::transport::TlsClientMaterial;

        let host = Host::new();
        host.configure_daemons(DaemonSpec::new(1).url("tls+tcp://127.0.0.1:0"))
            .await
            .unwrap();
        let urls = host.daemon_urls(DEFAULT_PROFILE).await.unwrap();

        // Extract the certificate the way a launch command would.
        let commands = host
            .launch_commands(DEFAULT_PROFILE, "taskmesh-daemon")
            .await
            .unwrap();
        let pem_start = commands[0].find("-----BEGIN CERTIFICATE-----").unwrap();
        let pem_end = commands[0].rfind("-----END CERTIFICATE-----").unwrap();
        let pem = &commands[0][pem_start..pem_end + "-----END CERTIFICATE-----".len()];

        let config = DaemonConfig::new(urls[0].clone()).with_tls(TlsClientMaterial::new(pem));
        let daemon = Daemon::new(config, Arc::new(EchoEvaluator));
        let cancel = CancellationToken::new();
        let _join = tokio::spawn(daemon.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = host.status(DEFAULT_PROFILE).await;
        assert_eq!(status.connections, 1);
        let rows = status.daemons.matrix().unwrap().to_vec();
        assert!(rows[0].online);

        let mut handle = host.submit(TaskSpec::new("over tls"));
        match handle.wait_within(Duration::from_secs(2)).await.unwrap() {
            TaskOutcome::Ok { payload, .. } => {
                assert_eq!(payload, Bytes::from_static(b"over tls"));
            }
            other => panic!("expected ok outcome, got {:?}", other),
        }

        host.configure_daemons(DaemonSpec::new(0)).await.unwrap();
    }
}
