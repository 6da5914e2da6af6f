//! Compute profiles: named, independent pool configurations.
//!
//! Every host operation is scoped by a profile name; `"default"` is
//! implied. Each profile owns its codec registry, sticky payload, handle
//! table, and (once configured) a running pool. No task crosses
//! profiles.

use crate::codec::CodecRegistry;
use crate::daemon::DaemonExit;
use crate::dispatcher::PoolClient;
use crate::handle::HandleTable;
use crate::task::Task;
use crate::transport::{TlsMaterial, TransportError};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The profile used when none is named.
pub const DEFAULT_PROFILE: &str = "default";

/// Transport arrangement of a profile's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Tasks flow through the FIFO/least-loaded dispatcher.
    DispatcherMediated,

    /// Tasks go straight to whichever daemon pulls first.
    Direct,
}

/// An in-process daemon owned by the profile (auto-launched pools).
pub struct LocalDaemon {
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<DaemonExit, TransportError>>,
}

/// The running pool of a configured profile.
pub struct ProfileRuntime {
    pub mode: DispatchMode,
    pub client: PoolClient,
    pub tls: Option<TlsMaterial>,
    pub daemon_count: usize,
    pub local_daemons: Vec<LocalDaemon>,
}

/// Profile-scoped state that exists independently of any running pool.
pub struct ProfileState {
    pub name: String,
    pub codecs: CodecRegistry,
    pub sticky: Mutex<Bytes>,
    pub handles: Arc<HandleTable>,
    /// Tasks submitted while no pool is running yet; flushed in FIFO
    /// order once one is.
    pub pending: Mutex<VecDeque<Task>>,
    pub runtime: tokio::sync::Mutex<Option<ProfileRuntime>>,
}

impl ProfileState {
    fn new(name: String) -> Self {
        Self {
            name,
            codecs: CodecRegistry::new(),
            sticky: Mutex::new(Bytes::new()),
            handles: Arc::new(HandleTable::new()),
            pending: Mutex::new(VecDeque::new()),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Current sticky-setup payload.
    pub fn sticky_payload(&self) -> Bytes {
        self.sticky.lock().expect("sticky lock poisoned").clone()
    }
}

/// Process-wide profile table.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: DashMap<String, Arc<ProfileState>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The named profile's state, created on first touch.
    pub fn state(&self, name: &str) -> Arc<ProfileState> {
        self.profiles
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ProfileState::new(name.to_string())))
            .clone()
    }

    /// The named profile's state, if it has been touched before.
    pub fn get(&self, name: &str) -> Option<Arc<ProfileState>> {
        self.profiles.get(name).map(|e| e.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_created_on_first_touch() {
        let registry = ProfileRegistry::new();
        assert!(registry.get("gpu").is_none());

        let state = registry.state("gpu");
        assert_eq!(state.name, "gpu");
        assert!(registry.get("gpu").is_some());
    }

    #[test]
    fn test_profiles_are_independent() {
        let registry = ProfileRegistry::new();
        let default = registry.state(DEFAULT_PROFILE);
        let gpu = registry.state("gpu");

        gpu.codecs.register(
            "OnlyGpu",
            Arc::new(|refs: &[crate::codec::ExternalRef]| Ok(refs[0].data.clone())),
            Arc::new(|blob: &Bytes| {
                Ok(vec![crate::codec::ExternalRef::new("OnlyGpu", blob.clone())])
            }),
            false,
        );

        assert_eq!(gpu.codecs.len(), 1);
        assert!(default.codecs.is_empty());
    }

    #[test]
    fn test_state_is_shared_not_cloned() {
        let registry = ProfileRegistry::new();
        let a = registry.state("p");
        let b = registry.state("p");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
