//! Launch orchestration: turning a daemon roster into shell commands.
//!
//! Given the listen URLs of a configured profile and its TLS material,
//! this module renders, for each slot, the command that starts a daemon
//! on a remote host dialing back with the right certificate embedded.
//! A [`LaunchPlan`] decides how the command reaches the remote machine.

use crate::transport::TlsMaterial;
use crate::url::TransportUrl;
use std::sync::Arc;
use tokio::process::{Child, Command};

/// Hosts accepted by the tunneled launch variant.
const LOCALHOST_NAMES: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Errors from rendering or invoking launch commands.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("tunneled launch requires a localhost URL, got {0}")]
    TunnelRequiresLocalhost(String),

    #[error("failed to spawn launch command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("manual launch plans only render commands")]
    ManualOnly,
}

/// How daemon launch commands reach their machines.
#[derive(Clone)]
pub enum LaunchPlan {
    /// Run the daemon command on `remote` over ssh; the remote opens an
    /// outbound TCP connection to the host's externally reachable URL.
    SshDirect {
        remote: String,
        ssh_options: Vec<String>,
    },

    /// Forward the listen port over ssh (`-R`) and have the remote
    /// daemon dial `localhost`; the URL's host must already be local.
    SshTunnel {
        remote: String,
        ssh_options: Vec<String>,
    },

    /// Only render the command string; the operator runs it.
    Manual,

    /// Caller-supplied transformation of `(slot, daemon_command)` into
    /// the final command.
    Custom(Arc<dyn Fn(usize, &str) -> String + Send + Sync>),
}

impl std::fmt::Debug for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchPlan::SshDirect { remote, .. } => {
                f.debug_struct("SshDirect").field("remote", remote).finish()
            }
            LaunchPlan::SshTunnel { remote, .. } => {
                f.debug_struct("SshTunnel").field("remote", remote).finish()
            }
            LaunchPlan::Manual => f.write_str("Manual"),
            LaunchPlan::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Renders the daemon invocation for one slot.
///
/// The TLS certificate PEM is embedded single-quoted; PEM bodies contain
/// no quote characters.
pub fn daemon_command(
    program: &str,
    url: &TransportUrl,
    tls: Option<&TlsMaterial>,
    autoexit: bool,
    rng_seed: Option<u64>,
) -> String {
    let mut cmd = format!("{} --dial {}", program, url);
    if let Some(material) = tls {
        let [certs, _key_placeholder] = material.client_material();
        cmd.push_str(&format!(" --tls '{}'", certs));
    }
    if !autoexit {
        cmd.push_str(" --no-autoexit");
    }
    if let Some(seed) = rng_seed {
        cmd.push_str(&format!(" --rs {}", seed));
    }
    cmd
}

impl LaunchPlan {
    /// Renders the full launch command for slot `i`.
    pub fn render(
        &self,
        slot: usize,
        url: &TransportUrl,
        tls: Option<&TlsMaterial>,
        program: &str,
    ) -> Result<String, LaunchError> {
        let daemon = daemon_command(program, url, tls, true, None);
        match self {
            LaunchPlan::Manual => Ok(daemon),
            LaunchPlan::Custom(render) => Ok(render(slot, &daemon)),
            LaunchPlan::SshDirect {
                remote,
                ssh_options,
            } => Ok(format!(
                "ssh {} {} \"{}\"",
                ssh_options.join(" "),
                remote,
                daemon
            )),
            LaunchPlan::SshTunnel {
                remote,
                ssh_options,
            } => {
                if !LOCALHOST_NAMES.contains(&url.host()) {
                    return Err(LaunchError::TunnelRequiresLocalhost(url.to_string()));
                }
                let port = url.port();
                Ok(format!(
                    "ssh {} -o ExitOnForwardFailure=yes -R {}:127.0.0.1:{} {} \"{}\"",
                    ssh_options.join(" "),
                    port,
                    port,
                    remote,
                    daemon
                ))
            }
        }
    }

    /// Renders one command per slot.
    pub fn render_all(
        &self,
        urls: &[TransportUrl],
        tls: Option<&TlsMaterial>,
        program: &str,
    ) -> Result<Vec<String>, LaunchError> {
        urls.iter()
            .enumerate()
            .map(|(slot, url)| self.render(slot, url, tls, program))
            .collect()
    }

    /// Invokes the rendered commands through the shell, one child per
    /// slot. Manual plans refuse; their commands are for the operator.
    pub async fn launch(
        &self,
        urls: &[TransportUrl],
        tls: Option<&TlsMaterial>,
        program: &str,
    ) -> Result<Vec<Child>, LaunchError> {
        if matches!(self, LaunchPlan::Manual) {
            return Err(LaunchError::ManualOnly);
        }
        let mut children = Vec::with_capacity(urls.len());
        for command in self.render_all(urls, tls, program)? {
            let child = Command::new("sh").arg("-c").arg(&command).spawn()?;
            children.push(child);
        }
        Ok(children)
    }
}
