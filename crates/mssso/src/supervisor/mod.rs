//! Ownership of the VPN client process.
//!
//! [`LocalSupervisor`] spawns the client itself, optionally under an
//! escalation wrapper. [`DaemonSupervisor`] forwards to the privileged daemon
//! over the control socket. [`select_supervisor`] picks one for the current
//! process.

mod daemon;
mod local;

pub use daemon::DaemonSupervisor;
pub use local::LocalSupervisor;

use crate::config::RuntimeConfig;
use crate::cookies::CookieBundle;
use crate::error::VpnError;
use crate::openconnect::resolve_escalation;
use crate::profile::{ConnectionProfile, Protocol};
use serde::{Deserialize, Serialize};

/// Everything needed to start a client for one connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub connection_name: String,
    pub address: String,
    pub protocol: Protocol,
    pub username: String,
    pub no_dtls: bool,
    pub bundle: CookieBundle,
    /// Report `Started` right after spawn instead of waiting out the grace interval.
    pub early_started: bool,
}

impl ConnectRequest {
    pub fn new(profile: &ConnectionProfile, bundle: CookieBundle) -> Self {
        Self {
            connection_name: profile.name.clone(),
            address: profile.address.clone(),
            protocol: profile.protocol,
            username: profile.username.clone(),
            no_dtls: profile.no_dtls,
            bundle,
            early_started: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectResult {
    /// Survived the grace interval (or printed a tunnel-up line).
    Connected { pid: u32 },
    /// Spawned; tunnel bring-up is confirmed later, if at all.
    Started { pid: u32 },
    /// A live client for this name already exists; nothing was started.
    AlreadyConnected { pid: u32 },
    /// The client exited during the grace interval.
    Failed(VpnError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub connected: bool,
    pub connection_name: Option<String>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReport {
    /// Number of clients that were stopped.
    pub stopped: usize,
    pub message: String,
}

pub trait Supervisor: Send + Sync {
    fn connect(&self, request: &ConnectRequest) -> Result<ConnectResult, VpnError>;

    /// `graceful` sends SIGTERM, otherwise SIGKILL. `None` stops every client.
    fn disconnect(&self, name: Option<&str>, graceful: bool) -> Result<DisconnectReport, VpnError>;

    /// `None` reports the first live client.
    fn status(&self, name: Option<&str>) -> SupervisorStatus;

    /// GlobalProtect portal cookie printed by the client, if it printed one.
    fn take_portal_cookie(&self, name: &str) -> Option<String>;
}

/// Root runs the client directly; otherwise a reachable daemon wins over
/// spawning under `sudo`/`pkexec`.
pub fn select_supervisor(config: &RuntimeConfig) -> Box<dyn Supervisor> {
    if crate::utils::is_root() {
        log::debug!("Running as root, supervising openconnect directly");
        return Box::new(LocalSupervisor::from_config(config, None));
    }

    match crate::rpc::ping(&config.daemon_socket) {
        Ok(pong) => {
            log::info!("[*] Using ms-sso-openconnect daemon {}", pong.version);
            return Box::new(DaemonSupervisor::new(&config.daemon_socket));
        }
        Err(e) => log::debug!("Daemon not available: {}", e.kind()),
    }

    let escalation = resolve_escalation(config.escalation_tool.as_deref());
    match &escalation {
        Some(esc) => log::info!("Using {} for elevated privileges", esc.tool),
        None => log::warn!("[!] No privilege escalation tool found (sudo, sudo-rs, doas, pkexec)"),
    }
    Box::new(LocalSupervisor::from_config(config, escalation))
}
