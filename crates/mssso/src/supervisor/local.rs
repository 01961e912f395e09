use super::{ConnectRequest, ConnectResult, DisconnectReport, Supervisor, SupervisorStatus};
use crate::config::RuntimeConfig;
use crate::error::VpnError;
use crate::openconnect::{
    cleanup_dns, require_openconnect, signal_tree, spawn_client, ClientInvocation, ClientOutput,
    Escalation, SpawnedClient,
};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(100);
/// Extra wait after SIGKILL before giving up on reaping.
const KILL_WAIT: Duration = Duration::from_secs(2);

fn lock_output(output: &Mutex<ClientOutput>) -> MutexGuard<'_, ClientOutput> {
    output.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    output: Arc<Mutex<ClientOutput>>,
    name: String,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines().map_while(Result::ok) {
            log::debug!("[openconnect:{}] {}", name, line);
            lock_output(&output).push(&line);
        }
    })
}

struct ClientHandle {
    child: Child,
    output: Arc<Mutex<ClientOutput>>,
    readers: Vec<JoinHandle<()>>,
    handoff: Option<PathBuf>,
}

impl ClientHandle {
    fn start(spawned: SpawnedClient, name: &str) -> Self {
        let SpawnedClient { mut child, handoff } = spawned;
        let output = Arc::new(Mutex::new(ClientOutput::default()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&output), name.to_string()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&output), name.to_string()));
        }
        Self {
            child,
            output,
            readers,
            handoff,
        }
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn exited(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    fn connected(&self) -> bool {
        lock_output(&self.output).connected
    }

    /// Lets the readers catch up with output already written, then returns it.
    fn finish(mut self, wait: Duration) -> ClientOutput {
        let deadline = Instant::now() + wait;
        while self.readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        for reader in std::mem::take(&mut self.readers) {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        if let Some(path) = self.handoff.take() {
            let _ = std::fs::remove_file(path);
        }
        let output = lock_output(&self.output).clone();
        output
    }
}

/// Supervises clients spawned by this process.
pub struct LocalSupervisor {
    openconnect_path: String,
    escalation: Option<Escalation>,
    grace: Duration,
    disconnect_timeout: Duration,
    sessions: Mutex<BTreeMap<String, ClientHandle>>,
}

impl LocalSupervisor {
    pub fn new(openconnect_path: &str, escalation: Option<Escalation>) -> Self {
        Self {
            openconnect_path: openconnect_path.to_string(),
            escalation,
            grace: Duration::from_secs(2),
            disconnect_timeout: Duration::from_secs(10),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &RuntimeConfig, escalation: Option<Escalation>) -> Self {
        Self::new(&config.openconnect_path, escalation)
            .grace(config.connect_grace)
            .disconnect_timeout(config.disconnect_timeout)
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<String, ClientHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grace_check(&self, name: &str, pid: u32) -> ConnectResult {
        let deadline = Instant::now() + self.grace;
        loop {
            let mut sessions = self.sessions();
            let Some(handle) = sessions.get_mut(name) else {
                log::info!("[!] '{}' was disconnected while starting", name);
                return ConnectResult::Failed(VpnError::Cancelled);
            };

            if let Some(status) = handle.exited() {
                let handle = sessions.remove(name);
                drop(sessions);
                let output = handle.map(|h| h.finish(Duration::from_millis(500))).unwrap_or_default();
                cleanup_dns(self.escalation.as_ref());
                let err = output.exit_error(status.code());
                log::warn!("[!] openconnect exited early ({}): {}", status, err.kind());
                return ConnectResult::Failed(err);
            }
            if handle.connected() {
                log::info!("[✓] Tunnel is up (pid {})", pid);
                return ConnectResult::Connected { pid };
            }
            drop(sessions);

            if Instant::now() >= deadline {
                log::info!("[✓] openconnect running (pid {})", pid);
                return ConnectResult::Connected { pid };
            }
            thread::sleep(POLL);
        }
    }

    fn stop(&self, name: &str, mut handle: ClientHandle, graceful: bool) {
        let pid = handle.pid();
        let sig = if graceful { Signal::SIGTERM } else { Signal::SIGKILL };
        log::info!("[*] Disconnecting '{}' (pid {}, {})", name, pid, sig);
        signal_tree(pid, sig, self.escalation.as_ref());

        let mut deadline = Instant::now() + self.disconnect_timeout;
        let mut killed = !graceful;
        while handle.exited().is_none() {
            if Instant::now() >= deadline {
                if killed {
                    log::warn!("[!] openconnect (pid {}) could not be reaped", pid);
                    break;
                }
                log::warn!(
                    "[!] openconnect did not exit within {:?}, sending SIGKILL",
                    self.disconnect_timeout
                );
                signal_tree(pid, Signal::SIGKILL, self.escalation.as_ref());
                killed = true;
                deadline = Instant::now() + KILL_WAIT;
            }
            thread::sleep(POLL);
        }

        handle.finish(Duration::ZERO);
        if graceful {
            cleanup_dns(self.escalation.as_ref());
        }
    }

    fn reap(sessions: &mut BTreeMap<String, ClientHandle>) {
        let dead: Vec<String> = sessions
            .iter_mut()
            .filter_map(|(name, h)| h.exited().map(|_| name.clone()))
            .collect();
        for name in dead {
            if let Some(handle) = sessions.remove(&name) {
                let output = handle.finish(Duration::ZERO);
                log::warn!(
                    "[!] openconnect for '{}' has exited. Last output:\n{}",
                    name,
                    output.tail(5).join("\n")
                );
            }
        }
    }
}

impl Supervisor for LocalSupervisor {
    fn connect(&self, request: &ConnectRequest) -> Result<ConnectResult, VpnError> {
        request
            .bundle
            .validate()
            .map_err(|reason| VpnError::InvalidProfile { reason })?;
        let program = require_openconnect(&self.openconnect_path)?;
        let name = request.connection_name.as_str();

        let pid = {
            let mut sessions = self.sessions();
            Self::reap(&mut sessions);
            if let Some(handle) = sessions.get(name) {
                let pid = handle.pid();
                log::info!("[*] '{}' is already connected (pid {})", name, pid);
                return Ok(ConnectResult::AlreadyConnected { pid });
            }

            let credential = request.bundle.client_credential();
            let invocation = ClientInvocation::new(
                &program,
                request.protocol,
                &request.address,
                &request.username,
                request.no_dtls,
                &credential,
            );
            log::info!("[*] Running: {}", invocation.display());
            let spawned = spawn_client(&invocation, self.escalation.as_ref())?;
            let handle = ClientHandle::start(spawned, name);
            let pid = handle.pid();
            sessions.insert(name.to_string(), handle);
            pid
        };

        if request.early_started {
            log::info!("[*] openconnect started (pid {}), not waiting for the tunnel", pid);
            return Ok(ConnectResult::Started { pid });
        }
        Ok(self.grace_check(name, pid))
    }

    fn disconnect(&self, name: Option<&str>, graceful: bool) -> Result<DisconnectReport, VpnError> {
        let handles: Vec<(String, ClientHandle)> = {
            let mut sessions = self.sessions();
            match name {
                Some(n) => sessions.remove_entry(n).into_iter().collect(),
                None => std::mem::take(&mut *sessions).into_iter().collect(),
            }
        };

        if handles.is_empty() {
            return Ok(DisconnectReport {
                stopped: 0,
                message: "No active connection".to_string(),
            });
        }

        let stopped = handles.len();
        let names: Vec<String> = handles.iter().map(|(n, _)| n.clone()).collect();
        for (name, handle) in handles {
            self.stop(&name, handle, graceful);
        }
        Ok(DisconnectReport {
            stopped,
            message: format!("Disconnected {}", names.join(", ")),
        })
    }

    fn status(&self, name: Option<&str>) -> SupervisorStatus {
        let mut sessions = self.sessions();
        Self::reap(&mut sessions);
        let entry = match name {
            Some(n) => sessions.get_key_value(n),
            None => sessions.iter().next(),
        };
        match entry {
            Some((name, handle)) => SupervisorStatus {
                connected: true,
                connection_name: Some(name.clone()),
                pid: Some(handle.pid()),
            },
            None => SupervisorStatus::default(),
        }
    }

    fn take_portal_cookie(&self, name: &str) -> Option<String> {
        self.sessions()
            .get(name)
            .and_then(|h| lock_output(&h.output).portal_cookie.take())
    }
}

impl Drop for LocalSupervisor {
    fn drop(&mut self) {
        let sessions = std::mem::take(&mut *self.sessions());
        for (name, handle) in sessions {
            self.stop(&name, handle, true);
        }
    }
}
