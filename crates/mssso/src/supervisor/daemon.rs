use super::{ConnectRequest, ConnectResult, DisconnectReport, Supervisor, SupervisorStatus};
use crate::error::VpnError;
use crate::rpc::{self, ActionResult, ConnectOutcome, ConnectParams, DisconnectParams, StatusParams};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Forwards supervision to the privileged daemon over its control socket.
pub struct DaemonSupervisor {
    socket: PathBuf,
    portal_cookies: Mutex<HashMap<String, String>>,
}

impl DaemonSupervisor {
    pub fn new(socket: &Path) -> Self {
        Self {
            socket: socket.to_path_buf(),
            portal_cookies: Mutex::new(HashMap::new()),
        }
    }
}

/// Rebuilds the typed error the daemon flattened into `error_kind`.
fn outcome_error(outcome: ConnectOutcome) -> VpnError {
    match outcome.error_kind.as_deref() {
        Some("CookieRejected") => VpnError::CookieRejected {
            output: outcome.output,
        },
        Some("ProcessExitedEarly") => VpnError::ProcessExitedEarly {
            code: None,
            output: outcome.output,
        },
        Some("ClientNotFound") => VpnError::ClientNotFound {
            searched: "openconnect (daemon)".to_string(),
        },
        _ => VpnError::Daemon {
            message: outcome.message,
        },
    }
}

fn outcome_result(outcome: ConnectOutcome) -> ConnectResult {
    if !outcome.success {
        return ConnectResult::Failed(outcome_error(outcome));
    }
    let pid = outcome.pid.unwrap_or_default();
    match outcome.state.as_deref() {
        Some("started") => ConnectResult::Started { pid },
        Some("already_connected") => ConnectResult::AlreadyConnected { pid },
        _ => ConnectResult::Connected { pid },
    }
}

impl Supervisor for DaemonSupervisor {
    fn connect(&self, request: &ConnectRequest) -> Result<ConnectResult, VpnError> {
        log::info!("[*] Asking daemon to connect '{}'", request.connection_name);
        let mut outcome: ConnectOutcome =
            rpc::call(&self.socket, "connect", &ConnectParams::from_request(request))?;
        if let Some(cookie) = outcome.portal_cookie.take() {
            self.portal_cookies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(request.connection_name.clone(), cookie);
        }
        Ok(outcome_result(outcome))
    }

    fn disconnect(&self, name: Option<&str>, graceful: bool) -> Result<DisconnectReport, VpnError> {
        let result: ActionResult = rpc::call(
            &self.socket,
            "disconnect",
            &DisconnectParams {
                connection_name: name.map(str::to_string),
                graceful,
            },
        )?;
        if !result.success {
            return Err(VpnError::Daemon {
                message: result.message,
            });
        }
        Ok(DisconnectReport {
            stopped: result.stopped,
            message: result.message,
        })
    }

    fn status(&self, name: Option<&str>) -> SupervisorStatus {
        let params = StatusParams {
            connection_name: name.map(str::to_string),
        };
        match rpc::call(&self.socket, "status", &params) {
            Ok(status) => status,
            Err(e) => {
                log::warn!("[!] Daemon status unavailable: {}", e.user_message());
                SupervisorStatus::default()
            }
        }
    }

    fn take_portal_cookie(&self, name: &str) -> Option<String> {
        self.portal_cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_back_to_results() {
        let ok = ConnectOutcome {
            success: true,
            pid: Some(12),
            state: Some("started".into()),
            ..Default::default()
        };
        assert!(matches!(outcome_result(ok), ConnectResult::Started { pid: 12 }));

        let rejected = ConnectOutcome {
            success: false,
            message: "rejected".into(),
            error_kind: Some("CookieRejected".into()),
            output: vec!["401".into()],
            ..Default::default()
        };
        match outcome_result(rejected) {
            ConnectResult::Failed(err) => assert!(err.is_retryable_by_reauth()),
            other => panic!("unexpected {:?}", other),
        }

        let other = ConnectOutcome {
            success: false,
            message: "boom".into(),
            error_kind: Some("Io".into()),
            ..Default::default()
        };
        assert!(matches!(
            outcome_result(other),
            ConnectResult::Failed(VpnError::Daemon { .. })
        ));
    }

    #[test]
    fn unreachable_daemon_reports_idle_status() {
        let dir = tempfile::tempdir().unwrap();
        let sup = DaemonSupervisor::new(&dir.path().join("missing.sock"));
        assert_eq!(sup.status(None), SupervisorStatus::default());
        assert!(matches!(
            sup.disconnect(None, true),
            Err(VpnError::Daemon { .. })
        ));
    }
}
