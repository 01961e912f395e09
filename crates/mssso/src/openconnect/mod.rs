//! OpenConnect process management.
//!
//! Platform-specific code lives in the [`unix`] submodule. This module holds
//! what does not touch the OS: locating the binary, building the argument
//! list, and reading the client's output.

use crate::cookies::ClientCredential;
use crate::error::VpnError;
use crate::profile::Protocol;
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use which::which;

pub(crate) mod unix;

pub use unix::{
    cleanup_dns, find_askpass, resolve_escalation, signal_tree, spawn_client, terminate_running,
    Escalation, SpawnedClient,
};

/// Output lines kept per client.
pub const OUTPUT_BUFFER_LINES: usize = 100;
/// Lines attached to an early-exit error.
pub const ERROR_TAIL_LINES: usize = 10;

const REJECTION_PATTERNS: &[&str] = &[
    "cookie rejected",
    "authentication failed",
    "failed to obtain webvpn cookie",
    "http/1.1 401",
    "unexpected 401",
    "invalid cookie",
    "session expired",
];

const CONNECTED_PATTERNS: &[&str] = &["connected as", "esp session established", "dtls connected"];

// ── locate_openconnect ────────────────────────────────────────────────────────

/// Attempts to locate the `openconnect` executable.
///
/// Resolution order:
/// 1. `user_path` as a literal file path.
/// 2. `user_path` looked up via `PATH`.
/// 3. Common sbin and Homebrew directories.
pub fn locate_openconnect(user_path: &str) -> Option<PathBuf> {
    let candidate = Path::new(user_path);
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    if let Ok(found) = which(user_path) {
        return Some(found);
    }

    let dirs = [
        "/sbin",
        "/usr/sbin",
        "/usr/local/sbin",
        "/usr/local/bin",
        "/opt/homebrew/bin",
    ];
    dirs.iter()
        .map(|dir| Path::new(dir).join("openconnect"))
        .find(|p| p.is_file())
}

pub fn require_openconnect(user_path: &str) -> Result<PathBuf, VpnError> {
    locate_openconnect(user_path).ok_or_else(|| VpnError::ClientNotFound {
        searched: user_path.to_string(),
    })
}

// ── ClientInvocation ──────────────────────────────────────────────────────────

/// Program, arguments and the standard-input payload for one client run.
///
/// The cookie only ever travels in `stdin_payload`, never in `args`.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin_payload: String,
}

impl std::fmt::Debug for ClientInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInvocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin_payload", &crate::logger::redact(&self.stdin_payload))
            .finish()
    }
}

impl ClientInvocation {
    pub fn new(
        program: &Path,
        protocol: Protocol,
        address: &str,
        username: &str,
        no_dtls: bool,
        credential: &ClientCredential,
    ) -> Self {
        let mut args = vec![
            "--verbose".to_string(),
            format!("--protocol={}", protocol.client_flag()),
        ];

        match protocol {
            Protocol::AnyConnect => {
                if !username.is_empty() {
                    args.push(format!("--user={}", username));
                }
                args.push("--cookie-on-stdin".to_string());
            }
            Protocol::GlobalProtect => {
                args.push("--useragent=PAN GlobalProtect".to_string());
                args.push("--os=linux-64".to_string());
                if !username.is_empty() {
                    args.push(format!("--user={}", username));
                }
                if let Some(group) = &credential.usergroup {
                    args.push(format!("--usergroup={}", group));
                }
                args.push("--passwd-on-stdin".to_string());
            }
        }

        if no_dtls {
            args.push("--no-dtls".to_string());
        }
        args.push(address.to_string());

        Self {
            program: program.to_path_buf(),
            args,
            stdin_payload: format!("{}\n", credential.value),
        }
    }

    /// Printable command line for logs.
    pub fn display(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

fn portal_cookie_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"portal-userauthcookie=(\S+)").expect("static regex"))
}

pub fn is_rejection(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    REJECTION_PATTERNS.iter().any(|p| lower.contains(p))
}

pub fn is_connected(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CONNECTED_PATTERNS.iter().any(|p| lower.contains(p))
}

/// A GlobalProtect portal cookie echoed by the client, if any.
pub fn portal_cookie(line: &str) -> Option<String> {
    portal_cookie_regex()
        .captures(line)
        .map(|c| c[1].trim_end_matches(';').to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("empty"))
}

/// What the client has said so far, bounded to the last
/// [`OUTPUT_BUFFER_LINES`] lines.
#[derive(Debug, Default, Clone)]
pub struct ClientOutput {
    lines: VecDeque<String>,
    pub connected: bool,
    pub rejected: bool,
    pub portal_cookie: Option<String>,
}

impl ClientOutput {
    pub fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if is_connected(line) {
            self.connected = true;
        }
        if is_rejection(line) {
            self.rejected = true;
        }
        if let Some(cookie) = portal_cookie(line) {
            self.portal_cookie = Some(cookie);
        }
        if self.lines.len() == OUTPUT_BUFFER_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The error for a client that exited during the grace interval.
    pub fn exit_error(&self, code: Option<i32>) -> VpnError {
        if self.rejected {
            VpnError::CookieRejected {
                output: self.tail(ERROR_TAIL_LINES),
            }
        } else {
            VpnError::ProcessExitedEarly {
                code,
                output: self.tail(ERROR_TAIL_LINES),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(value: &str, group: Option<&str>) -> ClientCredential {
        ClientCredential {
            value: value.into(),
            usergroup: group.map(str::to_string),
        }
    }

    #[test]
    fn anyconnect_invocation_keeps_cookie_off_argv() {
        let inv = ClientInvocation::new(
            Path::new("/usr/sbin/openconnect"),
            Protocol::AnyConnect,
            "vpn.example.com",
            "me@example.com",
            true,
            &credential("SECRETCOOKIE", None),
        );
        assert_eq!(
            inv.args,
            vec![
                "--verbose",
                "--protocol=anyconnect",
                "--user=me@example.com",
                "--cookie-on-stdin",
                "--no-dtls",
                "vpn.example.com",
            ]
        );
        assert_eq!(inv.stdin_payload, "SECRETCOOKIE\n");
        assert!(!inv.display().contains("SECRETCOOKIE"));
        assert!(!format!("{:?}", inv).contains("SECRETCOOKIE"));
    }

    #[test]
    fn globalprotect_invocation_carries_usergroup() {
        let inv = ClientInvocation::new(
            Path::new("openconnect"),
            Protocol::GlobalProtect,
            "gp.example.com",
            "me",
            false,
            &credential("PC", Some("portal:prelogin-cookie")),
        );
        assert!(inv.args.contains(&"--protocol=gp".to_string()));
        assert!(inv.args.contains(&"--useragent=PAN GlobalProtect".to_string()));
        assert!(inv.args.contains(&"--os=linux-64".to_string()));
        assert!(inv.args.contains(&"--usergroup=portal:prelogin-cookie".to_string()));
        assert!(inv.args.contains(&"--passwd-on-stdin".to_string()));
        assert!(!inv.args.contains(&"--no-dtls".to_string()));
        assert!(!inv.args.iter().any(|a| a.contains("PC") && !a.starts_with("--")));
    }

    #[test]
    fn output_classification() {
        assert!(is_rejection("Got HTTP/1.1 401 Unauthorized"));
        assert!(is_rejection("Cookie rejected by server"));
        assert!(!is_rejection("Connected as 10.0.0.2, using SSL"));
        assert!(is_connected("Connected as 10.0.0.2, using SSL, with ESP in progress"));
        assert!(is_connected("ESP session established with server"));
        assert_eq!(
            portal_cookie("Set-Cookie: portal-userauthcookie=ABC123;").as_deref(),
            Some("ABC123")
        );
        assert_eq!(portal_cookie("portal-userauthcookie=empty"), None);
    }

    #[test]
    fn output_buffer_is_bounded_and_sticky() {
        let mut out = ClientOutput::default();
        out.push("POST https://vpn.example.com/");
        out.push("Got HTTP/1.1 401 Unauthorized");
        for i in 0..150 {
            out.push(&format!("line {}", i));
        }
        assert_eq!(out.len(), OUTPUT_BUFFER_LINES);
        assert!(out.rejected);
        assert_eq!(out.tail(2), vec!["line 148", "line 149"]);
        match out.exit_error(Some(1)) {
            VpnError::CookieRejected { output } => assert_eq!(output.len(), ERROR_TAIL_LINES),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn early_exit_without_rejection() {
        let mut out = ClientOutput::default();
        out.push("Failed to open tun device");
        assert!(matches!(
            out.exit_error(Some(1)),
            VpnError::ProcessExitedEarly { code: Some(1), .. }
        ));
    }

    #[test]
    fn missing_binary_is_client_not_found() {
        let err = require_openconnect("/nonexistent/openconnect-mssso-test").unwrap_err();
        assert!(matches!(err, VpnError::ClientNotFound { .. }));
    }
}
