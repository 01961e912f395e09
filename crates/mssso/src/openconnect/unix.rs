//! Unix-specific OpenConnect process management.

use super::ClientInvocation;
use crate::error::VpnError;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use which::which;

/// Runs under the escalation wrapper: opens the cookie file, deletes it, then
/// becomes the client with the open file as standard input.
const HANDOFF_SHIM: &str = r#"exec 3<"$0" && rm -f "$0" && exec "$@" <&3 3<&-"#;

// ── Private helpers ───────────────────────────────────────────────────────────

/// Returns the basename of a tool path (e.g. "/usr/bin/sudo" → "sudo").
fn tool_base_name(tool: &str) -> &str {
    Path::new(tool)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(tool)
}

/// Runs `tool` (looked up via PATH) with `args`, suppressing output.
/// Returns `true` if the command exits successfully.
fn run_command_silent(tool: &str, args: &[&str]) -> bool {
    which(tool).ok().is_some_and(|p| {
        Command::new(p)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

fn pgrep(args: &[&str]) -> Vec<u32> {
    let Ok(pgrep) = which("pgrep") else {
        return Vec::new();
    };
    let Ok(output) = Command::new(pgrep).args(args).output() else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

fn io_error(context: &str, e: std::io::Error) -> VpnError {
    VpnError::Io {
        message: format!("{}: {}", context, e),
    }
}

// ── Escalation ────────────────────────────────────────────────────────────────

/// A privilege-elevation wrapper the client is started under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub tool: String,
    /// `sudo`/`doas` pass our stdin through to the client; `pkexec` does not.
    pub forwards_stdin: bool,
}

impl Escalation {
    pub fn new(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            forwards_stdin: tool_base_name(tool) != "pkexec",
        }
    }

    fn is_sudo(&self) -> bool {
        matches!(tool_base_name(&self.tool), "sudo" | "sudo-rs")
    }

    /// Arguments that make the tool fail instead of prompting.
    fn non_interactive(&self) -> &'static [&'static str] {
        match tool_base_name(&self.tool) {
            "sudo" | "sudo-rs" | "doas" => &["-n"],
            _ => &[],
        }
    }

    /// Sends `sig` to `pid` through the wrapper. Returns `true` on success.
    fn kill(&self, pid: u32, sig: Signal) -> bool {
        let pid_str = pid.to_string();
        let name = sig.as_str().trim_start_matches("SIG");
        let mut args: Vec<&str> = self.non_interactive().to_vec();
        args.extend(["kill", "-s", name, &pid_str]);
        run_command_silent(&self.tool, &args)
    }
}

/// Searches for an available askpass program on the system.
pub fn find_askpass() -> Option<PathBuf> {
    if let Ok(askpass) = std::env::var("SUDO_ASKPASS") {
        let p = Path::new(&askpass);
        if p.is_file() {
            return Some(p.to_path_buf());
        }
    }

    let programs = [
        "ssh-askpass",
        "ksshaskpass",
        "lxqt-openssh-askpass",
        "x11-ssh-askpass",
        "gnome-ssh-askpass",
    ];
    programs.iter().find_map(|&prog| which(prog).ok())
}

/// Resolves which escalation tool will be used.
/// A custom tool wins when installed, then `sudo`, `sudo-rs`, `doas`, `pkexec`.
pub fn resolve_escalation(custom: Option<&str>) -> Option<Escalation> {
    let mut tools: Vec<&str> = if cfg!(target_os = "macos") {
        vec!["sudo", "sudo-rs", "doas"]
    } else {
        vec!["sudo", "sudo-rs", "doas", "pkexec"]
    };

    if let Some(custom) = custom {
        if which(custom).is_ok() {
            tools.insert(0, custom);
        } else {
            log::info!("Custom escalation tool '{}' not found, falling back to defaults.", custom);
        }
    }

    tools
        .iter()
        .find(|&&t| which(t).is_ok())
        .map(|t| Escalation::new(t))
}

// ── Spawning ──────────────────────────────────────────────────────────────────

/// A started client plus the hand-off file, if one was written.
pub struct SpawnedClient {
    pub child: Child,
    /// Removed by the shim once read; callers delete it if the shim never ran.
    pub handoff: Option<PathBuf>,
}

fn write_cookie_file(payload: &str) -> Result<PathBuf, VpnError> {
    let mut file = tempfile::Builder::new()
        .prefix("mssso-cookie-")
        .tempfile()
        .map_err(|e| io_error("cannot create cookie file", e))?;
    crate::utils::set_owner_only(file.path()).map_err(|e| io_error("cannot restrict cookie file", e))?;
    file.write_all(payload.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| io_error("cannot write cookie file", e))?;
    let (_, path) = file
        .keep()
        .map_err(|e| io_error("cannot keep cookie file", e.error))?;
    Ok(path)
}

/// Starts the client, directly or under `escalation`, with piped output.
///
/// The cookie goes to the client's stdin. When the wrapper does not forward
/// stdin it is handed over through an owner-only temp file instead.
pub fn spawn_client(
    invocation: &ClientInvocation,
    escalation: Option<&Escalation>,
) -> Result<SpawnedClient, VpnError> {
    let mut handoff = None;
    let mut cmd = match escalation {
        None => {
            let mut cmd = Command::new(&invocation.program);
            cmd.args(&invocation.args).stdin(Stdio::piped());
            cmd
        }
        Some(esc) if esc.forwards_stdin => {
            let mut cmd = Command::new(&esc.tool);
            if esc.is_sudo() {
                if let Some(askpass) = find_askpass() {
                    log::info!("Using askpass program: {:?}", askpass);
                    cmd.env("SUDO_ASKPASS", &askpass).arg("-A");
                }
            }
            cmd.arg(&invocation.program)
                .args(&invocation.args)
                .stdin(Stdio::piped());
            cmd
        }
        Some(esc) => {
            let path = write_cookie_file(&invocation.stdin_payload)?;
            log::debug!("Handing cookie to {} via {:?}", esc.tool, path);
            let mut cmd = Command::new(&esc.tool);
            cmd.arg("/bin/sh")
                .arg("-c")
                .arg(HANDOFF_SHIM)
                .arg(&path)
                .arg(&invocation.program)
                .args(&invocation.args)
                .stdin(Stdio::null());
            handoff = Some(path);
            cmd
        }
    };
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            if let Some(path) = &handoff {
                let _ = std::fs::remove_file(path);
            }
            return Err(if e.kind() == std::io::ErrorKind::NotFound {
                VpnError::ClientNotFound {
                    searched: escalation
                        .map(|esc| esc.tool.clone())
                        .unwrap_or_else(|| invocation.program.display().to_string()),
                }
            } else {
                io_error("cannot start openconnect", e)
            });
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(invocation.stdin_payload.as_bytes()) {
            log::warn!("[!] Could not write cookie to openconnect: {}", e);
        }
    }

    Ok(SpawnedClient { child, handoff })
}

// ── Signals ───────────────────────────────────────────────────────────────────

/// `root` and all its descendants, deepest first.
pub fn process_tree(root: u32) -> Vec<u32> {
    let mut out = Vec::new();
    collect_tree(root, &mut out, 0);
    out
}

fn collect_tree(pid: u32, out: &mut Vec<u32>, depth: usize) {
    if depth < 8 {
        for child in pgrep(&["-P", &pid.to_string()]) {
            collect_tree(child, out, depth + 1);
        }
    }
    out.push(pid);
}

pub fn is_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(e) => e == Errno::EPERM,
    }
}

/// Signals a process tree, going through `escalation` for processes we may
/// not signal ourselves (root-owned clients under `pkexec`).
pub fn signal_tree(root: u32, sig: Signal, escalation: Option<&Escalation>) {
    for pid in process_tree(root) {
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => match escalation {
                Some(esc) => {
                    if !esc.kill(pid, sig) {
                        log::warn!("[!] {} could not signal pid {}", esc.tool, pid);
                    }
                }
                None => log::warn!("[!] Not permitted to signal pid {}", pid),
            },
            Err(e) => log::debug!("kill({}, {}) failed: {}", pid, sig, e),
        }
    }
}

/// Stops every `openconnect` on the system, for callers that did not start it.
///
/// Returns the number of client processes found.
pub fn terminate_running(
    graceful: bool,
    escalation: Option<&Escalation>,
    timeout: Duration,
) -> Result<usize, VpnError> {
    let pids = pgrep(&["-x", "openconnect"]);
    if pids.is_empty() {
        log::info!("No running openconnect process found");
        return Ok(0);
    }

    let sig = if graceful { Signal::SIGTERM } else { Signal::SIGKILL };
    log::info!("[*] Sending {} to openconnect ({:?})", sig, pids);
    for &pid in &pids {
        signal_tree(pid, sig, escalation);
    }

    let deadline = Instant::now() + timeout;
    while pids.iter().any(|&p| is_alive(p)) {
        if Instant::now() >= deadline {
            log::warn!("[!] openconnect still running, sending SIGKILL");
            for &pid in pids.iter().filter(|&&p| is_alive(p)) {
                signal_tree(pid, Signal::SIGKILL, escalation);
            }
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    if graceful {
        cleanup_dns(escalation);
    }
    Ok(pids.len())
}

// ── DNS ───────────────────────────────────────────────────────────────────────

fn tun_devices() -> Vec<String> {
    let mut devs: Vec<String> = std::fs::read_dir("/sys/class/net")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| name.starts_with("tun"))
                .collect()
        })
        .unwrap_or_default();
    if devs.is_empty() {
        devs.push("tun0".to_string());
    }
    devs
}

/// Best-effort DNS revert for tunnel interfaces after a failure or disconnect.
///
/// openconnect's vpnc-script normally does this itself; a killed client can
/// leave resolver entries behind.
pub fn cleanup_dns(escalation: Option<&Escalation>) {
    if cfg!(target_os = "macos") {
        return;
    }
    let elevated = crate::utils::is_root();
    for dev in tun_devices() {
        for cmd in [["resolvectl", "revert"], ["resolvconf", "-d"]] {
            let args = [cmd[1], dev.as_str()];
            let ok = if elevated {
                run_command_silent(cmd[0], &args)
            } else {
                match escalation {
                    // pkexec would prompt again just for cleanup.
                    Some(esc) if !esc.non_interactive().is_empty() => {
                        let mut full: Vec<&str> = esc.non_interactive().to_vec();
                        full.push(cmd[0]);
                        full.extend(args);
                        run_command_silent(&esc.tool, &full)
                    }
                    _ => false,
                }
            };
            log::debug!("{} {} {}: {}", cmd[0], cmd[1], dev, if ok { "ok" } else { "skipped" });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn shell(script: &str, payload: &str) -> ClientInvocation {
        ClientInvocation {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            stdin_payload: payload.into(),
        }
    }

    fn stdout_of(mut spawned: SpawnedClient) -> String {
        let mut out = String::new();
        spawned
            .child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        spawned.child.wait().unwrap();
        out
    }

    #[test]
    fn escalation_capabilities() {
        assert!(Escalation::new("/usr/bin/sudo").forwards_stdin);
        assert!(Escalation::new("doas").forwards_stdin);
        assert!(!Escalation::new("/usr/bin/pkexec").forwards_stdin);
        assert_eq!(Escalation::new("doas").non_interactive(), &["-n"]);
        assert!(Escalation::new("pkexec").non_interactive().is_empty());
    }

    #[test]
    fn unknown_custom_tool_is_ignored() {
        let esc = resolve_escalation(Some("definitely-not-a-real-escalation-tool"));
        if let Some(esc) = esc {
            assert_ne!(esc.tool, "definitely-not-a-real-escalation-tool");
        }
    }

    #[test]
    fn cookie_reaches_client_stdin() {
        let spawned = spawn_client(&shell("read c; echo \"got:$c\"", "COOKIE123\n"), None).unwrap();
        assert!(spawned.handoff.is_none());
        assert_eq!(stdout_of(spawned).trim(), "got:COOKIE123");
    }

    #[test]
    fn cookie_file_handoff_for_wrappers_without_stdin() {
        // `env` stands in for a wrapper that runs its arguments without forwarding stdin.
        let wrapper = Escalation {
            tool: "env".into(),
            forwards_stdin: false,
        };
        let spawned = spawn_client(&shell("read c; echo \"got:$c\"", "HANDOFF\n"), Some(&wrapper)).unwrap();
        let path = spawned.handoff.clone().unwrap();
        assert_eq!(stdout_of(spawned).trim(), "got:HANDOFF");
        assert!(!path.exists());
    }

    #[test]
    fn missing_program_is_client_not_found() {
        let inv = ClientInvocation {
            program: PathBuf::from("/nonexistent/openconnect"),
            args: vec![],
            stdin_payload: "x\n".into(),
        };
        assert!(matches!(
            spawn_client(&inv, None),
            Err(VpnError::ClientNotFound { .. })
        ));
    }

    #[test]
    fn signal_tree_reaches_descendants() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let tree = process_tree(child.id());
        assert_eq!(tree.last(), Some(&child.id()));
        if which("pgrep").is_ok() {
            assert!(tree.len() >= 3, "expected both sleeps in {:?}", tree);
        }

        signal_tree(child.id(), Signal::SIGKILL, None);
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_alive(child.id()));
    }
}
