//! # ms-sso-openconnect-daemon
//!
//! Runs as root and supervises `openconnect` for unprivileged callers, who
//! talk to it over a local socket with line-delimited JSON-RPC.
//!
//! Callers never send a program path or arguments: only an address, a
//! protocol and cookies, all validated before anything is spawned.

use anyhow::{bail, Context, Result};
use clap::Parser;
use interprocess::local_socket::{prelude::*, GenericFilePath, ListenerOptions};
use log::{error, info, warn, LevelFilter};
use mssso::config::{CacheNamespace, RuntimeConfig};
use mssso::supervisor::{LocalSupervisor, Supervisor};
use mssso::{init_logger, rpc};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

/// Privileged openconnect supervisor for ms-sso-openconnect.
#[derive(Parser, Debug)]
#[command(name = "ms-sso-openconnect-daemon", version, about)]
struct Args {
    /// Control socket path
    #[arg(long, default_value_os_t = rpc::default_socket_path())]
    socket: PathBuf,

    /// Log verbosity (off, error, warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "info")]
    level: LevelFilter,
}

fn pid_file(socket: &Path) -> PathBuf {
    socket.with_file_name("daemon.pid")
}

fn remove_runtime_files(socket: &Path) {
    let _ = fs::remove_file(socket);
    let _ = fs::remove_file(pid_file(socket));
}

/// Binds the socket, replacing a stale one left by a crashed daemon.
fn bind(socket: &Path) -> Result<LocalSocketListener> {
    if socket.exists() {
        if rpc::ping(socket).is_ok() {
            bail!("another daemon is already listening on {}", socket.display());
        }
        warn!("[!] Removing stale socket {}", socket.display());
        fs::remove_file(socket).with_context(|| format!("remove {}", socket.display()))?;
    }
    if let Some(dir) = socket.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
    }

    let name = socket
        .to_fs_name::<GenericFilePath>()
        .context("socket path")?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_sync()
        .with_context(|| format!("listen on {}", socket.display()))?;
    // Any local user may connect; requests are validated per call.
    fs::set_permissions(socket, fs::Permissions::from_mode(0o666))
        .with_context(|| format!("chmod {}", socket.display()))?;

    fs::write(pid_file(socket), format!("{}\n", std::process::id()))
        .context("write pid file")?;
    Ok(listener)
}

fn run(args: Args) -> Result<()> {
    if !mssso::utils::is_root() {
        bail!("the daemon must run as root");
    }

    let mut config = RuntimeConfig::from_lookup(|key| std::env::var(key).ok(), CacheNamespace::System);
    config.ensure_cache_root().context("create cache root")?;
    let supervisor = Arc::new(LocalSupervisor::from_config(&config, None));

    let listener = bind(&args.socket)?;
    info!(
        "[*] ms-sso-openconnect-daemon {} listening on {}",
        rpc::VERSION,
        args.socket.display()
    );

    {
        let supervisor = Arc::clone(&supervisor);
        let socket = args.socket.clone();
        ctrlc::set_handler(move || {
            info!("[*] Shutting down");
            if let Err(e) = supervisor.disconnect(None, true) {
                warn!("[!] Disconnect on shutdown failed: {}", e.user_message());
            }
            remove_runtime_files(&socket);
            std::process::exit(0);
        })
        .context("install signal handler")?;
    }

    loop {
        match listener.accept() {
            Ok(stream) => {
                let supervisor = Arc::clone(&supervisor);
                thread::spawn(move || {
                    if let Err(e) = rpc::serve_stream(&*supervisor, stream) {
                        log::debug!("client connection ended: {}", e);
                    }
                });
            }
            Err(e) => error!("Accept error: {}", e),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.level);
    let socket = args.socket.clone();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            if !socket.exists() || rpc::ping(&socket).is_err() {
                remove_runtime_files(&socket);
            }
            ExitCode::FAILURE
        }
    }
}
