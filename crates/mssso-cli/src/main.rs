//! # ms-sso-openconnect
//!
//! Logs in to a Microsoft SSO protected VPN portal with a headless browser and
//! hands the resulting session cookie to `openconnect`.

mod args;
mod progress;
mod setup;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use mssso::cache::{BrowserProfileCache, SessionCache};
use mssso::openconnect::{resolve_escalation, terminate_running};
use mssso::orchestrator::{ConnectOptions, WatchOutcome};
use mssso::supervisor::{DaemonSupervisor, Supervisor};
use mssso::{
    init_logger, rpc, select_supervisor, BrowserAuthenticator, CancellationToken, CredentialStore,
    Orchestrator, RuntimeConfig, VpnError,
};
use std::process::ExitCode;
use std::time::Instant;

fn report(err: &VpnError) -> ExitCode {
    error!("{}", err.full_message());
    ExitCode::FAILURE
}

fn disconnect(config: &RuntimeConfig, graceful: bool) -> Result<(), VpnError> {
    if rpc::ping(&config.daemon_socket).is_ok() {
        let result = DaemonSupervisor::new(&config.daemon_socket).disconnect(None, graceful)?;
        info!("{}", result.message);
        return Ok(());
    }
    let escalation = if mssso::utils::is_root() {
        None
    } else {
        resolve_escalation(config.escalation_tool.as_deref())
    };
    let stopped = terminate_running(graceful, escalation.as_ref(), config.disconnect_timeout)?;
    if stopped > 0 {
        info!("[✓] Stopped {} openconnect process(es)", stopped);
    }
    Ok(())
}

fn clean(config: &RuntimeConfig, args: &Args) -> Result<(), VpnError> {
    let name = args.connection.as_deref();
    if args.clean_browser {
        let profiles = BrowserProfileCache::new(&config.cache_root);
        match name {
            Some(n) => {
                profiles.wipe(n)?;
            }
            None => profiles.wipe_all()?,
        }
        info!("Browser session information removed.");
    }
    if args.clear_cache {
        let cache = SessionCache::new(&config.cache_root);
        match name {
            Some(n) => {
                cache.invalidate(n)?;
            }
            None => {
                let removed = cache.clear_all()?;
                info!("Removed {} cached session(s).", removed);
            }
        }
    }
    Ok(())
}

fn connect(config: RuntimeConfig, credentials: CredentialStore, args: &Args) -> ExitCode {
    let name = match setup::pick(&credentials, args.connection.as_deref()) {
        Ok(name) => name,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let supervisor = select_supervisor(&config);
    let authenticator = Box::new(BrowserAuthenticator::new(&config));
    let orchestrator = Orchestrator::new(config, credentials, authenticator, supervisor);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            warn!("[!] Could not install Ctrl+C handler: {}", e);
        }
    }

    let bar = progress::spinner();
    let follower = progress::follow(orchestrator.events(), bar.clone());
    let options = ConnectOptions {
        force_fresh: args.no_cache,
        visible: args.visible,
        no_dtls: args.no_dtls,
    };
    let result = orchestrator.connect(&name, options, &cancel);
    bar.finish_and_clear();
    let _ = follower.join();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => return report(&e),
    };
    info!(
        "[✓] Connected to '{}' (pid {}{})",
        name,
        summary.pid,
        if summary.from_cache { ", cached session" } else { "" }
    );
    info!("Press Ctrl+C to disconnect.");

    let since = Instant::now();
    let outcome = orchestrator.watch(&name, &cancel);
    let uptime = progress::format_duration(since.elapsed());
    match outcome {
        WatchOutcome::Cancelled => {
            info!("[*] Disconnecting after {}", uptime);
            match orchestrator.disconnect(&name, true) {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => report(&e),
            }
        }
        WatchOutcome::Disconnected => ExitCode::SUCCESS,
        WatchOutcome::ClientExited => {
            error!("[!] openconnect exited after {}", uptime);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.debug {
        log::LevelFilter::Debug.max(args.level.into())
    } else {
        args.level.into()
    };
    init_logger(level);

    let mut config = RuntimeConfig::from_env();
    if args.debug {
        config.debug = true;
    }
    if let Err(e) = config.ensure_cache_root() {
        error!("Cannot create cache directory {:?}: {}", config.cache_root, e);
        return ExitCode::FAILURE;
    }
    log::debug!("Runtime config: {:?}", config);

    if args.disconnect || args.force_disconnect {
        return match disconnect(&config, args.disconnect) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => report(&e),
        };
    }

    if args.clean_browser || args.clear_cache {
        return match clean(&config, &args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => report(&e),
        };
    }

    let credentials = CredentialStore::system();

    if args.list {
        return match setup::list(&credentials) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    if let Some(name) = &args.delete {
        let authenticator = Box::new(BrowserAuthenticator::new(&config));
        let supervisor = select_supervisor(&config);
        let orchestrator = Orchestrator::new(config, credentials, authenticator, supervisor);
        return match orchestrator.delete_connection(name) {
            Ok(()) => {
                info!("[✓] Deleted '{}'", name);
                ExitCode::SUCCESS
            }
            Err(e) => report(&e),
        };
    }

    if args.setup {
        return match setup::run(&credentials) {
            Ok(name) => {
                info!("Connect with: ms-sso-openconnect {}", name);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Setup failed: {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    connect(config, credentials, &args)
}
