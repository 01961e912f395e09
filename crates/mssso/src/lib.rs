//! # Microsoft SSO VPN session engine
//!
//! This library logs in to Microsoft-SSO protected Cisco AnyConnect and
//! GlobalProtect gateways with a headless browser, caches the resulting
//! session cookies, and supervises the `openconnect` client that uses them.

#[cfg(not(unix))]
compile_error!("mssso supports Linux and macOS only");

pub mod auth;
pub mod browser;
pub mod cache;
pub mod config;
pub mod cookies;
pub mod credentials;
pub mod error;
pub mod logger;
pub mod openconnect;
pub mod orchestrator;
pub mod profile;
pub mod rpc;
pub mod supervisor;
pub mod totp;
pub mod utils;

// Re-export commonly used items
pub use auth::{AuthObserver, Authenticator, BrowserAuthenticator};
pub use config::RuntimeConfig;
pub use credentials::{CredentialStore, SecretKind};
pub use error::VpnError;
pub use logger::init_logger;
pub use orchestrator::{ConnectOptions, ConnectionState, Orchestrator, OrchestratorEvent};
pub use profile::{ConnectionProfile, Protocol};
pub use supervisor::{select_supervisor, LocalSupervisor, Supervisor};
pub use utils::CancellationToken;
