//! Browser-driven Microsoft SSO login producing VPN session cookies.

pub mod chrome;
pub mod engine;
pub mod flow;
pub mod page;
pub mod portal;

pub use engine::EngineSettings;
pub use flow::AuthState;
pub use portal::Gateway;

use crate::browser::BrowserSession;
use crate::cache::BrowserProfileCache;
use crate::config::RuntimeConfig;
use crate::cookies::CookieBundle;
use crate::error::VpnError;
use crate::profile::ConnectionProfile;
use crate::utils::CancellationToken;
use std::path::PathBuf;
use std::time::Duration;

/// Inputs for one login attempt.
#[derive(Clone)]
pub struct AuthRequest {
    pub profile: ConnectionProfile,
    pub password: String,
    pub totp_seed: Option<String>,
    /// Set after the VPN client rejected a cached cookie.
    pub force_fresh: bool,
    pub visible: bool,
    pub browser_cache: bool,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("profile", &self.profile.name)
            .field("totp_seed", &self.totp_seed.is_some())
            .field("force_fresh", &self.force_fresh)
            .field("visible", &self.visible)
            .field("browser_cache", &self.browser_cache)
            .finish_non_exhaustive()
    }
}

/// Progress callbacks from the login flow. All methods default to no-ops.
pub trait AuthObserver: Send + Sync {
    fn on_state(&self, _state: AuthState) {}
    /// The user must approve a push on their device, optionally typing `number`.
    fn on_mfa_push(&self, _number: Option<&str>) {}
    fn on_mfa_complete(&self) {}
}

pub struct NoopObserver;

impl AuthObserver for NoopObserver {}

/// Produces a validated cookie bundle for a profile.
pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        request: &AuthRequest,
        observer: &dyn AuthObserver,
        cancel: &CancellationToken,
    ) -> Result<CookieBundle, VpnError>;
}

/// Runs the login in a real Chrome instance.
pub struct BrowserAuthenticator {
    profiles: BrowserProfileCache,
    chrome_path: Option<PathBuf>,
    auth_timeout: Duration,
    mfa_timeout: Duration,
    debug_dir: Option<PathBuf>,
}

impl BrowserAuthenticator {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            profiles: BrowserProfileCache::new(&config.cache_root),
            chrome_path: config.chrome_path.clone(),
            auth_timeout: config.auth_timeout,
            mfa_timeout: config.mfa_timeout,
            debug_dir: config.debug.then(|| config.cache_root.join("debug")),
        }
    }
}

impl Authenticator for BrowserAuthenticator {
    fn authenticate(
        &self,
        request: &AuthRequest,
        observer: &dyn AuthObserver,
        cancel: &CancellationToken,
    ) -> Result<CookieBundle, VpnError> {
        let profile = &request.profile;
        let gateway = Gateway::parse(&profile.address).map_err(|e| VpnError::InvalidProfile {
            reason: format!("{:#}", e),
        })?;

        let dir = self
            .profiles
            .acquire(&profile.name, request.browser_cache)
            .map_err(|e| VpnError::Browser {
                message: format!("cannot prepare browser profile: {}", e),
            })?;
        log::info!(
            "[*] Starting browser ({}, {} profile)",
            if request.visible { "visible" } else { "headless" },
            if dir.is_persistent() { "cached" } else { "temporary" }
        );

        // Closed on every path when `session` drops.
        let session = BrowserSession::open(dir, request.visible, self.chrome_path.as_deref())
            .map_err(|e| VpnError::Browser {
                message: format!("{:#}", e),
            })?;
        log::debug!("browser pid: {:?}", session.pid());
        let page = chrome::ChromePage::new(session.tab(), &profile.username);

        let settings = EngineSettings {
            protocol: profile.protocol,
            gateway,
            username: profile.username.clone(),
            password: request.password.clone(),
            totp_seed: request.totp_seed.clone(),
            force_fresh: request.force_fresh,
            // A visible window may be driven by hand, so it gets the longer budget.
            auth_timeout: if request.visible {
                self.auth_timeout.max(Duration::from_secs(600))
            } else {
                self.auth_timeout
            },
            mfa_timeout: self.mfa_timeout,
            poll_interval: engine::POLL_INTERVAL,
            debug_dir: self.debug_dir.clone(),
        };
        engine::run(&page, &settings, observer, cancel)
    }
}
