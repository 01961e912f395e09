//! Per-connection lifecycle: cache check, login, client start, monitoring
//! and disconnect.
//!
//! The orchestrator is the only place that retries. A `CookieRejected`
//! from the supervisor invalidates the cached session and triggers exactly
//! one fresh login; a second rejection is final.

use crate::auth::{AuthObserver, AuthRequest, AuthState, Authenticator};
use crate::cache::{BrowserProfileCache, SessionCache};
use crate::config::{EffectiveSettings, RuntimeConfig};
use crate::cookies::CookieBundle;
use crate::credentials::{CredentialStore, SecretKind};
use crate::error::VpnError;
use crate::profile::{ConnectionProfile, Protocol};
use crate::supervisor::{ConnectRequest, ConnectResult, DisconnectReport, Supervisor, SupervisorStatus};
use crate::utils::{open_lock, sanitize_name, CancellationToken};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum ConnectionState {
    Idle,
    CacheCheck,
    Authenticating,
    Connecting,
    Connected { pid: u32 },
    Disconnecting,
    Failed(VpnError),
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::CacheCheck => "cache_check",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    State { name: String, state: ConnectionState },
    Auth { name: String, state: AuthState },
    MfaPush { name: String, number: Option<String> },
    MfaComplete { name: String },
    ClientExited { name: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Ignore and drop the cached session.
    pub force_fresh: bool,
    pub visible: bool,
    pub no_dtls: bool,
}

/// How a successful connect came about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReport {
    pub pid: u32,
    pub from_cache: bool,
    pub reauthenticated: bool,
    /// False when the client was only reported started.
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    ClientExited,
    Disconnected,
    Cancelled,
}

struct Slot {
    state: ConnectionState,
    in_flight: bool,
    cancel: Option<CancellationToken>,
    generation: u64,
    last: Option<Result<ConnectReport, VpnError>>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            in_flight: false,
            cancel: None,
            generation: 0,
            last: None,
        }
    }
}

#[derive(Default)]
struct EventHub {
    subscribers: Mutex<Vec<Sender<OrchestratorEvent>>>,
}

impl EventHub {
    fn subscribe(&self) -> Receiver<OrchestratorEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, event: OrchestratorEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct Relay<'a> {
    name: &'a str,
    hub: &'a EventHub,
}

impl AuthObserver for Relay<'_> {
    fn on_state(&self, state: AuthState) {
        self.hub.emit(OrchestratorEvent::Auth {
            name: self.name.to_string(),
            state,
        });
    }

    fn on_mfa_push(&self, number: Option<&str>) {
        self.hub.emit(OrchestratorEvent::MfaPush {
            name: self.name.to_string(),
            number: number.map(str::to_string),
        });
    }

    fn on_mfa_complete(&self) {
        self.hub.emit(OrchestratorEvent::MfaComplete {
            name: self.name.to_string(),
        });
    }
}

pub struct Orchestrator {
    config: RuntimeConfig,
    credentials: CredentialStore,
    cache: SessionCache,
    browser_profiles: BrowserProfileCache,
    authenticator: Box<dyn Authenticator>,
    supervisor: Box<dyn Supervisor>,
    slots: Mutex<HashMap<String, Slot>>,
    settled: Condvar,
    hub: EventHub,
}

impl Orchestrator {
    pub fn new(
        config: RuntimeConfig,
        credentials: CredentialStore,
        authenticator: Box<dyn Authenticator>,
        supervisor: Box<dyn Supervisor>,
    ) -> Self {
        Self {
            cache: SessionCache::new(&config.cache_root),
            browser_profiles: BrowserProfileCache::new(&config.cache_root),
            config,
            credentials,
            authenticator,
            supervisor,
            slots: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            hub: EventHub::default(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn browser_profiles(&self) -> &BrowserProfileCache {
        &self.browser_profiles
    }

    /// A new subscription; every subscriber sees every event from now on.
    pub fn events(&self) -> Receiver<OrchestratorEvent> {
        self.hub.subscribe()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, name: &str, state: ConnectionState) {
        log::debug!("'{}' -> {}", name, state.label());
        self.slots().entry(name.to_string()).or_default().state = state.clone();
        self.hub.emit(OrchestratorEvent::State {
            name: name.to_string(),
            state,
        });
    }

    pub fn state(&self, name: &str) -> ConnectionState {
        self.slots()
            .get(name)
            .map(|s| s.state.clone())
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn status(&self, name: &str) -> SupervisorStatus {
        self.supervisor.status(Some(name))
    }

    /// Longest a second caller waits for an attempt already running in this process.
    fn join_timeout(&self) -> Duration {
        self.config.auth_timeout.max(Duration::from_secs(600))
            + self.config.mfa_timeout
            + self.config.connect_grace
            + Duration::from_secs(30)
    }

    /// Connects the named profile. A concurrent call for the same name joins
    /// the running attempt and returns its outcome.
    pub fn connect(
        &self,
        name: &str,
        options: ConnectOptions,
        cancel: &CancellationToken,
    ) -> Result<ConnectReport, VpnError> {
        {
            let mut slots = self.slots();
            let slot = slots.entry(name.to_string()).or_default();
            if slot.in_flight {
                let generation = slot.generation;
                log::info!("[*] '{}' is already connecting, waiting for that attempt", name);
                let (slots, timeout) = self
                    .settled
                    .wait_timeout_while(slots, self.join_timeout(), |slots| {
                        slots.get(name).is_some_and(|s| s.generation == generation)
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                if timeout.timed_out() {
                    return Err(VpnError::AlreadyInProgress {
                        connection: name.to_string(),
                    });
                }
                return slots
                    .get(name)
                    .and_then(|s| s.last.clone())
                    .unwrap_or(Err(VpnError::Cancelled));
            }
            slot.in_flight = true;
            slot.cancel = Some(cancel.clone());
        }

        let result = self.connect_locked(name, options, cancel);

        match &result {
            Ok(report) => self.set_state(name, ConnectionState::Connected { pid: report.pid }),
            Err(e) => {
                log::error!("[!] '{}' failed: {}", name, e.user_message());
                self.set_state(name, ConnectionState::Failed(e.clone()));
            }
        }
        let mut slots = self.slots();
        let slot = slots.entry(name.to_string()).or_default();
        slot.in_flight = false;
        slot.cancel = None;
        slot.generation += 1;
        slot.last = Some(result.clone());
        drop(slots);
        self.settled.notify_all();
        result
    }

    /// Holds the cross-process lock for `name` around one attempt.
    fn connect_locked(
        &self,
        name: &str,
        options: ConnectOptions,
        cancel: &CancellationToken,
    ) -> Result<ConnectReport, VpnError> {
        let path = self
            .config
            .cache_root
            .join("locks")
            .join(format!("{}.lock", sanitize_name(name)));
        let mut lock = open_lock(&path)?;
        let _guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(VpnError::AlreadyInProgress {
                    connection: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut profile = self.credentials.profile(name)?;
        if options.no_dtls {
            profile.no_dtls = true;
        }
        self.attempt(&profile, options, cancel)
    }

    fn attempt(
        &self,
        profile: &ConnectionProfile,
        options: ConnectOptions,
        cancel: &CancellationToken,
    ) -> Result<ConnectReport, VpnError> {
        let name = profile.name.as_str();
        let settings = self.config.effective(profile);

        let status = self.supervisor.status(Some(name));
        if status.connected && status.connection_name.as_deref().map_or(true, |n| n == name) {
            if let Some(pid) = status.pid {
                log::info!("[*] '{}' is already connected (pid {})", name, pid);
                return Ok(ConnectReport {
                    pid,
                    from_cache: false,
                    reauthenticated: false,
                    confirmed: true,
                });
            }
        }

        if options.force_fresh {
            if let Err(e) = self.cache.invalidate(name) {
                log::warn!("[!] Could not drop cached session: {}", e.user_message());
            }
        }

        self.set_state(name, ConnectionState::CacheCheck);
        let cached = if settings.cookie_cache && !options.force_fresh {
            self.cache
                .load(name)
                .map(|s| s.bundle())
                .filter(|b| b.protocol == profile.protocol && b.is_valid())
        } else {
            None
        };

        let from_cache = cached.is_some();
        let mut bundle = match cached {
            Some(bundle) => {
                log::info!("[*] Using cached session for '{}'", name);
                bundle
            }
            None => self.authenticate(profile, options, settings, options.force_fresh, cancel)?,
        };

        let mut reauthenticated = false;
        loop {
            if cancel.is_cancelled() {
                return Err(VpnError::Cancelled);
            }
            self.set_state(name, ConnectionState::Connecting);
            let mut request = ConnectRequest::new(profile, bundle.clone());
            request.early_started = settings.early_started;

            let (pid, confirmed) = match self.supervisor.connect(&request)? {
                ConnectResult::Connected { pid } | ConnectResult::AlreadyConnected { pid } => (pid, true),
                ConnectResult::Started { pid } => (pid, false),
                ConnectResult::Failed(err) if err.is_retryable_by_reauth() => {
                    log::warn!("[!] Server rejected the session cookie for '{}'", name);
                    if let Err(e) = self.cache.invalidate(name) {
                        log::warn!("[!] Could not drop cached session: {}", e.user_message());
                    }
                    if reauthenticated {
                        return Err(err);
                    }
                    reauthenticated = true;
                    bundle = self.authenticate(profile, options, settings, true, cancel)?;
                    continue;
                }
                ConnectResult::Failed(err) => return Err(err),
            };

            // A cancel that raced the spawn must not leave the client running.
            if cancel.is_cancelled() {
                log::info!("[*] '{}' was cancelled while starting, stopping the client", name);
                if let Err(e) = self.supervisor.disconnect(Some(name), true) {
                    log::debug!("stop after cancel failed: {}", e.user_message());
                }
                return Err(VpnError::Cancelled);
            }

            self.store_portal_cookie(profile, settings);
            return Ok(ConnectReport {
                pid,
                from_cache: from_cache && !reauthenticated,
                reauthenticated,
                confirmed,
            });
        }
    }

    fn authenticate(
        &self,
        profile: &ConnectionProfile,
        options: ConnectOptions,
        settings: EffectiveSettings,
        force_fresh: bool,
        cancel: &CancellationToken,
    ) -> Result<CookieBundle, VpnError> {
        let name = profile.name.as_str();
        let password = self
            .credentials
            .get_secret(name, SecretKind::Password)?
            .ok_or_else(|| VpnError::SecretStoreUnavailable {
                message: format!("no password stored for '{}'", name),
            })?;
        let totp_seed = self.credentials.get_secret(name, SecretKind::TotpSeed)?;

        self.set_state(name, ConnectionState::Authenticating);
        let request = AuthRequest {
            profile: profile.clone(),
            password,
            totp_seed,
            force_fresh,
            visible: options.visible,
            browser_cache: settings.browser_cache,
        };
        let relay = Relay {
            name,
            hub: &self.hub,
        };
        let bundle = self.authenticator.authenticate(&request, &relay, cancel)?;

        if cancel.is_cancelled() {
            return Err(VpnError::Cancelled);
        }
        bundle
            .validate()
            .map_err(|reason| VpnError::AuthRejected { reason })?;

        log::info!("[✓] Authenticated '{}' (cookies: {:?})", name, bundle.names());
        if settings.cookie_cache {
            if let Err(e) = self.cache.save(name, &bundle) {
                log::warn!("[!] Could not cache session: {}", e.user_message());
            }
        }
        Ok(bundle)
    }

    fn store_portal_cookie(&self, profile: &ConnectionProfile, settings: EffectiveSettings) {
        if profile.protocol != Protocol::GlobalProtect || !settings.cookie_cache {
            return;
        }
        if let Some(cookie) = self.supervisor.take_portal_cookie(&profile.name) {
            match self.cache.update_portal_cookie(&profile.name, &cookie) {
                Ok(()) => log::info!("[*] Cached GlobalProtect portal cookie for '{}'", profile.name),
                Err(e) => log::warn!("[!] Could not cache portal cookie: {}", e.user_message()),
            }
        }
    }

    /// Aborts a running login, or disconnects when the client is already up.
    pub fn cancel(&self, name: &str) {
        let (state, token) = {
            let slots = self.slots();
            match slots.get(name) {
                Some(slot) => (slot.state.clone(), slot.cancel.clone()),
                None => return,
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected { .. }) {
            if let Err(e) = self.disconnect(name, true) {
                log::debug!("disconnect on cancel of '{}' failed: {}", name, e.user_message());
            }
        }
    }

    /// Stops the client. Always ends in `Idle`; the cached session is kept.
    pub fn disconnect(&self, name: &str, graceful: bool) -> Result<DisconnectReport, VpnError> {
        self.set_state(name, ConnectionState::Disconnecting);
        let result = self.supervisor.disconnect(Some(name), graceful);
        match &result {
            Ok(report) => log::info!("[✓] {}", report.message),
            Err(e) => log::warn!("[!] Disconnect of '{}' failed: {}", name, e.user_message()),
        }
        self.set_state(name, ConnectionState::Idle);
        result
    }

    /// Polls the client once a second until it exits, the connection is
    /// taken down through [`Orchestrator::disconnect`], or `cancel` fires.
    pub fn watch(&self, name: &str, cancel: &CancellationToken) -> WatchOutcome {
        let settings = self.credentials.profile(name).ok().map(|p| (self.config.effective(&p), p));
        let started = Instant::now();
        loop {
            if !cancel.sleep(WATCH_INTERVAL) {
                return WatchOutcome::Cancelled;
            }
            if !matches!(self.state(name), ConnectionState::Connected { .. }) {
                return WatchOutcome::Disconnected;
            }
            if let Some((effective, profile)) = &settings {
                self.store_portal_cookie(profile, *effective);
            }
            if !self.supervisor.status(Some(name)).connected {
                log::warn!(
                    "[!] VPN client for '{}' exited after {}s",
                    name,
                    started.elapsed().as_secs()
                );
                self.hub.emit(OrchestratorEvent::ClientExited {
                    name: name.to_string(),
                });
                self.set_state(name, ConnectionState::Idle);
                return WatchOutcome::ClientExited;
            }
        }
    }

    /// Removes the profile, its secrets, the cached session and the browser profile.
    pub fn delete_connection(&self, name: &str) -> Result<(), VpnError> {
        self.credentials.delete(name)?;
        self.cache.invalidate(name)?;
        self.browser_profiles.wipe(name)?;
        Ok(())
    }
}
