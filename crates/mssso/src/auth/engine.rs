//! Drives an [`AuthPage`] through the login flow until a usable session
//! cookie appears on the VPN host.

use super::flow::{classify, next_step, Action, AuthState, FlowMemo, PageView};
use super::page::{AuthPage, Control, Field, PageProbe};
use super::portal::{resolve_target, Gateway, PortalTarget};
use super::AuthObserver;
use crate::cookies::{collect_vpn_cookies, merge_page_markers, parse_page_markers, BrowserCookie, CookieBundle};
use crate::error::VpnError;
use crate::profile::Protocol;
use crate::totp;
use crate::utils::{unix_now, CancellationToken};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Everything one authentication attempt needs.
pub struct EngineSettings {
    pub protocol: Protocol,
    pub gateway: Gateway,
    pub username: String,
    pub password: String,
    pub totp_seed: Option<String>,
    /// Ignore session cookies already present in the browser profile.
    pub force_fresh: bool,
    pub auth_timeout: Duration,
    pub mfa_timeout: Duration,
    pub poll_interval: Duration,
    /// Where to drop a screenshot when the flow times out.
    pub debug_dir: Option<PathBuf>,
}

/// Runs the flow. The caller owns the browser and closes it afterwards.
pub fn run(
    page: &dyn AuthPage,
    settings: &EngineSettings,
    observer: &dyn AuthObserver,
    cancel: &CancellationToken,
) -> Result<CookieBundle, VpnError> {
    Driver {
        page,
        settings,
        observer,
        cancel,
        state: AuthState::PortalLoad,
        memo: FlowMemo::new(settings.totp_seed.is_some()),
        target: None,
        stale: HashMap::new(),
        last_url: String::new(),
        mfa_started: None,
        announced_push: None,
    }
    .run()
}

fn browser_error(context: &str, e: anyhow::Error) -> VpnError {
    VpnError::Browser {
        message: format!("{}: {}", context, e),
    }
}

struct Driver<'a> {
    page: &'a dyn AuthPage,
    settings: &'a EngineSettings,
    observer: &'a dyn AuthObserver,
    cancel: &'a CancellationToken,
    state: AuthState,
    memo: FlowMemo,
    target: Option<PortalTarget>,
    /// Cookie values seen before the attempt started; never counted as a new session.
    stale: HashMap<String, String>,
    last_url: String,
    mfa_started: Option<Instant>,
    announced_push: Option<Option<String>>,
}

impl Driver<'_> {
    fn run(mut self) -> Result<CookieBundle, VpnError> {
        let started = Instant::now();

        if self.settings.force_fresh {
            let jar = self
                .page
                .cookies()
                .map_err(|e| browser_error("Browser connection lost", e))?;
            self.stale = jar.into_iter().map(|c| (c.name, c.value)).collect();
            log::debug!("Ignoring {} pre-existing browser cookies", self.stale.len());
        }

        loop {
            if self.cancel.is_cancelled() {
                log::info!("[!] Cancellation requested, closing browser.");
                return Err(VpnError::Cancelled);
            }
            if started.elapsed() >= self.settings.auth_timeout {
                return Err(self.timeout());
            }
            if let Some(since) = self.mfa_started {
                if since.elapsed() >= self.settings.mfa_timeout {
                    log::warn!("[!] MFA approval not received in time");
                    return Err(self.timeout());
                }
            }

            // The cookie read doubles as a heartbeat: failure means the browser is gone.
            let jar = self.page.cookies().map_err(|e| {
                log::warn!("[!] Browser heartbeat lost (manual close?): {}", e);
                browser_error("Browser connection lost", e)
            })?;

            let (view, ready) = if self.state == AuthState::PortalLoad {
                (PageView::Loading, None)
            } else {
                self.observe(&jar)
            };

            let step = next_step(self.state, &view, &self.memo);
            if step.action != Action::Wait {
                log::debug!("{} / {:?} -> {:?}", self.state, view, step.action);
            }
            if let Some(bundle) = self.perform(&step.action, ready)? {
                return Ok(bundle);
            }
            if self.mfa_started.is_some()
                && !matches!(step.action, Action::Wait | Action::AwaitApproval { .. })
            {
                self.finish_mfa();
            }
            self.memo.record(&step.action);
            self.enter(step.next);

            self.cancel.sleep(self.settings.poll_interval);
        }
    }

    fn enter(&mut self, next: AuthState) {
        if next != self.state {
            log::debug!("auth state: {} -> {}", self.state, next);
            self.state = next;
            self.observer.on_state(next);
        }
    }

    fn observe(&mut self, jar: &[BrowserCookie]) -> (PageView, Option<CookieBundle>) {
        let url = self.page.current_url();
        if url != self.last_url {
            log::info!("[*] Page: {}", url);
            self.memo.page_changed();
            self.last_url = url.clone();
        }

        let ready = self.session_bundle(&url, jar);
        let probe = if ready.is_some() {
            PageProbe::default()
        } else {
            self.page.probe().unwrap_or_else(|e| {
                log::debug!("Page probe failed: {}", e);
                PageProbe::default()
            })
        };
        (classify(&probe, ready.is_some()), ready)
    }

    /// A validated bundle, if the browser is on the VPN host and holds fresh
    /// session artefacts.
    fn session_bundle(&self, url: &str, jar: &[BrowserCookie]) -> Option<CookieBundle> {
        let gateway_ip = self.target.as_ref().and_then(|t| t.gateway_ip.as_deref());
        if !self.settings.gateway.owns_url(url, gateway_ip) {
            return None;
        }

        let fresh: Vec<BrowserCookie> = jar
            .iter()
            .filter(|c| self.stale.get(&c.name) != Some(&c.value))
            .cloned()
            .collect();
        let mut bundle = collect_vpn_cookies(
            self.settings.protocol,
            &self.settings.gateway.host,
            gateway_ip,
            &fresh,
        );
        if let Ok(source) = self.page.page_source() {
            let markers = parse_page_markers(&source);
            merge_page_markers(&mut bundle, &markers);
        }
        if !bundle.is_valid() {
            return None;
        }

        if let Some(cookie) = self.target.as_ref().and_then(|t| t.prelogin_cookie.as_deref()) {
            if bundle.get("prelogin-cookie").is_none() {
                bundle.insert("prelogin-cookie", cookie);
            }
        }
        Some(bundle)
    }

    fn perform(
        &mut self,
        action: &Action,
        ready: Option<CookieBundle>,
    ) -> Result<Option<CookieBundle>, VpnError> {
        match action {
            Action::OpenPortal => return self.open_portal(),
            Action::Wait => {}
            Action::PickAccount => {
                log::info!("[*] Picking saved account tile");
                self.click(Control::MatchingAccount);
            }
            Action::UseAnotherAccount => {
                log::info!("[*] Choosing 'use another account'");
                self.click(Control::OtherAccount);
            }
            Action::EnterUsername => {
                log::info!("[*] Entering username");
                self.fill(Field::Username, &self.settings.username);
                self.click(Control::Submit);
            }
            Action::EnterPassword => {
                log::info!("[*] Entering password");
                self.fill(Field::Password, &self.settings.password);
                self.click(Control::Submit);
            }
            Action::EnterCredentials => {
                log::info!("[*] Entering username and password");
                self.fill(Field::Username, &self.settings.username);
                self.fill(Field::Password, &self.settings.password);
                self.click(Control::Submit);
            }
            Action::SwitchToPassword => {
                log::info!("[*] Switching to password sign-in");
                self.click(Control::UsePassword);
            }
            Action::ChooseOtherWay => {
                log::info!("[*] Choosing another sign-in method");
                self.click(Control::OtherWay);
            }
            Action::ChooseAppCode => {
                log::info!("[*] Choosing verification code");
                self.click(Control::AppCode);
            }
            Action::ChooseAppNotification => {
                log::info!("[*] Choosing app notification");
                self.click(Control::AppNotification);
            }
            Action::EnterTotp => self.enter_totp()?,
            Action::AwaitApproval { number } => self.await_approval(number.as_deref()),
            Action::AcceptStaySignedIn => {
                log::info!("[*] Accepting 'stay signed in'");
                self.click(Control::StaySignedIn);
            }
            Action::Reload => {
                log::warn!("[!] Transient portal error, reloading once");
                if let Err(e) = self.page.reload() {
                    log::warn!("[!] Reload failed: {}", e);
                }
            }
            Action::ExtractCookies => {
                if let Some(bundle) = ready {
                    self.finish_mfa();
                    log::info!("[✓] Session cookies found: {}", bundle.names().join(", "));
                    return Ok(Some(bundle));
                }
            }
            Action::Fail(reason) => {
                log::warn!("[!] Portal error: {}", reason);
                return Err(VpnError::AuthRejected {
                    reason: reason.clone(),
                });
            }
        }
        Ok(None)
    }

    fn open_portal(&mut self) -> Result<Option<CookieBundle>, VpnError> {
        let target = resolve_target(self.page, &self.settings.gateway, self.settings.protocol);

        if !target.needs_login {
            if let Some(cookie) = target.prelogin_cookie.as_deref() {
                log::info!("[✓] Portal issued a prelogin cookie without SAML");
                let mut bundle = CookieBundle::new(self.settings.protocol).with_cookie("prelogin-cookie", cookie);
                bundle.gateway_ip = target.gateway_ip.clone();
                return Ok(Some(bundle));
            }
        }

        log::info!("[*] Navigating to: {}", target.start_url);
        self.page
            .navigate(&target.start_url)
            .map_err(|e| browser_error("Could not open the portal", e))?;
        self.target = Some(target);
        Ok(None)
    }

    fn enter_totp(&mut self) -> Result<(), VpnError> {
        let Some(seed) = self.settings.totp_seed.as_deref() else {
            return Ok(());
        };
        let remaining = totp::seconds_remaining(unix_now());
        if remaining < totp::MIN_REMAINING_SECS {
            log::info!("[*] Waiting {}s for a fresh TOTP window", remaining);
            if !self.cancel.sleep(Duration::from_secs(remaining + 1)) {
                return Err(VpnError::Cancelled);
            }
        }
        let code = totp::generate(seed).map_err(|e| VpnError::InvalidProfile {
            reason: format!("stored TOTP seed is unusable: {}", e),
        })?;
        log::info!("[*] Entering TOTP code");
        self.fill(Field::Totp, &code);
        self.click(Control::TotpSubmit);
        Ok(())
    }

    fn await_approval(&mut self, number: Option<&str>) {
        if self.mfa_started.is_none() {
            self.mfa_started = Some(Instant::now());
        }
        let current = number.map(str::to_string);
        if self.announced_push.as_ref() != Some(&current) {
            match number {
                Some(n) => log::info!("[*] Approve the sign-in request, number: {}", n),
                None => log::info!("[*] Waiting for MFA approval on your device"),
            }
            self.observer.on_mfa_push(number);
            self.announced_push = Some(current);
        }
    }

    fn finish_mfa(&mut self) {
        if self.mfa_started.take().is_some() {
            log::info!("[✓] MFA step completed");
            self.announced_push = None;
            self.observer.on_mfa_complete();
        }
    }

    fn fill(&self, field: Field, value: &str) {
        if let Err(e) = self.page.fill(field, value) {
            log::debug!("Filling {:?} failed: {}", field, e);
        }
    }

    fn click(&self, control: Control) {
        match self.page.click(control) {
            Ok(true) => {}
            Ok(false) => log::debug!("{:?} not found on page", control),
            Err(e) => log::debug!("Clicking {:?} failed: {}", control, e),
        }
    }

    fn timeout(&self) -> VpnError {
        log::warn!("[!] Login timed out in state {}", self.state);
        let screenshot = self.settings.debug_dir.as_ref().and_then(|dir| {
            let path = dir.join(format!("auth-{}.png", self.state));
            let saved = std::fs::create_dir_all(dir)
                .map_err(anyhow::Error::from)
                .and_then(|_| self.page.screenshot(&path));
            match saved {
                Ok(()) => Some(path),
                Err(e) => {
                    log::debug!("Screenshot failed: {}", e);
                    None
                }
            }
        });
        VpnError::AuthTimeout {
            state: self.state.to_string(),
            screenshot,
        }
    }
}
