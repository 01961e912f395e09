//! The SSO login flow as an explicit state machine.
//!
//! [`classify`] turns one raw page probe into a [`PageView`]; [`next_step`]
//! maps `(state, view, memo)` to the action to perform and the next state.
//! Neither touches the browser, so every transition is testable on its own.

use super::page::PageProbe;
use std::fmt;

/// Transient portal errors are answered with at most this many reloads.
pub const MAX_RELOADS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    PortalLoad,
    CheckSignedIn,
    CredentialEntry,
    MfaWait,
    StaySignedIn,
    ExtractCookies,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::PortalLoad => "portal_load",
            AuthState::CheckSignedIn => "check_signed_in",
            AuthState::CredentialEntry => "credential_entry",
            AuthState::MfaWait => "mfa_wait",
            AuthState::StaySignedIn => "stay_signed_in",
            AuthState::ExtractCookies => "extract_cookies",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalError {
    /// Worth one reload ("An error occurred", "Authentication attempt failed").
    Transient(String),
    /// Explicit refusal of credentials or code.
    Rejected(String),
}

/// What the current page is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageView {
    /// On the VPN host with a usable session artefact.
    Authenticated,
    AccountPicker { matching: bool },
    UsernameField,
    PasswordField,
    /// Username and password on one form (ADFS).
    CombinedLogin,
    UsePasswordInstead,
    TotpField,
    OtherWayLink,
    VerificationOptions { app_code: bool },
    PushApproval { number: Option<String>, other_way: bool },
    StaySignedIn,
    Error(PortalError),
    Loading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenPortal,
    Wait,
    PickAccount,
    UseAnotherAccount,
    EnterUsername,
    EnterPassword,
    EnterCredentials,
    SwitchToPassword,
    ChooseOtherWay,
    ChooseAppCode,
    ChooseAppNotification,
    EnterTotp,
    AwaitApproval { number: Option<String> },
    AcceptStaySignedIn,
    Reload,
    ExtractCookies,
    Fail(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub action: Action,
    pub next: AuthState,
}

impl Step {
    fn go(action: Action, next: AuthState) -> Self {
        Self { action, next }
    }

    fn wait(state: AuthState) -> Self {
        Self {
            action: Action::Wait,
            next: state,
        }
    }
}

/// What the driver has already done during this attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMemo {
    pub has_totp_seed: bool,
    pub username_sent: bool,
    pub password_sent: bool,
    pub totp_sent: bool,
    pub other_way_tried: bool,
    pub picker_used: bool,
    pub reloads: u32,
}

impl FlowMemo {
    pub fn new(has_totp_seed: bool) -> Self {
        Self {
            has_totp_seed,
            ..Default::default()
        }
    }

    /// Records the effect of an action that was just performed.
    pub fn record(&mut self, action: &Action) {
        match action {
            Action::EnterUsername => self.username_sent = true,
            Action::EnterPassword | Action::EnterCredentials => {
                self.username_sent = true;
                self.password_sent = true;
            }
            Action::EnterTotp => self.totp_sent = true,
            Action::ChooseOtherWay => self.other_way_tried = true,
            Action::PickAccount => self.picker_used = true,
            Action::Reload => self.reloads += 1,
            _ => {}
        }
    }

    /// Microsoft may loop back to an earlier page after a navigation; allow
    /// form fields to be filled again. Reload and picker history is kept.
    pub fn page_changed(&mut self) {
        self.username_sent = false;
        self.password_sent = false;
        self.totp_sent = false;
    }
}

/// Classifies a probe. `session_ready` is decided by the caller from the URL
/// and the cookie jar, and wins over anything on the page.
pub fn classify(probe: &PageProbe, session_ready: bool) -> PageView {
    if session_ready {
        return PageView::Authenticated;
    }
    if let Some(text) = probe.error_text.as_deref().filter(|t| !t.trim().is_empty()) {
        let text = text.trim().to_string();
        return if probe.transient_error {
            PageView::Error(PortalError::Transient(text))
        } else {
            PageView::Error(PortalError::Rejected(text))
        };
    }
    if probe.stay_signed_in {
        return PageView::StaySignedIn;
    }
    if probe.account_picker {
        return PageView::AccountPicker {
            matching: probe.matching_tile,
        };
    }
    if probe.push_prompt {
        return PageView::PushApproval {
            number: probe.push_number.clone().filter(|n| !n.is_empty()),
            other_way: probe.other_way_link,
        };
    }
    if probe.totp_field {
        return PageView::TotpField;
    }
    if probe.verification_options {
        return PageView::VerificationOptions {
            app_code: probe.app_code_option,
        };
    }
    if probe.adfs_form {
        return PageView::CombinedLogin;
    }
    if probe.password_field {
        return PageView::PasswordField;
    }
    if probe.use_password_link {
        return PageView::UsePasswordInstead;
    }
    if probe.username_field {
        return PageView::UsernameField;
    }
    if probe.other_way_link {
        return PageView::OtherWayLink;
    }
    PageView::Loading
}

/// The transition function.
///
/// Any step may be skipped by the tenant, so the view decides where the flow
/// goes next; the state only records how far it got. Absence of an element is
/// never an error, only explicit portal errors are.
pub fn next_step(state: AuthState, view: &PageView, memo: &FlowMemo) -> Step {
    use AuthState::*;

    if state == PortalLoad {
        return Step::go(Action::OpenPortal, CheckSignedIn);
    }

    match view {
        PageView::Authenticated => Step::go(Action::ExtractCookies, ExtractCookies),
        PageView::Loading => Step::wait(state),

        PageView::Error(PortalError::Rejected(reason)) => {
            Step::go(Action::Fail(reason.clone()), state)
        }
        PageView::Error(PortalError::Transient(reason)) => {
            if memo.reloads < MAX_RELOADS {
                Step::go(Action::Reload, state)
            } else {
                Step::go(
                    Action::Fail(format!("portal error persisted after reload: {}", reason)),
                    state,
                )
            }
        }

        PageView::StaySignedIn => Step::go(Action::AcceptStaySignedIn, StaySignedIn),

        PageView::AccountPicker { matching: true } if !memo.picker_used => {
            Step::go(Action::PickAccount, CredentialEntry)
        }
        PageView::AccountPicker { .. } => Step::go(Action::UseAnotherAccount, CredentialEntry),

        PageView::UsernameField if memo.username_sent => Step::wait(CredentialEntry),
        PageView::UsernameField => Step::go(Action::EnterUsername, CredentialEntry),

        PageView::UsePasswordInstead => Step::go(Action::SwitchToPassword, CredentialEntry),

        PageView::PasswordField | PageView::CombinedLogin if memo.password_sent => {
            Step::wait(MfaWait)
        }
        PageView::PasswordField => Step::go(Action::EnterPassword, MfaWait),
        PageView::CombinedLogin => Step::go(Action::EnterCredentials, MfaWait),

        PageView::TotpField if !memo.has_totp_seed => {
            Step::go(Action::AwaitApproval { number: None }, MfaWait)
        }
        PageView::TotpField if memo.totp_sent => Step::wait(MfaWait),
        PageView::TotpField => Step::go(Action::EnterTotp, MfaWait),

        PageView::PushApproval { other_way: true, .. }
            if memo.has_totp_seed && !memo.other_way_tried =>
        {
            Step::go(Action::ChooseOtherWay, MfaWait)
        }
        PageView::PushApproval { number, .. } => Step::go(
            Action::AwaitApproval {
                number: number.clone(),
            },
            MfaWait,
        ),

        PageView::OtherWayLink if memo.other_way_tried => Step::wait(state),
        PageView::OtherWayLink => {
            let next = if memo.password_sent { MfaWait } else { CredentialEntry };
            Step::go(Action::ChooseOtherWay, next)
        }

        PageView::VerificationOptions { app_code: true } if memo.has_totp_seed => {
            Step::go(Action::ChooseAppCode, MfaWait)
        }
        PageView::VerificationOptions { .. } => Step::go(Action::ChooseAppNotification, MfaWait),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memo() -> FlowMemo {
        FlowMemo::new(true)
    }

    #[test]
    fn portal_load_always_opens_portal() {
        let step = next_step(AuthState::PortalLoad, &PageView::Loading, &memo());
        assert_eq!(step, Step::go(Action::OpenPortal, AuthState::CheckSignedIn));
    }

    #[test]
    fn signed_in_fast_path_skips_credentials() {
        let step = next_step(AuthState::CheckSignedIn, &PageView::Authenticated, &memo());
        assert_eq!(step.action, Action::ExtractCookies);
        assert_eq!(step.next, AuthState::ExtractCookies);
    }

    #[test]
    fn loading_keeps_state() {
        for state in [AuthState::CheckSignedIn, AuthState::MfaWait, AuthState::StaySignedIn] {
            assert_eq!(next_step(state, &PageView::Loading, &memo()), Step::wait(state));
        }
    }

    #[test]
    fn matching_account_tile_is_picked_once() {
        let view = PageView::AccountPicker { matching: true };
        let mut m = memo();
        assert_eq!(next_step(AuthState::CheckSignedIn, &view, &m).action, Action::PickAccount);
        m.record(&Action::PickAccount);
        assert_eq!(
            next_step(AuthState::CredentialEntry, &view, &m).action,
            Action::UseAnotherAccount
        );
        let other = PageView::AccountPicker { matching: false };
        assert_eq!(next_step(AuthState::CheckSignedIn, &other, &memo()).action, Action::UseAnotherAccount);
    }

    #[test]
    fn username_is_sent_once_per_page() {
        let mut m = memo();
        let step = next_step(AuthState::CheckSignedIn, &PageView::UsernameField, &m);
        assert_eq!(step.action, Action::EnterUsername);
        m.record(&step.action);
        assert_eq!(
            next_step(AuthState::CredentialEntry, &PageView::UsernameField, &m),
            Step::wait(AuthState::CredentialEntry)
        );
        m.page_changed();
        assert_eq!(
            next_step(AuthState::CredentialEntry, &PageView::UsernameField, &m).action,
            Action::EnterUsername
        );
    }

    #[test]
    fn passwordless_prompt_switches_to_password() {
        let step = next_step(AuthState::CredentialEntry, &PageView::UsePasswordInstead, &memo());
        assert_eq!(step.action, Action::SwitchToPassword);
        let step = next_step(AuthState::CredentialEntry, &PageView::PasswordField, &memo());
        assert_eq!(step, Step::go(Action::EnterPassword, AuthState::MfaWait));
    }

    #[test]
    fn adfs_form_fills_both_fields() {
        let step = next_step(AuthState::CheckSignedIn, &PageView::CombinedLogin, &memo());
        assert_eq!(step.action, Action::EnterCredentials);
    }

    #[test]
    fn totp_needs_a_seed() {
        let step = next_step(AuthState::MfaWait, &PageView::TotpField, &memo());
        assert_eq!(step.action, Action::EnterTotp);
        let no_seed = FlowMemo::new(false);
        let step = next_step(AuthState::MfaWait, &PageView::TotpField, &no_seed);
        assert_eq!(step.action, Action::AwaitApproval { number: None });
    }

    #[test]
    fn number_matching_prefers_totp_when_possible() {
        let view = PageView::PushApproval {
            number: Some("42".into()),
            other_way: true,
        };
        let mut m = memo();
        assert_eq!(next_step(AuthState::MfaWait, &view, &m).action, Action::ChooseOtherWay);
        m.record(&Action::ChooseOtherWay);
        assert_eq!(
            next_step(AuthState::MfaWait, &view, &m).action,
            Action::AwaitApproval {
                number: Some("42".into())
            }
        );
        let no_seed = FlowMemo::new(false);
        assert!(matches!(
            next_step(AuthState::MfaWait, &view, &no_seed).action,
            Action::AwaitApproval { .. }
        ));
    }

    #[test]
    fn verification_options_pick_by_capability() {
        let view = PageView::VerificationOptions { app_code: true };
        assert_eq!(next_step(AuthState::MfaWait, &view, &memo()).action, Action::ChooseAppCode);
        assert_eq!(
            next_step(AuthState::MfaWait, &view, &FlowMemo::new(false)).action,
            Action::ChooseAppNotification
        );
    }

    #[test]
    fn transient_error_reloads_exactly_once() {
        let view = PageView::Error(PortalError::Transient("An error occurred".into()));
        let mut m = memo();
        let first = next_step(AuthState::CredentialEntry, &view, &m);
        assert_eq!(first.action, Action::Reload);
        m.record(&first.action);
        m.page_changed();
        match next_step(AuthState::CredentialEntry, &view, &m).action {
            Action::Fail(reason) => assert!(reason.contains("An error occurred")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn rejection_fails_immediately() {
        let view = PageView::Error(PortalError::Rejected("Your account or password is incorrect.".into()));
        assert!(matches!(
            next_step(AuthState::MfaWait, &view, &memo()).action,
            Action::Fail(_)
        ));
    }

    #[test]
    fn stay_signed_in_is_accepted_from_any_state() {
        for state in [AuthState::CheckSignedIn, AuthState::CredentialEntry, AuthState::MfaWait] {
            let step = next_step(state, &PageView::StaySignedIn, &memo());
            assert_eq!(step, Step::go(Action::AcceptStaySignedIn, AuthState::StaySignedIn));
        }
    }

    #[test]
    fn classify_precedence() {
        let mut probe = PageProbe {
            username_field: true,
            password_field: true,
            ..Default::default()
        };
        assert_eq!(classify(&probe, false), PageView::PasswordField);
        assert_eq!(classify(&probe, true), PageView::Authenticated);

        probe.error_text = Some("Your account or password is incorrect.".into());
        assert!(matches!(classify(&probe, false), PageView::Error(PortalError::Rejected(_))));

        probe.transient_error = true;
        assert!(matches!(classify(&probe, false), PageView::Error(PortalError::Transient(_))));

        let push = PageProbe {
            push_prompt: true,
            push_number: Some(String::new()),
            other_way_link: true,
            ..Default::default()
        };
        assert_eq!(
            classify(&push, false),
            PageView::PushApproval {
                number: None,
                other_way: true
            }
        );
        assert_eq!(classify(&PageProbe::default(), false), PageView::Loading);
    }
}
