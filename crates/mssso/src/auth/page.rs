use crate::cookies::BrowserCookie;
use serde::Deserialize;
use std::path::Path;

/// Input fields the flow fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Username,
    Password,
    Totp,
}

/// Clickable controls the flow knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Account tile whose text matches the configured username.
    MatchingAccount,
    OtherAccount,
    /// Primary submit button of the current form.
    Submit,
    UsePassword,
    OtherWay,
    AppCode,
    AppNotification,
    TotpSubmit,
    StaySignedIn,
}

/// One snapshot of the page, gathered in a single round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageProbe {
    pub account_picker: bool,
    pub matching_tile: bool,
    pub username_field: bool,
    pub password_field: bool,
    pub adfs_form: bool,
    pub use_password_link: bool,
    pub totp_field: bool,
    pub other_way_link: bool,
    pub verification_options: bool,
    pub app_code_option: bool,
    pub push_prompt: bool,
    pub push_number: Option<String>,
    pub stay_signed_in: bool,
    pub error_text: Option<String>,
    pub transient_error: bool,
}

/// The browser surface the login flow needs.
///
/// Implemented by [`super::chrome::ChromePage`] for real runs and by scripted
/// fakes in tests.
pub trait AuthPage {
    fn navigate(&self, url: &str) -> anyhow::Result<()>;
    fn current_url(&self) -> String;
    fn probe(&self) -> anyhow::Result<PageProbe>;
    fn fill(&self, field: Field, value: &str) -> anyhow::Result<()>;
    /// Returns whether something was clicked.
    fn click(&self, control: Control) -> anyhow::Result<bool>;
    fn reload(&self) -> anyhow::Result<()>;
    /// Doubles as a liveness check: an error means the browser is gone.
    fn cookies(&self) -> anyhow::Result<Vec<BrowserCookie>>;
    fn page_source(&self) -> anyhow::Result<String>;
    fn screenshot(&self, path: &Path) -> anyhow::Result<()>;
}
