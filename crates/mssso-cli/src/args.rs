use clap::{Parser, ValueEnum};
use log::LevelFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Connect to Microsoft SSO protected AnyConnect and GlobalProtect VPNs.
#[derive(Parser, Debug)]
#[command(name = "ms-sso-openconnect", version, about)]
pub struct Args {
    /// Saved connection to use; prompts when several exist
    pub connection: Option<String>,

    /// Add or update a saved connection interactively
    #[arg(long)]
    pub setup: bool,

    /// List saved connections
    #[arg(long)]
    pub list: bool,

    /// Delete a saved connection with its secrets and caches
    #[arg(long, value_name = "NAME")]
    pub delete: Option<String>,

    /// Disconnect gracefully (SIGTERM), restoring DNS
    #[arg(long, conflicts_with = "force_disconnect")]
    pub disconnect: bool,

    /// Disconnect immediately (SIGKILL), keeping the server session alive
    #[arg(long)]
    pub force_disconnect: bool,

    /// Ignore the cached session and log in again
    #[arg(long)]
    pub no_cache: bool,

    /// Show the browser window during login
    #[arg(long)]
    pub visible: bool,

    /// Save a screenshot when the login times out
    #[arg(long)]
    pub debug: bool,

    /// Pass --no-dtls to openconnect
    #[arg(long)]
    pub no_dtls: bool,

    /// Wipe the cached browser profile (of CONNECTION, or all)
    #[arg(long)]
    pub clean_browser: bool,

    /// Remove cached session cookies (of CONNECTION, or all)
    #[arg(long)]
    pub clear_cache: bool,

    /// Log verbosity
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub level: LogLevel,
}
