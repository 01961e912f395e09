use std::path::PathBuf;

/// High-level error category for user-facing reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// SSO login phase: portal, credentials, MFA
    Authentication,
    /// VPN client phase: cookie hand-off, tunnel bring-up
    Connection,
    /// Local environment: secret store, cache, browser, daemon
    System,
}

/// Error types surfaced by the session lifecycle engine.
///
/// Lower layers return these as typed results and never retry on their own;
/// the orchestrator is the only place that decides on retries.
#[derive(Debug, Clone)]
pub enum VpnError {
    /// A bounded wait in the SSO flow expired.
    AuthTimeout {
        state: String,
        screenshot: Option<PathBuf>,
    },
    /// The portal explicitly refused the credentials or the one-time code.
    AuthRejected {
        reason: String,
    },
    /// The VPN client refused the session cookie.
    CookieRejected {
        output: Vec<String>,
    },
    /// The VPN client binary could not be located.
    ClientNotFound {
        searched: String,
    },
    /// The VPN client exited before the tunnel stabilised.
    ProcessExitedEarly {
        code: Option<i32>,
        output: Vec<String>,
    },
    /// A cache file could not be read. Callers treat this as a miss.
    CacheCorrupt {
        path: PathBuf,
        reason: String,
    },
    SecretStoreUnavailable {
        message: String,
    },
    Cancelled,
    AlreadyInProgress {
        connection: String,
    },
    ProfileNotFound {
        name: String,
    },
    InvalidProfile {
        reason: String,
    },
    Browser {
        message: String,
    },
    Daemon {
        message: String,
    },
    Io {
        message: String,
    },
}

impl VpnError {
    /// Returns the high-level category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            VpnError::AuthTimeout { .. } | VpnError::AuthRejected { .. } => {
                ErrorCategory::Authentication
            }
            VpnError::CookieRejected { .. }
            | VpnError::ClientNotFound { .. }
            | VpnError::ProcessExitedEarly { .. }
            | VpnError::AlreadyInProgress { .. } => ErrorCategory::Connection,
            VpnError::CacheCorrupt { .. }
            | VpnError::SecretStoreUnavailable { .. }
            | VpnError::Cancelled
            | VpnError::ProfileNotFound { .. }
            | VpnError::InvalidProfile { .. }
            | VpnError::Browser { .. }
            | VpnError::Daemon { .. }
            | VpnError::Io { .. } => ErrorCategory::System,
        }
    }

    /// Only a cookie rejection may be answered with a fresh login.
    pub fn is_retryable_by_reauth(&self) -> bool {
        matches!(self, VpnError::CookieRejected { .. })
    }

    /// Short identifier used in logs and RPC messages.
    pub fn kind(&self) -> &'static str {
        match self {
            VpnError::AuthTimeout { .. } => "AuthTimeout",
            VpnError::AuthRejected { .. } => "AuthRejected",
            VpnError::CookieRejected { .. } => "CookieRejected",
            VpnError::ClientNotFound { .. } => "ClientNotFound",
            VpnError::ProcessExitedEarly { .. } => "ProcessExitedEarly",
            VpnError::CacheCorrupt { .. } => "CacheCorrupt",
            VpnError::SecretStoreUnavailable { .. } => "SecretStoreUnavailable",
            VpnError::Cancelled => "Cancelled",
            VpnError::AlreadyInProgress { .. } => "AlreadyInProgress",
            VpnError::ProfileNotFound { .. } => "ProfileNotFound",
            VpnError::InvalidProfile { .. } => "InvalidProfile",
            VpnError::Browser { .. } => "Browser",
            VpnError::Daemon { .. } => "Daemon",
            VpnError::Io { .. } => "Io",
        }
    }

    /// Returns the user-facing error message
    pub fn user_message(&self) -> String {
        match self {
            VpnError::AuthTimeout { state, screenshot } => {
                let mut msg = format!("Login timed out while in state '{}'.", state);
                if let Some(path) = screenshot {
                    msg.push_str(&format!("\nScreenshot saved to {}", path.display()));
                }
                msg
            }
            VpnError::AuthRejected { reason } => format!("Login rejected by the portal.\n\n{}", reason),
            VpnError::CookieRejected { .. } => {
                "The VPN server rejected the session cookie.".to_string()
            }
            VpnError::ClientNotFound { searched } => {
                format!("Could not locate the openconnect binary (looked for '{}').", searched)
            }
            VpnError::ProcessExitedEarly { code, output } => {
                let mut msg = match code {
                    Some(c) => format!("openconnect exited early with code {}.", c),
                    None => "openconnect exited early.".to_string(),
                };
                if !output.is_empty() {
                    msg.push_str("\n\nLast output:\n");
                    msg.push_str(&output.join("\n"));
                }
                msg
            }
            VpnError::CacheCorrupt { path, reason } => {
                format!("Cache file {} is unreadable: {}", path.display(), reason)
            }
            VpnError::SecretStoreUnavailable { message } => {
                format!("The system secret store is not available.\n\n{}", message)
            }
            VpnError::Cancelled => "Operation cancelled by user.".to_string(),
            VpnError::AlreadyInProgress { connection } => {
                format!("A connection attempt for '{}' is already in progress.", connection)
            }
            VpnError::ProfileNotFound { name } => format!("No saved connection named '{}'.", name),
            VpnError::InvalidProfile { reason } => format!("Invalid connection profile: {}", reason),
            VpnError::Browser { message } => format!("Browser error.\n\n{}", message),
            VpnError::Daemon { message } => format!("Daemon error.\n\n{}", message),
            VpnError::Io { message } => format!("An error occurred.\n\n{}", message),
        }
    }

    /// Suggested next step for the user, if one applies.
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            VpnError::AuthTimeout { .. } => {
                Some("Re-run with --visible to watch the login flow (add --debug for screenshots)")
            }
            VpnError::AuthRejected { .. } => Some("Check the stored credentials with --setup"),
            VpnError::CookieRejected { .. } => Some("Re-run with --no-cache to force a fresh login"),
            VpnError::ClientNotFound { .. } => Some("Install openconnect or add it to PATH"),
            VpnError::ProcessExitedEarly { .. } => {
                Some("Try --no-dtls if a firewall drops UDP traffic")
            }
            VpnError::SecretStoreUnavailable { .. } => {
                Some("Unlock the system keyring, then re-run --setup")
            }
            VpnError::ProfileNotFound { .. } => Some("Create it with --setup or list saved ones with --list"),
            VpnError::Browser { .. } => Some("Try --clean-browser to wipe the cached browser profile"),
            VpnError::Daemon { .. } => Some("Check that ms-sso-openconnect-daemon is running"),
            _ => None,
        }
    }

    /// Returns the full error message including the suggested remedy
    pub fn full_message(&self) -> String {
        let mut msg = self.user_message();
        if let Some(remedy) = self.remedy() {
            msg.push_str("\n\nSuggestion: ");
            msg.push_str(remedy);
        }
        msg
    }
}

impl std::fmt::Display for VpnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for VpnError {}

impl From<anyhow::Error> for VpnError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<VpnError>() {
            Ok(vpn) => vpn,
            Err(other) => VpnError::Io {
                message: format!("{:#}", other),
            },
        }
    }
}

impl From<std::io::Error> for VpnError {
    fn from(err: std::io::Error) -> Self {
        VpnError::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cookie_rejection_triggers_reauth() {
        assert!(VpnError::CookieRejected { output: vec![] }.is_retryable_by_reauth());
        assert!(!VpnError::AuthRejected {
            reason: "bad password".into()
        }
        .is_retryable_by_reauth());
        assert!(!VpnError::ProcessExitedEarly {
            code: Some(1),
            output: vec![]
        }
        .is_retryable_by_reauth());
    }

    #[test]
    fn timeout_suggests_visible_mode() {
        let err = VpnError::AuthTimeout {
            state: "MfaWait".into(),
            screenshot: None,
        };
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert!(err.full_message().contains("--visible"));
        assert!(err.to_string().contains("MfaWait"));
    }

    #[test]
    fn early_exit_suggests_no_dtls() {
        let err = VpnError::ProcessExitedEarly {
            code: Some(2),
            output: vec!["DTLS handshake failed".into()],
        };
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(err.full_message().contains("--no-dtls"));
        assert!(err.user_message().contains("DTLS handshake failed"));
    }

    #[test]
    fn anyhow_round_trips_typed_errors() {
        let wrapped: anyhow::Error = VpnError::Cancelled.into();
        assert!(matches!(VpnError::from(wrapped), VpnError::Cancelled));

        let plain = anyhow::anyhow!("disk full");
        match VpnError::from(plain) {
            VpnError::Io { message } => assert!(message.contains("disk full")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
