use console::Style;
use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};
use mssso::auth::AuthState;
use mssso::{ConnectionState, OrchestratorEvent};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Format a duration into a human-readable string like "1h 23m 45s".
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn auth_message(state: AuthState) -> &'static str {
    match state {
        AuthState::PortalLoad => "Opening VPN portal...",
        AuthState::CheckSignedIn => "Checking for an existing sign-in...",
        AuthState::CredentialEntry => "Signing in...",
        AuthState::MfaWait => "Waiting for MFA...",
        AuthState::StaySignedIn => "Finishing sign-in...",
        AuthState::ExtractCookies => "Reading session cookies...",
    }
}

fn state_message(state: &ConnectionState) -> Option<&'static str> {
    match state {
        ConnectionState::CacheCheck => Some("Checking cached session..."),
        ConnectionState::Authenticating => Some("Starting browser..."),
        ConnectionState::Connecting => Some("Starting openconnect..."),
        ConnectionState::Disconnecting => Some("Disconnecting..."),
        _ => None,
    }
}

pub(crate) fn spinner() -> Arc<ProgressBar> {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        bar.set_style(style);
    }
    bar.enable_steady_tick(Duration::from_millis(100));
    Arc::new(bar)
}

/// Mirrors orchestrator events on the spinner until the attempt settles.
pub(crate) fn follow(events: Receiver<OrchestratorEvent>, bar: Arc<ProgressBar>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let bold = Style::new().bold();
        let cyan = Style::new().cyan().bold();
        let green = Style::new().green();
        for event in events.iter() {
            match event {
                OrchestratorEvent::State { state, .. } => {
                    if matches!(state, ConnectionState::Connected { .. } | ConnectionState::Failed(_)) {
                        break;
                    }
                    if let Some(msg) = state_message(&state) {
                        bar.set_message(msg);
                    }
                }
                OrchestratorEvent::Auth { state, .. } => bar.set_message(auth_message(state)),
                OrchestratorEvent::MfaPush { number, .. } => bar.suspend(|| match number {
                    Some(n) => eprintln!("{} Enter {} in Authenticator", bold.apply_to(">>"), cyan.apply_to(n)),
                    None => eprintln!("{} Approve the sign-in request in Authenticator", bold.apply_to(">>")),
                }),
                OrchestratorEvent::MfaComplete { .. } => {
                    bar.suspend(|| eprintln!("  {} MFA approved", green.apply_to("✓")))
                }
                OrchestratorEvent::ClientExited { .. } => break,
            }
        }
        bar.finish_and_clear();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
