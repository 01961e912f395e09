//! Runtime configuration resolved once from the environment.

use crate::profile::{ConnectionProfile, Protocol};
use std::path::PathBuf;
use std::time::Duration;

pub const APP_NAME: &str = "ms-sso-openconnect";

const SYSTEM_CACHE_ROOT: &str = "/var/cache/ms-sso-openconnect";
const SYSTEM_CACHE_FALLBACK: &str = "/tmp/ms-sso-openconnect-cache";

/// Which identity owns the cache tree. The privileged daemon never shares
/// a namespace with user invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    User,
    System,
}

impl CacheNamespace {
    pub fn detect() -> Self {
        if crate::utils::is_root() {
            CacheNamespace::System
        } else {
            CacheNamespace::User
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub namespace: CacheNamespace,
    pub cache_root: PathBuf,
    pub cookie_cache: bool,
    pub browser_cache: bool,
    pub gp_cookie_cache: bool,
    pub gp_early_started: bool,
    pub auth_timeout: Duration,
    pub mfa_timeout: Duration,
    pub connect_grace: Duration,
    pub disconnect_timeout: Duration,
    pub debug: bool,
    pub chrome_path: Option<PathBuf>,
    pub openconnect_path: String,
    pub escalation_tool: Option<String>,
    pub daemon_socket: PathBuf,
}

/// Cache and start-up behaviour for one connection after applying profile overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub cookie_cache: bool,
    pub browser_cache: bool,
    pub early_started: bool,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), CacheNamespace::detect())
    }

    /// Builds a config from an arbitrary key lookup; used by tests and by the daemon.
    pub fn from_lookup<F>(lookup: F, namespace: CacheNamespace) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|v| {
                    let parsed = parse_bool(&v);
                    if parsed.is_none() {
                        log::warn!("[!] Ignoring unrecognised value for {}: {:?}", key, v);
                    }
                    parsed
                })
                .unwrap_or(default)
        };
        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                lookup(key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(default),
            )
        };

        let cache_root = lookup("MS_SSO_CACHE_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_cache_root(namespace, &lookup));

        Self {
            namespace,
            cache_root,
            cookie_cache: !flag("MS_SSO_NO_COOKIE_CACHE", false),
            browser_cache: !flag("MS_SSO_NO_BROWSER_CACHE", false),
            gp_cookie_cache: flag("MS_SSO_GP_COOKIE_CACHE", false),
            gp_early_started: flag("MS_SSO_GP_EARLY_STARTED", false),
            auth_timeout: secs("MS_SSO_AUTH_TIMEOUT", 120),
            mfa_timeout: secs("MS_SSO_MFA_TIMEOUT", 90),
            connect_grace: Duration::from_millis(
                lookup("MS_SSO_CONNECT_GRACE_MS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(2000),
            ),
            disconnect_timeout: secs("MS_SSO_DISCONNECT_TIMEOUT", 10),
            debug: flag("MS_SSO_DEBUG", false),
            chrome_path: lookup("MS_SSO_CHROME_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            openconnect_path: lookup("MS_SSO_OPENCONNECT")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "openconnect".to_string()),
            escalation_tool: lookup("MS_SSO_ESCALATION_TOOL").filter(|v| !v.is_empty()),
            daemon_socket: lookup("MS_SSO_DAEMON_SOCKET")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(crate::rpc::default_socket_path),
        }
    }

    /// Applies per-connection overrides; a profile's `Some(_)` always wins.
    pub fn effective(&self, profile: &ConnectionProfile) -> EffectiveSettings {
        let flags = &profile.flags;
        let cookie_cache = flags.cookie_cache.unwrap_or(self.cookie_cache);
        let browser_cache = flags.browser_cache.unwrap_or(self.browser_cache);

        match profile.protocol {
            Protocol::AnyConnect => EffectiveSettings {
                cookie_cache,
                browser_cache,
                early_started: false,
            },
            Protocol::GlobalProtect => EffectiveSettings {
                cookie_cache: cookie_cache
                    && flags.gp_cookie_cache.unwrap_or(self.gp_cookie_cache),
                browser_cache,
                early_started: flags.gp_early_started.unwrap_or(self.gp_early_started),
            },
        }
    }

    /// Creates the cache root, falling back to a temp location for the system
    /// namespace when `/var/cache` is not writable.
    pub fn ensure_cache_root(&mut self) -> std::io::Result<PathBuf> {
        match crate::utils::create_private_dir(&self.cache_root) {
            Ok(()) => Ok(self.cache_root.clone()),
            Err(e) if self.namespace == CacheNamespace::System => {
                log::warn!(
                    "[!] Cache root {:?} unavailable ({}), using {}",
                    self.cache_root,
                    e,
                    SYSTEM_CACHE_FALLBACK
                );
                self.cache_root = PathBuf::from(SYSTEM_CACHE_FALLBACK);
                crate::utils::create_private_dir(&self.cache_root)?;
                Ok(self.cache_root.clone())
            }
            Err(e) => Err(e),
        }
    }
}

fn default_cache_root<F>(namespace: CacheNamespace, lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if namespace == CacheNamespace::System {
        return PathBuf::from(SYSTEM_CACHE_ROOT);
    }

    if cfg!(target_os = "macos") {
        if let Some(home) = lookup("HOME") {
            return PathBuf::from(home).join("Library/Caches").join(APP_NAME);
        }
    }

    if let Some(xdg) = lookup("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join(APP_NAME);
    }

    match lookup("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join(APP_NAME),
        None => std::env::temp_dir().join(APP_NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileFlags;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> RuntimeConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::from_lookup(|k| map.get(k).cloned(), CacheNamespace::User)
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = config_with(&[("HOME", "/home/alice")]);
        assert!(cfg.cookie_cache);
        assert!(cfg.browser_cache);
        assert!(!cfg.gp_cookie_cache);
        assert_eq!(cfg.auth_timeout, Duration::from_secs(120));
        assert_eq!(cfg.connect_grace, Duration::from_millis(2000));
        assert_eq!(cfg.openconnect_path, "openconnect");
        if !cfg!(target_os = "macos") {
            assert_eq!(cfg.cache_root, PathBuf::from("/home/alice/.cache/ms-sso-openconnect"));
        }
    }

    #[test]
    fn boolean_toggles_accept_common_spellings() {
        let cfg = config_with(&[
            ("MS_SSO_NO_COOKIE_CACHE", "YES"),
            ("MS_SSO_NO_BROWSER_CACHE", "1"),
            ("MS_SSO_GP_EARLY_STARTED", "true"),
            ("MS_SSO_DEBUG", "maybe"),
        ]);
        assert!(!cfg.cookie_cache);
        assert!(!cfg.browser_cache);
        assert!(cfg.gp_early_started);
        assert!(!cfg.debug);
    }

    #[test]
    fn system_namespace_uses_var_cache() {
        let cfg = RuntimeConfig::from_lookup(|_| None, CacheNamespace::System);
        assert_eq!(cfg.cache_root, PathBuf::from(SYSTEM_CACHE_ROOT));
    }

    #[test]
    fn profile_override_beats_environment() {
        let cfg = config_with(&[("MS_SSO_NO_COOKIE_CACHE", "1")]);
        let mut profile = ConnectionProfile::new("w", "vpn", Protocol::AnyConnect, "u");
        assert!(!cfg.effective(&profile).cookie_cache);

        profile.flags = ProfileFlags {
            cookie_cache: Some(true),
            ..Default::default()
        };
        assert!(cfg.effective(&profile).cookie_cache);
    }

    #[test]
    fn globalprotect_cookie_cache_is_opt_in() {
        let cfg = config_with(&[]);
        let mut profile = ConnectionProfile::new("g", "gp.example.com", Protocol::GlobalProtect, "u");
        assert!(!cfg.effective(&profile).cookie_cache);

        profile.flags.gp_cookie_cache = Some(true);
        assert!(cfg.effective(&profile).cookie_cache);

        let cfg = config_with(&[("MS_SSO_GP_COOKIE_CACHE", "1")]);
        profile.flags.gp_cookie_cache = Some(false);
        assert!(!cfg.effective(&profile).cookie_cache);
    }
}
