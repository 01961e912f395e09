use crate::cookies::CookieBundle;
use crate::error::VpnError;
use crate::profile::Protocol;
use crate::utils::{create_private_dir, sanitize_name, set_owner_only, unix_now};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

const FILE_PREFIX: &str = "session_";
const FILE_SUFFIX: &str = ".json";

/// A previously obtained cookie bundle with its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSession {
    pub cookies: BTreeMap<String, String>,
    /// Unix seconds at which the bundle was obtained.
    pub timestamp: u64,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usergroup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<String>,
}

impl CachedSession {
    pub fn from_bundle(bundle: &CookieBundle, timestamp: u64) -> Self {
        Self {
            cookies: bundle.cookies.clone(),
            timestamp,
            protocol: bundle.protocol,
            usergroup: bundle.usergroup.clone(),
            gateway_ip: bundle.gateway_ip.clone(),
        }
    }

    pub fn bundle(&self) -> CookieBundle {
        CookieBundle {
            protocol: self.protocol,
            cookies: self.cookies.clone(),
            usergroup: self.usergroup.clone(),
            gateway_ip: self.gateway_ip.clone(),
        }
    }

    /// Pure TTL check: valid while `now - timestamp < ttl`.
    pub fn is_fresh_at(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.timestamp) < ttl.as_secs()
    }
}

/// File-per-connection cookie cache with a time-to-live.
pub struct SessionCache {
    root: PathBuf,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}{}{}", FILE_PREFIX, sanitize_name(name), FILE_SUFFIX))
    }

    pub fn is_fresh(&self, session: &CachedSession) -> bool {
        session.is_fresh_at(unix_now(), self.ttl)
    }

    pub fn load(&self, name: &str) -> Option<CachedSession> {
        self.load_at(name, unix_now())
    }

    /// Returns the cached session if present, parseable and within the TTL.
    /// Expired files are removed; unreadable ones are reported and ignored.
    pub fn load_at(&self, name: &str, now: u64) -> Option<CachedSession> {
        let path = self.path_for(name);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                report_corrupt(&path, &e.to_string());
                return None;
            }
        };

        let session: CachedSession = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                report_corrupt(&path, &e.to_string());
                return None;
            }
        };

        if !session.is_fresh_at(now, self.ttl) {
            log::info!("[*] Cached session for '{}' expired, discarding", name);
            let _ = std::fs::remove_file(&path);
            return None;
        }

        let age = now.saturating_sub(session.timestamp);
        log::debug!(
            "Cached session for '{}' is {}m old, cookies: {:?}",
            name,
            age / 60,
            session.cookies.keys().collect::<Vec<_>>()
        );
        Some(session)
    }

    pub fn save(&self, name: &str, bundle: &CookieBundle) -> Result<(), VpnError> {
        self.save_at(name, bundle, unix_now())
    }

    /// Writes atomically: a temp file in the same directory is renamed over the target.
    pub fn save_at(&self, name: &str, bundle: &CookieBundle, now: u64) -> Result<(), VpnError> {
        create_private_dir(&self.root)?;
        let session = CachedSession::from_bundle(bundle, now);
        let json = serde_json::to_vec_pretty(&session).map_err(|e| VpnError::Io {
            message: e.to_string(),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        set_owner_only(tmp.path())?;
        let path = self.path_for(name);
        tmp.persist(&path).map_err(|e| VpnError::Io {
            message: format!("could not replace {}: {}", path.display(), e.error),
        })?;
        log::debug!("Saved session cache for '{}' to {:?}", name, path);
        Ok(())
    }

    /// Removes the cached session; returns whether one existed.
    pub fn invalidate(&self, name: &str) -> Result<bool, VpnError> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => {
                log::info!("[*] Invalidated cached session for '{}'", name);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores the long-lived GlobalProtect portal cookie reported by the client,
    /// so the next connect can skip the SAML flow.
    pub fn update_portal_cookie(&self, name: &str, cookie: &str) -> Result<(), VpnError> {
        let bundle = CookieBundle::new(Protocol::GlobalProtect)
            .with_cookie("portal-userauthcookie", cookie);
        if bundle.is_empty() {
            return Ok(());
        }
        let mut bundle = bundle;
        bundle.usergroup = Some(crate::cookies::GP_GROUP_PORTAL.to_string());
        if let Some(previous) = self.load(name) {
            bundle.gateway_ip = previous.gateway_ip;
        }
        self.save(name, &bundle)
    }

    /// Removes every cached session in this namespace.
    pub fn clear_all(&self) -> Result<usize, VpnError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(FILE_PREFIX)
                && file_name.ends_with(FILE_SUFFIX)
                && std::fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn report_corrupt(path: &Path, reason: &str) {
    let err = VpnError::CacheCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    log::warn!("[!] {} (treating as cache miss)", err);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> CookieBundle {
        CookieBundle::new(Protocol::AnyConnect).with_cookie("webvpn", "abc123")
    }

    #[test]
    fn save_then_load_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path());
        cache.save_at("work", &bundle(), 1_000).unwrap();

        let loaded = cache.load_at("work", 1_000 + 3600).unwrap();
        assert_eq!(loaded.bundle(), bundle());
        assert_eq!(loaded.timestamp, 1_000);
    }

    #[test]
    fn expired_sessions_are_dropped_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path());
        cache.save_at("work", &bundle(), 1_000).unwrap();

        let ttl = DEFAULT_TTL.as_secs();
        assert!(cache.load_at("work", 1_000 + ttl).is_none());
        assert!(!cache.path_for("work").exists());
    }

    #[test]
    fn freshness_is_monotonic_around_the_ttl_edge() {
        let session = CachedSession::from_bundle(&bundle(), 500);
        let ttl = Duration::from_secs(100);
        for now in [0, 500, 550, 599] {
            assert!(session.is_fresh_at(now, ttl), "should be fresh at {}", now);
        }
        for now in [600, 601, 10_000] {
            assert!(!session.is_fresh_at(now, ttl), "should be stale at {}", now);
        }
    }

    #[test]
    fn corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path());
        std::fs::write(cache.path_for("work"), b"{not json").unwrap();
        assert!(cache.load("work").is_none());

        // a later save replaces it
        cache.save("work", &bundle()).unwrap();
        assert!(cache.load("work").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path().join("nested"));
        cache.save("work", &bundle()).unwrap();
        let mode = std::fs::metadata(cache.path_for("work")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn names_are_sanitised_into_file_names() {
        let cache = SessionCache::new("/cache");
        assert_eq!(
            cache.path_for("nm-vpn.example.com/gp"),
            PathBuf::from("/cache/session_nm-vpn.example.com_gp.json")
        );
    }

    #[test]
    fn invalidate_and_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path());
        cache.save("a", &bundle()).unwrap();
        cache.save("b", &bundle()).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        assert!(cache.invalidate("a").unwrap());
        assert!(!cache.invalidate("a").unwrap());
        assert_eq!(cache.clear_all().unwrap(), 1);
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn portal_cookie_update_sets_usergroup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path());
        cache.update_portal_cookie("gp", "long-lived").unwrap();
        let loaded = cache.load("gp").unwrap();
        assert_eq!(loaded.usergroup.as_deref(), Some(crate::cookies::GP_GROUP_PORTAL));
        assert_eq!(loaded.cookies.get("portal-userauthcookie").map(String::as_str), Some("long-lived"));

        cache.update_portal_cookie("gp2", "empty").unwrap();
        assert!(cache.load("gp2").is_none());
    }
}
