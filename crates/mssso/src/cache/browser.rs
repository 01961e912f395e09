use crate::utils::{create_private_dir, sanitize_name};
use std::path::{Path, PathBuf};

const SUBDIR: &str = "browser-session";

/// Browser user-data directory for one login attempt.
pub enum ProfileDir {
    /// Survives across attempts so remembered Microsoft sessions short-circuit login.
    Persistent(PathBuf),
    /// Removed when dropped.
    Ephemeral(tempfile::TempDir),
}

impl ProfileDir {
    pub fn path(&self) -> &Path {
        match self {
            ProfileDir::Persistent(p) => p,
            ProfileDir::Ephemeral(t) => t.path(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, ProfileDir::Persistent(_))
    }
}

/// Per-connection browser profiles, independent of the cookie cache lifecycle.
#[derive(Debug, Clone)]
pub struct BrowserProfileCache {
    root: PathBuf,
}

impl BrowserProfileCache {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            root: cache_root.join(SUBDIR),
        }
    }

    pub fn dir_for(&self, name: &str) -> PathBuf {
        self.root.join(sanitize_name(name))
    }

    /// Returns the persistent profile when `enabled`, otherwise a throwaway one.
    pub fn acquire(&self, name: &str, enabled: bool) -> std::io::Result<ProfileDir> {
        if enabled {
            let dir = self.dir_for(name);
            if !dir.exists() {
                create_private_dir(&dir)?;
                log::info!("Browser profile directory created at: {:?}", dir);
            }
            Ok(ProfileDir::Persistent(dir))
        } else {
            log::debug!("Browser profile cache disabled for '{}', using a temporary profile", name);
            Ok(ProfileDir::Ephemeral(
                tempfile::Builder::new().prefix("ms-sso-browser-").tempdir()?,
            ))
        }
    }

    /// Completely removes the profile for `name`.
    pub fn wipe(&self, name: &str) -> std::io::Result<bool> {
        let dir = self.dir_for(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            log::info!("Wiped browser profile directory: {:?}", dir);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn wipe_all(&self) -> std::io::Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
            log::info!("Wiped all browser profiles under {:?}", self.root);
        }
        Ok(())
    }
}
