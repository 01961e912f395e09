use crate::cache::ProfileDir;
use anyhow::{anyhow, Result};
use headless_chrome::browser::default_executable;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

/// Launches Chrome against `profile`.
///
/// - **Headless** unless `visible` is set.
/// - **Sandbox disabled** and GPU off, so it also runs as root under the daemon.
/// - **Idle timeout** of 2 minutes headless, 10 minutes when a user may be
///   interacting with the window.
///
/// A persistent profile that Chrome cannot start against is wiped once and
/// the launch retried.
pub fn create_browser(profile: &ProfileDir, visible: bool, chrome_path: Option<&Path>) -> Result<Browser> {
    let mut attempts = 0;
    loop {
        let idle_timeout = if visible {
            Duration::from_secs(600)
        } else {
            Duration::from_secs(120)
        };

        let mut options = LaunchOptions::default_builder();
        let mut launch_options = options
            .headless(!visible)
            .sandbox(false)
            .idle_browser_timeout(idle_timeout)
            .window_size(Some((800, 800)))
            .enable_gpu(false)
            .args(vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-session-crashed-bubble"),
                OsStr::new("--lang=en-US"),
            ])
            .user_data_dir(Some(profile.path().to_path_buf()));

        if let Some(path) = chrome_path {
            launch_options = launch_options.path(Some(path.to_path_buf()));
        } else if let Ok(executable_path) = default_executable() {
            launch_options = launch_options.path(Some(executable_path));
        }

        let built = launch_options
            .build()
            .map_err(|e| anyhow!("invalid browser options: {}", e))?;
        match Browser::new(built) {
            Ok(browser) => return Ok(browser),
            Err(e) => {
                attempts += 1;
                if attempts >= 2 || !profile.is_persistent() {
                    return Err(anyhow!("Browser failed to start: {}", e));
                }
                log::warn!("[!] Browser failed to start ({}). Wiping profile and retrying...", e);
                wipe_contents(profile.path())?;
            }
        }
    }
}

/// Empties a profile directory but keeps the directory itself.
fn wipe_contents(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn initial_tab(browser: &Browser) -> Result<Arc<Tab>> {
    for _ in 0..10 {
        if let Ok(tabs) = browser.get_tabs().lock() {
            if let Some(t) = tabs.first() {
                return Ok(Arc::clone(t));
            }
        }
        sleep(Duration::from_millis(200));
    }
    browser.new_tab()
}

/// A running browser plus the tab the login happens in.
///
/// Dropping the session closes every tab; the profile directory outlives it
/// only when it is persistent.
pub struct BrowserSession {
    browser: Browser,
    tab: Arc<Tab>,
    _profile: ProfileDir,
}

impl BrowserSession {
    pub fn open(profile: ProfileDir, visible: bool, chrome_path: Option<&Path>) -> Result<Self> {
        let browser = create_browser(&profile, visible, chrome_path)?;
        let tab = initial_tab(&browser)?;
        tab.set_default_timeout(Duration::from_secs(30));
        Ok(Self {
            browser,
            tab,
            _profile: profile,
        })
    }

    pub fn tab(&self) -> Arc<Tab> {
        Arc::clone(&self.tab)
    }

    pub fn pid(&self) -> Option<u32> {
        self.browser.get_process_id()
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Ok(tabs) = self.browser.get_tabs().lock() {
            for tab in tabs.iter() {
                // The browser may already be gone; do not hang on it.
                let _ = tab.close(true);
            }
        }
        sleep(Duration::from_millis(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_contents_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Default/Cache")).unwrap();
        std::fs::write(dir.path().join("Local State"), b"{}").unwrap();

        wipe_contents(dir.path()).unwrap();

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
