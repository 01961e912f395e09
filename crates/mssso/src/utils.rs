use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `total` in short slices, returning early (with `false`) on cancel.
    pub fn sleep(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(100);
        let mut left = total;
        while !left.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let step = left.min(slice);
            std::thread::sleep(step);
            left -= step;
        }
        !self.is_cancelled()
    }
}

/// Escapes JavaScript strings to prevent injection.
pub fn js_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

/// Makes a connection name safe to embed in a file name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | ':' | '\\' | ' ' => '_',
            c => c,
        })
        .collect()
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// True when running with an effective uid of 0.
pub fn is_root() -> bool {
    #[cfg(unix)]
    return nix::unistd::geteuid().is_root();

    #[cfg(not(unix))]
    false
}

/// Opens (creating if needed) a lock file for use with `fd_lock`.
///
/// Callers hold `try_write()` on the returned lock for as long as they own the
/// resource; the OS releases it when the file handle is dropped.
pub fn open_lock(path: &Path) -> std::io::Result<fd_lock::RwLock<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Ok(fd_lock::RwLock::new(file))
}

/// Restricts a file to owner read/write.
pub fn set_owner_only(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Creates a directory tree and restricts the leaf to its owner.
pub fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_escape_handles_quotes_and_newlines() {
        assert_eq!(js_escape(r"it's"), r"it\'s");
        assert_eq!(js_escape(r"a\b"), r"a\\b");
        assert_eq!(js_escape("x\ny"), r"x\ny");
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_name("vpn.corp.com/group"), "vpn.corp.com_group");
        assert_eq!(sanitize_name("nm-10.0.0.1:443"), "nm-10.0.0.1_443");
        assert_eq!(sanitize_name("My Work VPN"), "My_Work_VPN");
    }

    #[test]
    fn cancelled_token_cuts_sleep_short() {
        let token = CancellationToken::new();
        token.cancel();
        let start = std::time::Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn lock_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("work.lock");
        let mut first = open_lock(&path).unwrap();
        let _held = first.try_write().unwrap();
        let mut second = open_lock(&path).unwrap();
        assert!(second.try_write().is_err());
    }
}
