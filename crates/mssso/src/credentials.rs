//! Per-connection secrets and profile metadata backed by the platform secret service.

use crate::config::APP_NAME;
use crate::error::VpnError;
use crate::profile::ConnectionProfile;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

const PROFILES_ACCOUNT: &str = "connections";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Password,
    TotpSeed,
}

impl SecretKind {
    fn suffix(&self) -> &'static str {
        match self {
            SecretKind::Password => "password",
            SecretKind::TotpSeed => "totp",
        }
    }
}

/// Opaque key/value secret storage.
pub trait SecretStore: Send + Sync {
    fn get(&self, account: &str) -> Result<Option<String>, VpnError>;
    fn set(&self, account: &str, value: &str) -> Result<(), VpnError>;
    /// Deleting a missing entry is not an error.
    fn delete(&self, account: &str) -> Result<(), VpnError>;
}

/// System keyring (Secret Service on Linux, Keychain on macOS).
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: APP_NAME.to_string(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, VpnError> {
        keyring::Entry::new(&self.service, account).map_err(unavailable)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(err: keyring::Error) -> VpnError {
    VpnError::SecretStoreUnavailable {
        message: err.to_string(),
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, account: &str) -> Result<Option<String>, VpnError> {
        match self.entry(account)?.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn set(&self, account: &str, value: &str) -> Result<(), VpnError> {
        self.entry(account)?.set_password(value).map_err(unavailable)
    }

    fn delete(&self, account: &str) -> Result<(), VpnError> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }
}

/// In-process store for tests and one-shot invocations.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, account: &str) -> Result<Option<String>, VpnError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| poisoned())?
            .get(account)
            .cloned())
    }

    fn set(&self, account: &str, value: &str) -> Result<(), VpnError> {
        self.entries
            .lock()
            .map_err(|_| poisoned())?
            .insert(account.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, account: &str) -> Result<(), VpnError> {
        self.entries.lock().map_err(|_| poisoned())?.remove(account);
        Ok(())
    }
}

fn poisoned() -> VpnError {
    VpnError::SecretStoreUnavailable {
        message: "in-memory store lock poisoned".into(),
    }
}

/// Secrets and named profiles on top of a [`SecretStore`].
///
/// Profiles live in a single JSON document so listing them needs one lookup.
pub struct CredentialStore {
    backend: Box<dyn SecretStore>,
}

impl CredentialStore {
    pub fn new(backend: Box<dyn SecretStore>) -> Self {
        Self { backend }
    }

    pub fn system() -> Self {
        Self::new(Box::new(KeyringStore::new()))
    }

    fn account(name: &str, kind: SecretKind) -> String {
        format!("{}:{}", name, kind.suffix())
    }

    pub fn get_secret(&self, name: &str, kind: SecretKind) -> Result<Option<String>, VpnError> {
        Ok(self
            .backend
            .get(&Self::account(name, kind))?
            .filter(|v| !v.is_empty()))
    }

    pub fn set_secret(&self, name: &str, kind: SecretKind, value: &str) -> Result<(), VpnError> {
        self.backend.set(&Self::account(name, kind), value)
    }

    /// Removes both secrets and the profile for `name`.
    pub fn delete(&self, name: &str) -> Result<(), VpnError> {
        self.backend.delete(&Self::account(name, SecretKind::Password))?;
        self.backend.delete(&Self::account(name, SecretKind::TotpSeed))?;

        let mut all = self.load_profiles()?;
        if all.remove(name).is_some() {
            self.store_profiles(&all)?;
        }
        Ok(())
    }

    fn load_profiles(&self) -> Result<BTreeMap<String, ConnectionProfile>, VpnError> {
        let Some(raw) = self.backend.get(PROFILES_ACCOUNT)? else {
            return Ok(BTreeMap::new());
        };
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                log::warn!("[!] Stored connection list is unreadable, ignoring it: {}", e);
                Ok(BTreeMap::new())
            }
        }
    }

    fn store_profiles(&self, all: &BTreeMap<String, ConnectionProfile>) -> Result<(), VpnError> {
        let json = serde_json::to_string(all).map_err(|e| VpnError::Io {
            message: e.to_string(),
        })?;
        self.backend.set(PROFILES_ACCOUNT, &json)
    }

    pub fn profiles(&self) -> Result<Vec<ConnectionProfile>, VpnError> {
        Ok(self.load_profiles()?.into_values().collect())
    }

    pub fn profile(&self, name: &str) -> Result<ConnectionProfile, VpnError> {
        self.load_profiles()?
            .remove(name)
            .ok_or_else(|| VpnError::ProfileNotFound {
                name: name.to_string(),
            })
    }

    pub fn save_profile(&self, profile: &ConnectionProfile) -> Result<(), VpnError> {
        profile
            .validate()
            .map_err(|reason| VpnError::InvalidProfile { reason })?;
        let mut all = self.load_profiles()?;
        all.insert(profile.name.clone(), profile.clone());
        self.store_profiles(&all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Protocol;

    fn store() -> CredentialStore {
        CredentialStore::new(Box::new(MemoryStore::new()))
    }

    #[test]
    fn secrets_are_scoped_by_connection_and_kind() {
        let creds = store();
        creds.set_secret("work", SecretKind::Password, "hunter2").unwrap();
        creds.set_secret("work", SecretKind::TotpSeed, "JBSWY3DPEHPK3PXP").unwrap();
        creds.set_secret("lab", SecretKind::Password, "other").unwrap();

        assert_eq!(creds.get_secret("work", SecretKind::Password).unwrap().as_deref(), Some("hunter2"));
        assert_eq!(creds.get_secret("lab", SecretKind::Password).unwrap().as_deref(), Some("other"));
        assert_eq!(creds.get_secret("lab", SecretKind::TotpSeed).unwrap(), None);
    }

    #[test]
    fn delete_removes_secrets_and_profile() {
        let creds = store();
        let profile = ConnectionProfile::new("work", "vpn.example.com", Protocol::AnyConnect, "me@example.com");
        creds.save_profile(&profile).unwrap();
        creds.set_secret("work", SecretKind::Password, "pw").unwrap();

        creds.delete("work").unwrap();
        assert!(matches!(creds.profile("work"), Err(VpnError::ProfileNotFound { .. })));
        assert_eq!(creds.get_secret("work", SecretKind::Password).unwrap(), None);
        // deleting again is harmless
        creds.delete("work").unwrap();
    }

    #[test]
    fn profiles_are_listed_by_name() {
        let creds = store();
        creds.save_profile(&ConnectionProfile::new("zeta", "z", Protocol::GlobalProtect, "u")).unwrap();
        creds.save_profile(&ConnectionProfile::new("alpha", "a", Protocol::AnyConnect, "u")).unwrap();
        let names: Vec<_> = creds.profiles().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn invalid_profiles_are_refused() {
        let creds = store();
        let profile = ConnectionProfile::new("x", "", Protocol::AnyConnect, "u");
        assert!(matches!(creds.save_profile(&profile), Err(VpnError::InvalidProfile { .. })));
    }
}
