//! Named connection profiles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// VPN protocol spoken by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "anyconnect")]
    AnyConnect,
    #[serde(rename = "gp")]
    GlobalProtect,
}

impl Protocol {
    /// Value passed to `openconnect --protocol=`.
    pub fn client_flag(&self) -> &'static str {
        match self {
            Protocol::AnyConnect => "anyconnect",
            Protocol::GlobalProtect => "gp",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Protocol::AnyConnect => "Cisco AnyConnect",
            Protocol::GlobalProtect => "GlobalProtect",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.client_flag())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anyconnect" | "cisco" => Ok(Protocol::AnyConnect),
            "gp" | "globalprotect" => Ok(Protocol::GlobalProtect),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Per-connection overrides for cache behaviour. `None` defers to the global setting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gp_cookie_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gp_early_started: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub address: String,
    pub protocol: Protocol,
    pub username: String,
    #[serde(default)]
    pub no_dtls: bool,
    #[serde(default)]
    pub flags: ProfileFlags,
}

impl ConnectionProfile {
    pub fn new(name: &str, address: &str, protocol: Protocol, username: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            protocol,
            username: username.to_string(),
            no_dtls: false,
            flags: ProfileFlags::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("connection name is empty".into());
        }
        if self.address.trim().is_empty() {
            return Err("server address is empty".into());
        }
        if self.username.trim().is_empty() {
            return Err("username is empty".into());
        }
        Ok(())
    }
}
