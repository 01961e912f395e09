//! Cookie bundles: what the SSO flow produces and the VPN client consumes.

use crate::profile::Protocol;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// GlobalProtect auth artefacts that are kept regardless of cookie domain.
const GP_AUTH_NAMES: &[&str] = &[
    "portal-userauthcookie",
    "portal-prelogonuserauthcookie",
    "user",
    "prelogin-cookie",
];

const ANYCONNECT_REQUIRED: &[&str] = &["webvpn", "svpncookie", "samlresponse"];
const GP_REQUIRED: &[&str] = &["prelogin-cookie", "portal-userauthcookie"];

/// Usergroup passed to the GlobalProtect client for each kind of credential.
pub const GP_GROUP_PRELOGIN: &str = "portal:prelogin-cookie";
pub const GP_GROUP_PORTAL: &str = "portal:portal-userauthcookie";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieBundle {
    pub protocol: Protocol,
    pub cookies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usergroup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<String>,
}

/// The single credential handed to the VPN client, plus the GP usergroup it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredential {
    pub value: String,
    pub usergroup: Option<String>,
}

impl CookieBundle {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            cookies: BTreeMap::new(),
            usergroup: None,
            gateway_ip: None,
        }
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts a cookie unless its value is empty or the GP placeholder `empty`.
    pub fn insert(&mut self, name: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("empty") {
            return;
        }
        self.cookies.insert(name.to_string(), value.to_string());
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Checks that the minimum credential for the protocol is present.
    pub fn validate(&self) -> Result<(), String> {
        let required = match self.protocol {
            Protocol::AnyConnect => ANYCONNECT_REQUIRED,
            Protocol::GlobalProtect => GP_REQUIRED,
        };
        if required.iter().any(|name| self.get(name).is_some()) {
            Ok(())
        } else {
            Err(format!(
                "no {} session cookie found (need one of: {}; have: {})",
                self.protocol.display_name(),
                required.join(", "),
                self.names().join(", ")
            ))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Cookie names only, for logging.
    pub fn names(&self) -> Vec<&str> {
        self.cookies.keys().map(|k| k.as_str()).collect()
    }

    /// `k=v; k=v` form accepted by `openconnect --cookie`.
    pub fn combined(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Picks the value to feed to the client.
    ///
    /// AnyConnect prefers `webvpn`, then `SVPNCOOKIE`, then `session_token`,
    /// falling back to every cookie combined. GlobalProtect honours a cached
    /// usergroup first, then walks the known SAML artefacts in order.
    pub fn client_credential(&self) -> ClientCredential {
        match self.protocol {
            Protocol::AnyConnect => {
                let value = ["webvpn", "SVPNCOOKIE", "session_token"]
                    .iter()
                    .find_map(|name| self.get(name))
                    .map(str::to_string)
                    .unwrap_or_else(|| self.combined());
                ClientCredential {
                    value,
                    usergroup: None,
                }
            }
            Protocol::GlobalProtect => self.gp_credential(),
        }
    }

    fn gp_credential(&self) -> ClientCredential {
        let pick = |value: Option<&str>, group: &str| {
            value.map(|v| ClientCredential {
                value: v.to_string(),
                usergroup: Some(group.to_string()),
            })
        };

        if let Some(cached) = &self.usergroup {
            let value = self
                .get("portal-userauthcookie")
                .or_else(|| self.get("prelogin-cookie"))
                .map(str::to_string)
                .unwrap_or_else(|| self.combined());
            return ClientCredential {
                value,
                usergroup: Some(cached.clone()),
            };
        }

        pick(self.get("prelogin-cookie"), GP_GROUP_PRELOGIN)
            .or_else(|| pick(self.get("portal-userauthcookie"), GP_GROUP_PORTAL))
            .or_else(|| pick(self.get("SAMLResponse"), "prelogin-cookie"))
            .or_else(|| pick(self.get("SESSID"), "portal-userauthcookie"))
            .unwrap_or_else(|| ClientCredential {
                value: self.combined(),
                usergroup: Some("portal-userauthcookie".to_string()),
            })
    }
}

pub fn is_gp_auth_cookie(name: &str) -> bool {
    GP_AUTH_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name))
}

/// True when a browser cookie's domain belongs to the VPN host.
pub fn domain_matches(cookie_domain: &str, host: &str, gateway_ip: Option<&str>) -> bool {
    let domain = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    let host = host.to_ascii_lowercase();
    domain == host
        || host.ends_with(&format!(".{}", domain))
        || gateway_ip.is_some_and(|ip| domain == ip)
}

/// A cookie as read from the browser.
#[derive(Debug, Clone)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Keeps cookies scoped to the VPN host plus GP artefacts from any domain.
pub fn collect_vpn_cookies(
    protocol: Protocol,
    host: &str,
    gateway_ip: Option<&str>,
    cookies: &[BrowserCookie],
) -> CookieBundle {
    let mut bundle = CookieBundle::new(protocol);
    bundle.gateway_ip = gateway_ip.map(str::to_string);
    for c in cookies {
        let keep = domain_matches(&c.domain, host, gateway_ip)
            || (protocol == Protocol::GlobalProtect && is_gp_auth_cookie(&c.name));
        if keep {
            bundle.insert(&c.name, &c.value);
        }
    }
    bundle
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<(prelogin-cookie|saml-username|portal-userauthcookie|saml-auth-status)>\s*([^<\s]*)\s*</")
            .expect("static regex")
    })
}

fn saml_input_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"name=["']SAMLResponse["'][^>]*value=["']([^"']+)["']"#).expect("static regex")
    })
}

/// Extracts SAML result markers from a portal page.
///
/// GlobalProtect portals echo `<prelogin-cookie>` and friends in the final
/// page body; SAML POST-binding pages carry a hidden `SAMLResponse` input.
pub fn parse_page_markers(source: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for cap in marker_regex().captures_iter(source) {
        let value = cap[2].trim();
        if !value.is_empty() && !value.eq_ignore_ascii_case("empty") {
            out.insert(cap[1].to_string(), value.to_string());
        }
    }
    if let Some(cap) = saml_input_regex().captures(source) {
        out.insert("SAMLResponse".to_string(), cap[1].to_string());
    }
    out
}

/// Merges page markers into a bundle; `saml-auth-status` is informational only.
pub fn merge_page_markers(bundle: &mut CookieBundle, markers: &BTreeMap<String, String>) {
    for (name, value) in markers {
        if name == "saml-auth-status" {
            continue;
        }
        if bundle.get(name).is_none() {
            bundle.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str, domain: &str) -> BrowserCookie {
        BrowserCookie {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
        }
    }

    #[test]
    fn anyconnect_requires_a_session_cookie() {
        let bundle = CookieBundle::new(Protocol::AnyConnect).with_cookie("acSamlv2Token", "x");
        assert!(bundle.validate().is_err());
        assert!(bundle.clone().with_cookie("WEBVPN", "abc").is_valid());
        assert!(bundle.with_cookie("SAMLResponse", "PHNhbWw+").is_valid());
    }

    #[test]
    fn globalprotect_requires_prelogin_or_portal_cookie() {
        let bundle = CookieBundle::new(Protocol::GlobalProtect).with_cookie("SESSID", "s");
        assert!(!bundle.is_valid());
        assert!(bundle.clone().with_cookie("prelogin-cookie", "p").is_valid());
        assert!(bundle.with_cookie("portal-userauthcookie", "q").is_valid());
    }

    #[test]
    fn empty_placeholder_values_are_dropped() {
        let bundle = CookieBundle::new(Protocol::GlobalProtect)
            .with_cookie("portal-userauthcookie", "empty")
            .with_cookie("user", "  ");
        assert!(bundle.is_empty());
    }

    #[test]
    fn anyconnect_credential_priority() {
        let base = CookieBundle::new(Protocol::AnyConnect)
            .with_cookie("session_token", "tok")
            .with_cookie("SVPNCOOKIE", "svpn");
        assert_eq!(base.client_credential().value, "svpn");
        let with_webvpn = base.clone().with_cookie("webvpn", "wv");
        assert_eq!(with_webvpn.client_credential().value, "wv");

        let other = CookieBundle::new(Protocol::AnyConnect)
            .with_cookie("a", "1")
            .with_cookie("b", "2");
        assert_eq!(other.client_credential().value, "a=1; b=2");
    }

    #[test]
    fn globalprotect_credential_selection() {
        let prelogin = CookieBundle::new(Protocol::GlobalProtect)
            .with_cookie("prelogin-cookie", "pre")
            .with_cookie("portal-userauthcookie", "portal");
        let cred = prelogin.client_credential();
        assert_eq!(cred.value, "pre");
        assert_eq!(cred.usergroup.as_deref(), Some(GP_GROUP_PRELOGIN));

        let mut cached = prelogin.clone();
        cached.usergroup = Some(GP_GROUP_PORTAL.into());
        let cred = cached.client_credential();
        assert_eq!(cred.value, "portal");
        assert_eq!(cred.usergroup.as_deref(), Some(GP_GROUP_PORTAL));

        let saml = CookieBundle::new(Protocol::GlobalProtect).with_cookie("SAMLResponse", "resp");
        assert_eq!(saml.client_credential().usergroup.as_deref(), Some("prelogin-cookie"));
    }

    #[test]
    fn domain_matching_rules() {
        assert!(domain_matches(".vpn.example.com", "vpn.example.com", None));
        assert!(domain_matches("example.com", "vpn.example.com", None));
        assert!(!domain_matches("login.microsoftonline.com", "vpn.example.com", None));
        assert!(!domain_matches("ample.com", "vpn.example.com", None));
        assert!(domain_matches("10.1.2.3", "vpn.example.com", Some("10.1.2.3")));
    }

    #[test]
    fn collect_keeps_vpn_and_gp_cookies_only() {
        let jar = vec![
            cookie("webvpn", "wv", "vpn.example.com"),
            cookie("ESTSAUTH", "ms", "login.microsoftonline.com"),
            cookie("prelogin-cookie", "pre", "portal.other.net"),
        ];
        let ac = collect_vpn_cookies(Protocol::AnyConnect, "vpn.example.com", None, &jar);
        assert_eq!(ac.names(), vec!["webvpn"]);

        let gp = collect_vpn_cookies(Protocol::GlobalProtect, "vpn.example.com", Some("10.0.0.1"), &jar);
        assert_eq!(gp.names(), vec!["prelogin-cookie", "webvpn"]);
        assert_eq!(gp.gateway_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn page_markers_are_extracted() {
        let html = r#"<html><!-- <saml-auth-status>1</saml-auth-status>
            <prelogin-cookie>abc123</prelogin-cookie><saml-username>me@corp</saml-username>
            <portal-userauthcookie>empty</portal-userauthcookie> -->
            <form><input type="hidden" name="SAMLResponse" value="PHNhbWw+" /></form></html>"#;
        let markers = parse_page_markers(html);
        assert_eq!(markers.get("prelogin-cookie").map(String::as_str), Some("abc123"));
        assert_eq!(markers.get("saml-username").map(String::as_str), Some("me@corp"));
        assert!(!markers.contains_key("portal-userauthcookie"));
        assert_eq!(markers.get("SAMLResponse").map(String::as_str), Some("PHNhbWw+"));

        let mut bundle = CookieBundle::new(Protocol::GlobalProtect);
        merge_page_markers(&mut bundle, &markers);
        assert!(bundle.is_valid());
        assert!(bundle.get("saml-auth-status").is_none());
    }
}
