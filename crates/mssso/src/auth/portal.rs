//! Gateway addresses and the URL each protocol's SAML flow starts from.

use super::page::AuthPage;
use crate::profile::Protocol;
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use url::Url;

/// Parsed VPN server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub host: String,
    /// `host[:port]`
    pub netloc: String,
    /// Original address with a scheme, as passed to the VPN client.
    pub url: String,
}

impl Gateway {
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("https://{}", address)
        };
        let url = Url::parse(&with_scheme).with_context(|| format!("invalid server address '{}'", address))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("server address '{}' has no host", address))?
            .to_ascii_lowercase();
        let netloc = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        Ok(Self {
            host,
            netloc,
            url: with_scheme,
        })
    }

    /// True when `page_url` is served by this gateway (or its resolved IP).
    pub fn owns_url(&self, page_url: &str, gateway_ip: Option<&str>) -> bool {
        let Ok(parsed) = Url::parse(page_url) else {
            return false;
        };
        match parsed.host_str() {
            Some(h) => h.eq_ignore_ascii_case(&self.host) || gateway_ip.is_some_and(|ip| h == ip),
            None => false,
        }
    }

    pub fn anyconnect_login_url(&self) -> String {
        format!(
            "https://{}/+CSCOE+/saml/sp/login?tgname=DefaultWEBVPNGroup",
            self.netloc
        )
    }

    pub fn gp_prelogin_url(&self) -> String {
        format!(
            "https://{}/global-protect/prelogin.esp?tmp=tmp&clientVer=4100&clientos=Linux",
            self.netloc
        )
    }
}

/// Fields of a GlobalProtect `prelogin.esp` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prelogin {
    pub saml_request: Option<String>,
    pub prelogin_cookie: Option<String>,
    pub server_ip: Option<String>,
}

fn tag(source: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"<{0}>\s*(?:<!\[CDATA\[)?([^<\]]*)(?:\]\]>)?\s*</{0}>", regex::escape(name))).ok()?;
    re.captures(source)
        .map(|c| c[1].trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_prelogin(source: &str) -> Prelogin {
    Prelogin {
        saml_request: tag(source, "saml-request"),
        prelogin_cookie: tag(source, "prelogin-cookie"),
        server_ip: tag(source, "server-ip"),
    }
}

/// Turns a base64 `saml-request` into something the browser can open.
///
/// REDIRECT binding yields a URL; POST binding yields an auto-submitting HTML
/// form, which is opened as a data URL.
pub fn saml_start_url(saml_request: &str) -> Option<String> {
    let decoded = STANDARD.decode(saml_request.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let text = text.trim();
    if text.starts_with("http://") || text.starts_with("https://") {
        Some(text.to_string())
    } else if text.contains("<form") || text.contains("<html") {
        Some(format!("data:text/html;base64,{}", saml_request.trim()))
    } else {
        None
    }
}

/// Where the login starts, plus anything learned on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalTarget {
    pub start_url: String,
    pub prelogin_cookie: Option<String>,
    pub gateway_ip: Option<String>,
    /// False when the portal handed out a prelogin cookie without asking for SAML.
    pub needs_login: bool,
}

/// Resolves the start URL; for GlobalProtect this loads `prelogin.esp` first.
pub fn resolve_target(page: &dyn AuthPage, gateway: &Gateway, protocol: Protocol) -> PortalTarget {
    match protocol {
        Protocol::AnyConnect => PortalTarget {
            start_url: gateway.anyconnect_login_url(),
            prelogin_cookie: None,
            gateway_ip: None,
            needs_login: true,
        },
        Protocol::GlobalProtect => {
            let prelogin = fetch_prelogin(page, gateway).unwrap_or_else(|e| {
                log::warn!("[!] GlobalProtect prelogin failed: {:#}", e);
                Prelogin::default()
            });
            let needs_login =
                prelogin.saml_request.is_some() || prelogin.prelogin_cookie.is_none();
            let start_url = prelogin
                .saml_request
                .as_deref()
                .and_then(saml_start_url)
                .unwrap_or_else(|| format!("https://{}", gateway.netloc));
            PortalTarget {
                start_url,
                prelogin_cookie: prelogin.prelogin_cookie,
                gateway_ip: prelogin.server_ip,
                needs_login,
            }
        }
    }
}

fn fetch_prelogin(page: &dyn AuthPage, gateway: &Gateway) -> Result<Prelogin> {
    let url = gateway.gp_prelogin_url();
    log::info!("[*] Fetching GlobalProtect prelogin: {}", url);
    page.navigate(&url)?;
    let source = page.page_source()?;
    let prelogin = parse_prelogin(&source);
    log::debug!(
        "prelogin: saml-request={} prelogin-cookie={} server-ip={:?}",
        prelogin.saml_request.is_some(),
        prelogin.prelogin_cookie.is_some(),
        prelogin.server_ip
    );
    Ok(prelogin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_parsing() {
        let gw = Gateway::parse("VPN.Example.com").unwrap();
        assert_eq!(gw.host, "vpn.example.com");
        assert_eq!(gw.netloc, "vpn.example.com");
        assert_eq!(gw.url, "https://VPN.Example.com");

        let gw = Gateway::parse("https://vpn.example.com:8443/engineering").unwrap();
        assert_eq!(gw.netloc, "vpn.example.com:8443");
        assert!(Gateway::parse("https://").is_err());
    }

    #[test]
    fn anyconnect_start_url() {
        let gw = Gateway::parse("vpn.example.com").unwrap();
        assert_eq!(
            gw.anyconnect_login_url(),
            "https://vpn.example.com/+CSCOE+/saml/sp/login?tgname=DefaultWEBVPNGroup"
        );
    }

    #[test]
    fn url_ownership() {
        let gw = Gateway::parse("vpn.example.com").unwrap();
        assert!(gw.owns_url("https://vpn.example.com/+webvpn+/index.html", None));
        assert!(!gw.owns_url("https://login.microsoftonline.com/common", None));
        assert!(gw.owns_url("https://10.0.0.5/SAML20/SP/ACS", Some("10.0.0.5")));
        assert!(!gw.owns_url("about:blank", None));
    }

    #[test]
    fn prelogin_xml_is_parsed() {
        let redirect = STANDARD.encode("https://login.microsoftonline.com/tenant/saml2?SAMLRequest=abc");
        let xml = format!(
            "<prelogin-response><status>Success</status><saml-auth-method>REDIRECT</saml-auth-method>\
             <saml-request>{}</saml-request><server-ip>192.0.2.10</server-ip></prelogin-response>",
            redirect
        );
        let prelogin = parse_prelogin(&xml);
        assert_eq!(prelogin.server_ip.as_deref(), Some("192.0.2.10"));
        assert!(prelogin.prelogin_cookie.is_none());
        assert_eq!(
            saml_start_url(prelogin.saml_request.as_deref().unwrap()).as_deref(),
            Some("https://login.microsoftonline.com/tenant/saml2?SAMLRequest=abc")
        );
    }

    #[test]
    fn post_binding_becomes_data_url() {
        let form = STANDARD.encode("<html><body><form method=\"POST\" action=\"https://idp\"></form></body></html>");
        let url = saml_start_url(&form).unwrap();
        assert!(url.starts_with("data:text/html;base64,"));
        assert!(saml_start_url("!!!").is_none());
    }
}
