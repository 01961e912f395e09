//! Line-delimited JSON-RPC 2.0 over a local socket.
//!
//! One request per line, one response per line. The daemon side is
//! [`serve_stream`]; the client side is [`call`] and [`ping`].

use crate::cookies::CookieBundle;
use crate::error::VpnError;
use crate::profile::Protocol;
use crate::supervisor::{ConnectRequest, ConnectResult, Supervisor, SupervisorStatus};
use interprocess::local_socket::{prelude::*, GenericFilePath};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Longest accepted request line, newline included.
pub const MAX_LINE: u64 = 128 * 1024;

const MAX_HOST_LEN: usize = 253;
const MAX_USERNAME_LEN: usize = 254;
const MAX_USERGROUP_LEN: usize = 128;
const MAX_COOKIE_LEN: usize = 64 * 1024;
const MAX_NAME_LEN: usize = 128;

pub fn default_socket_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/var/run/ms-sso-openconnect/daemon.sock")
    } else {
        PathBuf::from("/run/ms-sso-openconnect/daemon.sock")
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: &str, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: Value::from(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub address: String,
    pub protocol: Protocol,
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub no_dtls: bool,
    #[serde(default)]
    pub username: String,
    pub connection_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usergroup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<String>,
    #[serde(default)]
    pub early_started: bool,
}

impl ConnectParams {
    pub fn from_request(request: &ConnectRequest) -> Self {
        Self {
            address: request.address.clone(),
            protocol: request.protocol,
            cookies: request.bundle.cookies.clone(),
            no_dtls: request.no_dtls,
            username: request.username.clone(),
            connection_name: request.connection_name.clone(),
            usergroup: request.bundle.usergroup.clone(),
            gateway_ip: request.bundle.gateway_ip.clone(),
            early_started: request.early_started,
        }
    }

    /// Checks every field a caller controls before anything is spawned.
    pub fn validate(&self) -> Result<(), String> {
        validate_name(&self.connection_name)?;
        validate_address(&self.address)?;
        validate_username(&self.username)?;
        if let Some(group) = &self.usergroup {
            validate_usergroup(group)?;
        }
        if self.cookies.is_empty() {
            return Err("no cookies supplied".into());
        }
        for (name, value) in &self.cookies {
            validate_cookie(name)?;
            validate_cookie(value)?;
        }
        Ok(())
    }

    pub fn into_request(self) -> ConnectRequest {
        let mut bundle = CookieBundle::new(self.protocol);
        for (name, value) in &self.cookies {
            bundle.insert(name, value);
        }
        bundle.usergroup = self.usergroup;
        bundle.gateway_ip = self.gateway_ip;
        ConnectRequest {
            connection_name: self.connection_name,
            address: self.address,
            protocol: self.protocol,
            username: self.username,
            no_dtls: self.no_dtls,
            bundle,
            early_started: self.early_started,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectParams {
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default = "default_true")]
    pub graceful: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusParams {
    #[serde(default)]
    pub connection_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// `connected`, `started` or `already_connected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub stopped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub pong: bool,
    pub version: String,
}

// ── Validation ────────────────────────────────────────────────────────────────

fn host_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][-a-zA-Z0-9.]*[a-zA-Z0-9]$").expect("static regex"))
}

/// Accepts a bare host, `host:port`, or an http(s) URL whose host passes.
pub fn validate_address(address: &str) -> Result<(), String> {
    if address.is_empty() {
        return Err("address is empty".into());
    }
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    };
    let parsed = url::Url::parse(&with_scheme).map_err(|_| "address is not a valid host".to_string())?;
    if !matches!(parsed.scheme(), "https" | "http") {
        return Err("address must use https".into());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() || parsed.query().is_some() {
        return Err("address must not carry credentials or a query".into());
    }
    let host = parsed.host_str().unwrap_or_default();
    if host.len() > MAX_HOST_LEN || !host_regex().is_match(host) {
        return Err("address has an invalid hostname".into());
    }
    Ok(())
}

fn validate_charset(
    what: &str,
    value: &str,
    max: usize,
    allowed: impl Fn(char) -> bool,
) -> Result<(), String> {
    if value.len() > max {
        return Err(format!("{} is longer than {} characters", what, max));
    }
    if !value.chars().all(allowed) {
        return Err(format!("{} contains invalid characters", what));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), String> {
    validate_charset("username", username, MAX_USERNAME_LEN, |c| {
        c.is_ascii_alphanumeric() || "@._-".contains(c)
    })
}

pub fn validate_usergroup(group: &str) -> Result<(), String> {
    validate_charset("usergroup", group, MAX_USERGROUP_LEN, |c| {
        c.is_ascii_alphanumeric() || ":_-".contains(c)
    })
}

pub fn validate_cookie(value: &str) -> Result<(), String> {
    if value.len() > MAX_COOKIE_LEN {
        return Err("cookie is too long".into());
    }
    if value.chars().any(|c| c.is_control()) {
        return Err("cookie contains control characters".into());
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("connection name is empty".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("connection name is longer than {} characters", MAX_NAME_LEN));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("connection name contains control characters".into());
    }
    Ok(())
}

// ── Server side ───────────────────────────────────────────────────────────────

fn params<T: DeserializeOwned + Default>(value: Value) -> Result<T, String> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn to_value<T: Serialize>(id: Value, result: &T) -> RpcResponse {
    match serde_json::to_value(result) {
        Ok(v) => RpcResponse::success(id, v),
        Err(e) => RpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
    }
}

fn connect_outcome(supervisor: &dyn Supervisor, name: &str, result: Result<ConnectResult, VpnError>) -> ConnectOutcome {
    let (state, pid, message) = match result {
        Ok(ConnectResult::Connected { pid }) => ("connected", pid, "Connected"),
        Ok(ConnectResult::Started { pid }) => ("started", pid, "Started"),
        Ok(ConnectResult::AlreadyConnected { pid }) => ("already_connected", pid, "Already connected"),
        Ok(ConnectResult::Failed(err)) | Err(err) => {
            let output = match &err {
                VpnError::CookieRejected { output } | VpnError::ProcessExitedEarly { output, .. } => {
                    output.clone()
                }
                _ => Vec::new(),
            };
            return ConnectOutcome {
                success: false,
                message: err.user_message(),
                error_kind: Some(err.kind().to_string()),
                output,
                ..Default::default()
            };
        }
    };
    ConnectOutcome {
        success: true,
        message: message.to_string(),
        pid: Some(pid),
        state: Some(state.to_string()),
        portal_cookie: supervisor.take_portal_cookie(name),
        ..Default::default()
    }
}

fn dispatch(supervisor: &dyn Supervisor, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    match request.method.as_str() {
        "ping" => to_value(
            id,
            &PingResult {
                pong: true,
                version: VERSION.to_string(),
            },
        ),
        "connect" => {
            let params: ConnectParams = match serde_json::from_value(request.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::failure(id, INVALID_PARAMS, e.to_string()),
            };
            if let Err(reason) = params.validate() {
                log::warn!("[!] Rejected connect request: {}", reason);
                return RpcResponse::failure(id, INVALID_PARAMS, reason);
            }
            let name = params.connection_name.clone();
            log::info!(
                "[*] connect '{}' ({}, cookies: {:?})",
                name,
                params.protocol.display_name(),
                params.cookies.keys().collect::<Vec<_>>()
            );
            let result = supervisor.connect(&params.into_request());
            to_value(id, &connect_outcome(supervisor, &name, result))
        }
        "disconnect" => {
            let params: DisconnectParams = match params(request.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::failure(id, INVALID_PARAMS, e),
            };
            if let Some(name) = &params.connection_name {
                if let Err(reason) = validate_name(name) {
                    return RpcResponse::failure(id, INVALID_PARAMS, reason);
                }
            }
            let result = match supervisor.disconnect(params.connection_name.as_deref(), params.graceful) {
                Ok(report) => ActionResult {
                    success: true,
                    message: report.message,
                    stopped: report.stopped,
                },
                Err(e) => ActionResult {
                    success: false,
                    message: e.user_message(),
                    stopped: 0,
                },
            };
            to_value(id, &result)
        }
        "status" => {
            let params: StatusParams = match params(request.params) {
                Ok(p) => p,
                Err(e) => return RpcResponse::failure(id, INVALID_PARAMS, e),
            };
            to_value(id, &supervisor.status(params.connection_name.as_deref()))
        }
        other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    }
}

/// Parses and answers one request line.
pub fn handle_line(supervisor: &dyn Supervisor, line: &str) -> RpcResponse {
    let value: Value = match serde_json::from_str(line.trim()) {
        Ok(v) => v,
        Err(e) => return RpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e)),
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => return RpcResponse::failure(id, INVALID_REQUEST, format!("Invalid request: {}", e)),
    };
    if request.jsonrpc != "2.0" {
        return RpcResponse::failure(request.id, INVALID_REQUEST, "jsonrpc must be \"2.0\"");
    }
    dispatch(supervisor, request)
}

fn write_response<W: Write>(writer: &mut W, response: &RpcResponse) -> std::io::Result<()> {
    let mut json = serde_json::to_string(response)
        .unwrap_or_else(|_| r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"internal error"},"id":null}"#.to_string());
    json.push('\n');
    writer.write_all(json.as_bytes())?;
    writer.flush()
}

/// Answers requests on `stream` until the peer hangs up or sends an
/// oversized line.
pub fn serve_stream<S: Read + Write>(supervisor: &dyn Supervisor, stream: S) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let read = (&mut reader).take(MAX_LINE).read_line(&mut line)?;
        if read == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') && read as u64 >= MAX_LINE {
            log::warn!("[!] Dropping client: request exceeds {} bytes", MAX_LINE);
            let response = RpcResponse::failure(Value::Null, INVALID_REQUEST, "Request too large");
            return write_response(reader.get_mut(), &response);
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(supervisor, &line);
        write_response(reader.get_mut(), &response)?;
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

fn daemon_error(message: impl Into<String>) -> VpnError {
    VpnError::Daemon {
        message: message.into(),
    }
}

/// Sends one request over an already connected stream and decodes the result.
pub fn call_on<S, P, R>(stream: S, method: &str, params: &P) -> Result<R, VpnError>
where
    S: Read + Write,
    P: Serialize,
    R: DeserializeOwned,
{
    let params = serde_json::to_value(params).map_err(|e| daemon_error(e.to_string()))?;
    let request = RpcRequest::new(method, params, 1);
    let mut json = serde_json::to_string(&request).map_err(|e| daemon_error(e.to_string()))?;
    json.push('\n');

    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(json.as_bytes())
        .map_err(|e| daemon_error(format!("write to daemon: {}", e)))?;

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| daemon_error(format!("read from daemon: {}", e)))?;
    if line.trim().is_empty() {
        return Err(daemon_error("daemon closed the connection"));
    }

    let response: RpcResponse =
        serde_json::from_str(line.trim()).map_err(|e| daemon_error(format!("bad daemon response: {}", e)))?;
    if let Some(err) = response.error {
        return Err(daemon_error(format!("{} ({})", err.message, err.code)));
    }
    let result = response.result.unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| daemon_error(format!("bad {} result: {}", method, e)))
}

/// Connects to the daemon socket and performs one call.
pub fn call<P: Serialize, R: DeserializeOwned>(socket: &Path, method: &str, params: &P) -> Result<R, VpnError> {
    let name = socket
        .to_fs_name::<GenericFilePath>()
        .map_err(|e| daemon_error(format!("bad socket path {}: {}", socket.display(), e)))?;
    let stream = LocalSocketStream::connect(name)
        .map_err(|e| daemon_error(format!("cannot reach daemon at {}: {}", socket.display(), e)))?;
    call_on(stream, method, params)
}

pub fn ping(socket: &Path) -> Result<PingResult, VpnError> {
    if !socket.exists() {
        return Err(daemon_error(format!("{} does not exist", socket.display())));
    }
    let pong: PingResult = call(socket, "ping", &Value::Null)?;
    if !pong.pong {
        return Err(daemon_error("daemon did not answer ping"));
    }
    Ok(pong)
}

/// Status as reported by a daemon; `None` asks for the first live client.
pub fn status(socket: &Path, connection_name: Option<&str>) -> Result<SupervisorStatus, VpnError> {
    call(
        socket,
        "status",
        &StatusParams {
            connection_name: connection_name.map(str::to_string),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::DisconnectReport;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSupervisor {
        connects: Mutex<Vec<ConnectRequest>>,
        reject: bool,
    }

    impl Supervisor for FakeSupervisor {
        fn connect(&self, request: &ConnectRequest) -> Result<ConnectResult, VpnError> {
            self.connects.lock().unwrap().push(request.clone());
            if self.reject {
                return Ok(ConnectResult::Failed(VpnError::CookieRejected {
                    output: vec!["Got HTTP/1.1 401".into()],
                }));
            }
            Ok(ConnectResult::Connected { pid: 4242 })
        }

        fn disconnect(&self, name: Option<&str>, _graceful: bool) -> Result<DisconnectReport, VpnError> {
            Ok(DisconnectReport {
                stopped: usize::from(name.is_some()),
                message: "done".into(),
            })
        }

        fn status(&self, name: Option<&str>) -> SupervisorStatus {
            match name {
                Some(n) => SupervisorStatus {
                    connected: true,
                    connection_name: Some(n.to_string()),
                    pid: Some(4242),
                },
                None => SupervisorStatus::default(),
            }
        }

        fn take_portal_cookie(&self, _name: &str) -> Option<String> {
            Some("PORTAL".into())
        }
    }

    fn connect_line(address: &str, username: &str) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "connect",
            "id": 7,
            "params": {
                "address": address,
                "protocol": "anyconnect",
                "cookies": {"webvpn": "abc"},
                "username": username,
                "connection_name": "work",
            }
        })
        .to_string()
    }

    #[test]
    fn ping_reports_version() {
        let sup = FakeSupervisor::default();
        let resp = handle_line(&sup, r#"{"jsonrpc":"2.0","method":"ping","id":1}"#);
        let pong: PingResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(pong.pong);
        assert_eq!(pong.version, VERSION);
        assert_eq!(resp.id, Value::from(1));
    }

    #[test]
    fn protocol_errors_use_jsonrpc_codes() {
        let sup = FakeSupervisor::default();
        assert_eq!(handle_line(&sup, "{not json").error.unwrap().code, PARSE_ERROR);
        assert_eq!(
            handle_line(&sup, r#"{"jsonrpc":"1.0","method":"ping","id":1}"#).error.unwrap().code,
            INVALID_REQUEST
        );
        assert_eq!(
            handle_line(&sup, r#"{"jsonrpc":"2.0","id":1}"#).error.unwrap().code,
            INVALID_REQUEST
        );
        assert_eq!(
            handle_line(&sup, r#"{"jsonrpc":"2.0","method":"reboot","id":1}"#).error.unwrap().code,
            METHOD_NOT_FOUND
        );
        assert_eq!(
            handle_line(&sup, r#"{"jsonrpc":"2.0","method":"connect","params":{},"id":1}"#)
                .error
                .unwrap()
                .code,
            INVALID_PARAMS
        );
    }

    #[test]
    fn idle_status_matches_wire_shape() {
        let sup = FakeSupervisor::default();
        let resp = handle_line(&sup, r#"{"jsonrpc":"2.0","method":"status","id":3}"#);
        assert_eq!(
            resp.result.unwrap(),
            serde_json::json!({"connected": false, "connection_name": null, "pid": null})
        );
    }

    #[test]
    fn connect_forwards_validated_request() {
        let sup = FakeSupervisor::default();
        let resp = handle_line(&sup, &connect_line("vpn.example.com", "me@example.com"));
        let outcome: ConnectOutcome = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.pid, Some(4242));
        assert_eq!(outcome.state.as_deref(), Some("connected"));
        assert_eq!(outcome.portal_cookie.as_deref(), Some("PORTAL"));

        let seen = sup.connects.lock().unwrap();
        assert_eq!(seen[0].connection_name, "work");
        assert_eq!(seen[0].bundle.get("webvpn"), Some("abc"));
    }

    #[test]
    fn shell_metacharacters_are_rejected_before_connecting() {
        let sup = FakeSupervisor::default();
        for (address, username) in [
            ("vpn.example.com;reboot", "me"),
            ("$(id).example.com", "me"),
            ("vpn.example.com", "me;rm -rf /"),
            ("vpn.example.com", "`id`"),
            ("-oProxyCommand=x", "me"),
        ] {
            let resp = handle_line(&sup, &connect_line(address, username));
            assert_eq!(resp.error.unwrap().code, INVALID_PARAMS, "{} / {}", address, username);
        }
        assert!(sup.connects.lock().unwrap().is_empty());
    }

    #[test]
    fn business_failure_is_a_result_not_an_error() {
        let sup = FakeSupervisor {
            reject: true,
            ..Default::default()
        };
        let resp = handle_line(&sup, &connect_line("vpn.example.com", "me"));
        assert!(resp.error.is_none());
        let outcome: ConnectOutcome = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind.as_deref(), Some("CookieRejected"));
        assert_eq!(outcome.output, vec!["Got HTTP/1.1 401".to_string()]);
    }

    #[test]
    fn validators() {
        assert!(validate_address("vpn.example.com").is_ok());
        assert!(validate_address("https://vpn.example.com:8443/group").is_ok());
        assert!(validate_address("").is_err());
        assert!(validate_address(&format!("{}.com", "a".repeat(260))).is_err());
        assert!(validate_usergroup("portal:prelogin-cookie").is_ok());
        assert!(validate_usergroup("portal prelogin").is_err());
        assert!(validate_cookie("abc=def; x").is_ok());
        assert!(validate_cookie("abc\ndef").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"n".repeat(129)).is_err());
    }

    #[test]
    fn stream_round_trip_over_socket_pair() {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let sup = FakeSupervisor::default();
            serve_stream(&sup, server).unwrap();
        });

        let status: SupervisorStatus = call_on(
            &client,
            "status",
            &StatusParams {
                connection_name: Some("work".into()),
            },
        )
        .unwrap();
        assert!(status.connected);
        assert_eq!(status.pid, Some(4242));

        let report: ActionResult = call_on(&client, "disconnect", &DisconnectParams::default()).unwrap();
        assert!(report.success);

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn oversized_line_is_refused() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let sup = FakeSupervisor::default();
            serve_stream(&sup, server).unwrap();
        });
        let writer = std::thread::spawn({
            let mut client = client.try_clone().unwrap();
            move || {
                let _ = client.write_all(&vec![b'x'; MAX_LINE as usize + 10]);
            }
        });

        let mut line = String::new();
        BufReader::new(&mut client).read_line(&mut line).unwrap();
        let resp: RpcResponse = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);
        handle.join().unwrap();
        drop(client);
        let _ = writer.join();
    }
}
