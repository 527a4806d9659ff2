use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use shared::protocol::PUSHER_PROTOCOL_VERSION;

pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse settings file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ws,
    Wss,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSettings {
    pub app_key: String,
    pub host: String,
    pub ws_port: u16,
    pub wss_port: u16,
    pub force_tls: bool,
    pub enabled_transports: Vec<TransportKind>,
    pub auth_endpoint: String,
    pub api_base_url: String,
    pub handshake_timeout_ms: u64,
    pub typing_expiry_ms: u64,
    pub reconnect: ReconnectSettings,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            app_key: "app-key".into(),
            host: "localhost".into(),
            ws_port: 8080,
            wss_port: 443,
            force_tls: false,
            enabled_transports: vec![TransportKind::Ws, TransportKind::Wss],
            auth_endpoint: "http://localhost:8000/broadcasting/auth".into(),
            api_base_url: "http://localhost:8000/api".into(),
            handshake_timeout_ms: 10_000,
            typing_expiry_ms: 5_000,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl BroadcastSettings {
    pub fn use_tls(&self) -> bool {
        self.force_tls || !self.enabled_transports.contains(&TransportKind::Ws)
    }

    pub fn websocket_url(&self) -> Result<Url, SettingsError> {
        let (scheme, port) = if self.use_tls() {
            ("wss", self.wss_port)
        } else {
            ("ws", self.ws_port)
        };
        let raw = format!(
            "{scheme}://{}:{port}/app/{}?protocol={PUSHER_PROTOCOL_VERSION}&client=rust&version={}&flash=false",
            self.host,
            self.app_key,
            env!("CARGO_PKG_VERSION"),
        );
        Url::parse(&raw).map_err(|err| SettingsError::Invalid(format!("websocket url '{raw}': {err}")))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.app_key.trim().is_empty() {
            return Err(SettingsError::Invalid("app_key must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(SettingsError::Invalid("host must not be empty".into()));
        }
        if self.enabled_transports.is_empty() {
            return Err(SettingsError::Invalid(
                "at least one transport must be enabled".into(),
            ));
        }
        for (name, value) in [
            ("auth_endpoint", &self.auth_endpoint),
            ("api_base_url", &self.api_base_url),
        ] {
            Url::parse(value)
                .map_err(|err| SettingsError::Invalid(format!("{name} '{value}': {err}")))?;
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return Err(SettingsError::Invalid(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms".into(),
            ));
        }
        self.websocket_url().map(|_| ())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    app_key: Option<String>,
    host: Option<String>,
    ws_port: Option<u16>,
    wss_port: Option<u16>,
    force_tls: Option<bool>,
    enabled_transports: Option<Vec<TransportKind>>,
    auth_endpoint: Option<String>,
    api_base_url: Option<String>,
    handshake_timeout_ms: Option<u64>,
    typing_expiry_ms: Option<u64>,
    reconnect: Option<ReconnectSettings>,
}

/// Loads settings from `path` (or `chat.toml` when present) and the process
/// environment.
pub fn load_settings(path: Option<&Path>) -> Result<BroadcastSettings, SettingsError> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

pub fn load_settings_with(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BroadcastSettings, SettingsError> {
    let mut settings = BroadcastSettings::default();

    let file_path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    match fs::read_to_string(file_path) {
        Ok(raw) => {
            let file_cfg: FileSettings =
                toml::from_str(&raw).map_err(|source| SettingsError::Parse {
                    path: file_path.display().to_string(),
                    source,
                })?;
            apply_file(&mut settings, file_cfg);
        }
        // A missing default file is fine; an explicitly requested one is not.
        Err(err) if path.is_none() && err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SettingsError::Read {
                path: file_path.display().to_string(),
                source,
            })
        }
    }

    apply_env(&mut settings, &env)?;
    settings.validate()?;
    Ok(settings)
}

fn apply_file(settings: &mut BroadcastSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.app_key {
        settings.app_key = v;
    }
    if let Some(v) = file_cfg.host {
        settings.host = v;
    }
    if let Some(v) = file_cfg.ws_port {
        settings.ws_port = v;
    }
    if let Some(v) = file_cfg.wss_port {
        settings.wss_port = v;
    }
    if let Some(v) = file_cfg.force_tls {
        settings.force_tls = v;
    }
    if let Some(v) = file_cfg.enabled_transports {
        settings.enabled_transports = v;
    }
    if let Some(v) = file_cfg.auth_endpoint {
        settings.auth_endpoint = v;
    }
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.handshake_timeout_ms {
        settings.handshake_timeout_ms = v;
    }
    if let Some(v) = file_cfg.typing_expiry_ms {
        settings.typing_expiry_ms = v;
    }
    if let Some(v) = file_cfg.reconnect {
        settings.reconnect = v;
    }
}

fn lookup(env: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter().rev().find_map(|key| env(key))
}

fn parse_port(keys: &[&str], raw: &str) -> Result<u16, SettingsError> {
    raw.trim()
        .parse()
        .map_err(|_| SettingsError::Invalid(format!("{} must be a port number, got '{raw}'", keys[0])))
}

fn apply_env(
    settings: &mut BroadcastSettings,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<(), SettingsError> {
    // Later keys in each list take precedence.
    if let Some(v) = lookup(env, &["REVERB_APP_KEY", "APP__APP_KEY"]) {
        settings.app_key = v;
    }
    if let Some(v) = lookup(env, &["REVERB_HOST", "APP__HOST"]) {
        settings.host = v;
    }
    let ws_keys = ["REVERB_PORT", "APP__WS_PORT"];
    if let Some(v) = lookup(env, &ws_keys) {
        settings.ws_port = parse_port(&ws_keys, &v)?;
    }
    let wss_keys = ["REVERB_WSS_PORT", "APP__WSS_PORT"];
    if let Some(v) = lookup(env, &wss_keys) {
        settings.wss_port = parse_port(&wss_keys, &v)?;
    }
    if let Some(v) = lookup(env, &["REVERB_SCHEME", "APP__SCHEME"]) {
        settings.force_tls = v.trim().eq_ignore_ascii_case("https");
    }
    if let Some(v) = lookup(env, &["CHAT_AUTH_ENDPOINT", "APP__AUTH_ENDPOINT"]) {
        settings.auth_endpoint = v;
    }
    if let Some(v) = lookup(env, &["CHAT_API_URL", "APP__API_BASE_URL"]) {
        settings.api_base_url = v;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
