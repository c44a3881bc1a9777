use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::{connection::ConnectionOptions, reconnect::ReconnectPolicy};

pub const DEFAULT_SETTINGS_FILE: &str = "chat_sync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub socket_path: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter: bool,
    pub handshake_timeout_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            socket_path: "/ws".into(),
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_jitter: true,
            handshake_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
        }
    }
}

impl Settings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts.max(1),
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(
                self.reconnect_max_delay_ms.max(self.reconnect_base_delay_ms),
            ),
            jitter: self.reconnect_jitter,
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            reconnect: self.reconnect_policy(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Websocket endpoint derived from the REST base url.
    pub fn socket_url(&self) -> Result<String> {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if base.starts_with("https://") {
            base.replacen("https://", "wss://", 1)
        } else if base.starts_with("http://") {
            base.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let path = self.socket_path.trim();
        if path.is_empty() {
            return Ok(ws_base);
        }
        if path.starts_with('/') {
            Ok(format!("{ws_base}{path}"))
        } else {
            Ok(format!("{ws_base}/{path}"))
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the flat toml file, then environment overrides.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            let values = file_cfg
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    (key, value)
                })
                .collect::<HashMap<_, _>>();
            apply_overrides(&mut settings, |key| values.get(key).cloned());
        }
    }

    apply_overrides(&mut settings, |key| {
        let upper = key.to_ascii_uppercase();
        env(&format!("APP__{upper}")).or_else(|| env(&format!("CHAT_SYNC_{upper}")))
    });

    settings
}

fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("socket_path") {
        settings.socket_path = v;
    }
    if let Some(v) = lookup("max_reconnect_attempts").and_then(|v| v.parse().ok()) {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = lookup("reconnect_base_delay_ms").and_then(|v| v.parse().ok()) {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = lookup("reconnect_max_delay_ms").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = lookup("reconnect_jitter").and_then(|v| v.parse().ok()) {
        settings.reconnect_jitter = v;
    }
    if let Some(v) = lookup("handshake_timeout_ms").and_then(|v| v.parse().ok()) {
        settings.handshake_timeout_ms = v;
    }
    if let Some(v) = lookup("ack_timeout_ms").and_then(|v| v.parse().ok()) {
        settings.ack_timeout_ms = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
