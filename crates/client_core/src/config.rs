use std::{collections::HashMap, fs, path::Path};

use anyhow::{anyhow, Context, Result};
use shared::domain::UserId;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_url: String,
    /// Base of the realtime channel; the API origin when unset.
    pub socket_url: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5001/api".into(),
            socket_url: None,
        }
    }
}

impl ClientSettings {
    pub fn socket_base(&self) -> Result<String> {
        if let Some(socket_url) = &self.socket_url {
            return Ok(socket_url.trim_end_matches('/').to_string());
        }
        let api = Url::parse(&self.api_url)
            .with_context(|| format!("invalid api_url '{}'", self.api_url))?;
        Ok(api.origin().ascii_serialization())
    }

    pub fn websocket_url(&self, user_id: &UserId) -> Result<Url> {
        let base = self.socket_base()?;
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base
        } else {
            return Err(anyhow!("socket_url must start with http:// or https://"));
        };
        let mut url = Url::parse(&format!("{ws_base}/socket"))
            .with_context(|| format!("invalid socket url '{ws_base}'"))?;
        url.query_pairs_mut().append_pair("userId", user_id.as_str());
        Ok(url)
    }
}

/// Defaults, then the flat TOML file at `path` (if readable), then the environment.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let file_cfg = read_settings_file(path);
    apply_overrides(ClientSettings::default(), &file_cfg, |key| {
        std::env::var(key).ok()
    })
}

fn read_settings_file(path: &Path) -> HashMap<String, String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| toml::from_str::<HashMap<String, String>>(&raw).ok())
        .unwrap_or_default()
}

fn apply_overrides(
    mut settings: ClientSettings,
    file_cfg: &HashMap<String, String>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    if let Some(v) = file_cfg.get("api_url") {
        settings.api_url = v.clone();
    }
    if let Some(v) = file_cfg.get("socket_url") {
        settings.socket_url = Some(v.clone());
    }

    for key in ["CHAT_API_URL", "APP__API_URL"] {
        if let Some(v) = env(key) {
            settings.api_url = v;
        }
    }
    for key in ["CHAT_SOCKET_URL", "APP__SOCKET_URL"] {
        if let Some(v) = env(key) {
            settings.socket_url = Some(v);
        }
    }

    settings
}
