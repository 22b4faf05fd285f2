use std::{fs, path::Path};

use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::{error::ConfigError, state::PendingLivePolicy};

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// Defaults to the api origin with a websocket scheme and `/ws` path.
    pub push_url: Option<String>,
    pub notification_capacity: usize,
    pub pending_live_policy: PendingLivePolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5001/api".into(),
            push_url: None,
            notification_capacity: 256,
            pending_live_policy: PendingLivePolicy::Drop,
        }
    }
}

impl ClientSettings {
    pub fn push_url(&self) -> Result<Url, ConfigError> {
        if let Some(raw) = &self.push_url {
            return Url::parse(raw).map_err(|err| ConfigError::InvalidApiUrl {
                url: raw.clone(),
                reason: err.to_string(),
            });
        }

        let invalid = |reason: &str| ConfigError::InvalidApiUrl {
            url: self.api_base_url.clone(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(&self.api_base_url).map_err(|err| invalid(&err.to_string()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(invalid("api url must start with http:// or https://")),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot derive websocket scheme"))?;
        url.set_path("/ws");
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

/// Defaults, then `path` if it exists, then environment overrides.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("config: failed to parse {}: {err}", path.display());
                ClientSettings::default()
            }
        },
        Err(_) => {
            info!("config: {} not found; using defaults", path.display());
            ClientSettings::default()
        }
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = var("CHAT_PUSH_URL") {
        settings.push_url = Some(v);
    }
    if let Some(v) = var("APP__PUSH_URL") {
        settings.push_url = Some(v);
    }

    if let Some(v) = var("APP__NOTIFICATION_CAPACITY") {
        match v.parse::<usize>() {
            Ok(parsed) if parsed > 0 => settings.notification_capacity = parsed,
            _ => warn!("config: ignoring invalid APP__NOTIFICATION_CAPACITY={v}"),
        }
    }

    if let Some(v) = var("APP__PENDING_LIVE_POLICY") {
        match v.trim().to_ascii_lowercase().as_str() {
            "drop" => settings.pending_live_policy = PendingLivePolicy::Drop,
            "replay" => settings.pending_live_policy = PendingLivePolicy::Replay,
            _ => warn!("config: ignoring invalid APP__PENDING_LIVE_POLICY={v}"),
        }
    }
}
