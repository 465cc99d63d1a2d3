use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::{
    consts::{
        CHANNEL_BACKOFF_INITIAL_SECS, CHANNEL_BACKOFF_MAX_SECS, CHANNEL_CONNECT_TIMEOUT_SECS,
        CHANNEL_MAX_MISSED_PONGS, CHANNEL_PATH, CHANNEL_PING_INTERVAL_SECS,
        DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_TOKEN_EXPIRY_SKEW_SECS,
    },
    error::SettingsError,
};

const ENV_API_URL: &str = "SESSION_LINK_API_URL";
const ENV_CHANNEL_URL: &str = "SESSION_LINK_CHANNEL_URL";
const ENV_REQUEST_TIMEOUT: &str = "SESSION_LINK_REQUEST_TIMEOUT_SECS";
const ENV_PING_INTERVAL: &str = "SESSION_LINK_PING_INTERVAL_SECS";
const ENV_BACKOFF_MAX: &str = "SESSION_LINK_BACKOFF_MAX_SECS";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// Derived from `api_base_url` when empty.
    pub channel_url: Option<String>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub max_missed_pongs: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    pub token_expiry_skew_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            channel_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: CHANNEL_CONNECT_TIMEOUT_SECS,
            ping_interval_secs: CHANNEL_PING_INTERVAL_SECS,
            max_missed_pongs: CHANNEL_MAX_MISSED_PONGS,
            backoff_initial_secs: CHANNEL_BACKOFF_INITIAL_SECS,
            backoff_max_secs: CHANNEL_BACKOFF_MAX_SECS,
            token_expiry_skew_secs: DEFAULT_TOKEN_EXPIRY_SKEW_SECS,
        }
    }
}

impl ClientSettings {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).map_err(|error| SettingsError::Read(error.to_string()))?;
        serde_json::from_str::<Self>(&content).map_err(|error| SettingsError::Parse(error.to_string()))
    }

    /// Overlays `SESSION_LINK_*` variables on top of `self`.
    pub fn with_env(self) -> Result<Self, SettingsError> {
        self.with_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_env() -> Result<Self, SettingsError> {
        Self::default().with_env()
    }

    fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        if let Some(value) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = value;
        }
        if let Some(value) = lookup(ENV_CHANNEL_URL).filter(|v| !v.trim().is_empty()) {
            self.channel_url = Some(value);
        }
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT) {
            self.request_timeout_secs = parse_secs(ENV_REQUEST_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_PING_INTERVAL) {
            self.ping_interval_secs = parse_secs(ENV_PING_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(ENV_BACKOFF_MAX) {
            self.backoff_max_secs = parse_secs(ENV_BACKOFF_MAX, &value)?;
        }
        Ok(self)
    }

    /// Normalizes URLs and clamps timings to usable values.
    pub fn validate(mut self) -> Result<Self, SettingsError> {
        self.api_base_url = normalize_base_url(&self.api_base_url)?;
        self.channel_url = Some(match self.channel_url.as_deref() {
            Some(url) if !url.trim().is_empty() => normalize_channel_url(url)?,
            _ => build_channel_url(&self.api_base_url)?,
        });
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.ping_interval_secs = self.ping_interval_secs.max(1);
        self.max_missed_pongs = self.max_missed_pongs.max(1);
        self.backoff_initial_secs = self.backoff_initial_secs.max(1);
        self.backoff_max_secs = self.backoff_max_secs.max(self.backoff_initial_secs);
        Ok(self)
    }

    pub fn channel_url(&self) -> Result<String, SettingsError> {
        match self.channel_url.as_deref() {
            Some(url) if !url.trim().is_empty() => normalize_channel_url(url),
            _ => build_channel_url(&normalize_base_url(&self.api_base_url)?),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<u64, SettingsError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|error| SettingsError::InvalidValue {
            key,
            reason: format!("{value:?}: {error}"),
        })
}

pub(crate) fn normalize_base_url(input: &str) -> Result<String, SettingsError> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SettingsError::Missing("API base URL"));
    }

    let url = reqwest::Url::parse(trimmed).map_err(|error| SettingsError::InvalidUrl {
        url: trimmed.to_string(),
        reason: error.to_string(),
    })?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(SettingsError::InvalidUrl {
            url: trimmed.to_string(),
            reason: "must start with http:// or https://".to_string(),
        });
    }

    Ok(trimmed.to_string())
}

fn normalize_channel_url(input: &str) -> Result<String, SettingsError> {
    let trimmed = input.trim();
    let url = reqwest::Url::parse(trimmed).map_err(|error| SettingsError::InvalidUrl {
        url: trimmed.to_string(),
        reason: error.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url.to_string()),
        _ => Err(SettingsError::InvalidUrl {
            url: trimmed.to_string(),
            reason: "must start with ws:// or wss://".to_string(),
        }),
    }
}

pub(crate) fn build_channel_url(base_url: &str) -> Result<String, SettingsError> {
    let invalid = |reason: &str| SettingsError::InvalidUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };
    let mut ws_url = reqwest::Url::parse(base_url).map_err(|error| invalid(&error.to_string()))?;

    match ws_url.scheme() {
        "http" => {
            ws_url
                .set_scheme("ws")
                .map_err(|_| invalid("unable to convert URL scheme to ws"))?;
        }
        "https" => {
            ws_url
                .set_scheme("wss")
                .map_err(|_| invalid("unable to convert URL scheme to wss"))?;
        }
        _ => return Err(invalid("must start with http:// or https://")),
    }

    // Channel lives at the host root, beside (not under) an `/api` prefix.
    ws_url.set_path(CHANNEL_PATH);
    ws_url.set_query(None);
    Ok(ws_url.to_string())
}
