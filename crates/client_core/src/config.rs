use std::{fs, path::Path, time::Duration};

use thiserror::Error;
use tracing::warn;
use url::Url;

pub const SETTINGS_FILE: &str = "crm_client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub access_token: Option<String>,
    /// `None` keeps the cache in memory for the session only.
    pub cache_database_url: Option<String>,
    pub cache_ttl_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".into(),
            access_token: None,
            cache_database_url: None,
            cache_ttl_seconds: 300,
            request_timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid api url '{url}': {source}")]
    InvalidApiUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("api url '{0}' must use http or https")]
    UnsupportedScheme(String),
    #[error("request timeout must be at least one second")]
    ZeroTimeout,
}

impl ClientSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let url = Url::parse(&self.api_base_url).map_err(|source| SettingsError::InvalidApiUrl {
            url: self.api_base_url.clone(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SettingsError::UnsupportedScheme(self.api_base_url.clone()));
        }
        if self.request_timeout_seconds == 0 {
            return Err(SettingsError::ZeroTimeout);
        }
        Ok(())
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

/// Defaults, then the settings file at `path` if readable, then environment.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());

    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    let file_cfg = match toml::from_str::<toml::Table>(raw) {
        Ok(table) => table,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable settings file");
            return;
        }
    };
    let text = |key: &str| match file_cfg.get(key) {
        Some(toml::Value::String(v)) => Some(v.clone()),
        Some(toml::Value::Integer(v)) => Some(v.to_string()),
        _ => None,
    };

    if let Some(v) = text("api_url") {
        settings.api_base_url = v;
    }
    if let Some(v) = text("access_token") {
        settings.access_token = Some(v);
    }
    if let Some(v) = text("cache_database_url") {
        settings.cache_database_url = Some(v);
    }
    if let Some(parsed) = text("cache_ttl_seconds").and_then(|v| v.parse().ok()) {
        settings.cache_ttl_seconds = parsed;
    }
    if let Some(parsed) = text("request_timeout_seconds").and_then(|v| v.parse().ok()) {
        settings.request_timeout_seconds = parsed;
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CRM_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__API_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = var("CRM_ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }

    if let Some(v) = var("CRM_CACHE_DATABASE_URL") {
        settings.cache_database_url = Some(v);
    }
    if let Some(v) = var("APP__CACHE_DATABASE_URL") {
        settings.cache_database_url = Some(v);
    }

    if let Some(v) = var("APP__CACHE_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.cache_ttl_seconds = parsed;
        }
    }
    if let Some(v) = var("APP__REQUEST_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_seconds = parsed;
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return "sqlite::memory:".to_string();
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
