use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

use crate::push::Backoff;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";
pub const MAX_MESSAGE_PAGE: u32 = 100;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend REST root including the version prefix, e.g. `http://host/api/v1`.
    pub api_base_url: String,
    /// Push socket endpoint. Derived from `api_base_url` when unset.
    pub ws_url: Option<String>,
    pub token_path: Option<PathBuf>,
    pub message_page_size: u32,
    pub request_timeout_secs: u64,
    pub push_initial_backoff_ms: u64,
    pub push_max_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080/api/v1".into(),
            ws_url: None,
            token_path: None,
            message_page_size: MAX_MESSAGE_PAGE,
            request_timeout_secs: 30,
            push_initial_backoff_ms: 1_000,
            push_max_backoff_ms: 60_000,
        }
    }
}

impl ClientConfig {
    /// REST root with a trailing slash so relative joins keep the version prefix.
    pub fn api_base(&self) -> anyhow::Result<Url> {
        let mut raw = self.api_base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw).with_context(|| format!("invalid api_base_url '{raw}'"))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(anyhow!(
                "api_base_url must start with http:// or https:// (got {other}://)"
            )),
        }
    }

    pub fn ws_endpoint(&self) -> anyhow::Result<Url> {
        if let Some(ws_url) = &self.ws_url {
            return Url::parse(ws_url).with_context(|| format!("invalid ws_url '{ws_url}'"));
        }

        let mut url = self.api_base()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket scheme from {url}"))?;
        url.set_path("/ws");
        url.set_query(None);
        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn page_size(&self) -> u32 {
        self.message_page_size.clamp(1, MAX_MESSAGE_PAGE)
    }

    pub fn push_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.push_initial_backoff_ms.max(1)),
            Duration::from_millis(self.push_max_backoff_ms.max(self.push_initial_backoff_ms)),
        )
    }
}

/// Defaults, then the TOML file (if present), then `NONCORD_*` environment variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<ClientConfig>(&raw)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ClientConfig::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("NONCORD_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("NONCORD_WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = lookup("NONCORD_TOKEN_PATH") {
        settings.token_path = Some(PathBuf::from(v));
    }
    if let Some(v) = lookup("NONCORD_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.message_page_size = parsed;
        }
    }
    if let Some(v) = lookup("NONCORD_REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn derives_ws_endpoint_from_api_base() {
        let settings = ClientConfig {
            api_base_url: "https://chat.example.com/api/v1".into(),
            ..ClientConfig::default()
        };
        assert_eq!(
            settings.ws_endpoint().expect("ws").as_str(),
            "wss://chat.example.com/ws"
        );
        assert_eq!(
            settings.api_base().expect("api").as_str(),
            "https://chat.example.com/api/v1/"
        );
    }

    #[test]
    fn rejects_non_http_api_base() {
        let settings = ClientConfig {
            api_base_url: "ftp://chat.example.com".into(),
            ..ClientConfig::default()
        };
        assert!(settings.api_base().is_err());
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut settings: ClientConfig = toml::from_str(
            r#"
            api_base_url = "http://file.example/api/v1"
            message_page_size = 20
            "#,
        )
        .expect("toml");
        assert_eq!(settings.page_size(), 20);
        assert_eq!(settings.request_timeout_secs, 30);

        let env: HashMap<&str, &str> = HashMap::from([
            ("NONCORD_API_URL", "http://env.example/api/v1"),
            ("NONCORD_PAGE_SIZE", "not-a-number"),
        ]);
        apply_env_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.api_base_url, "http://env.example/api/v1");
        assert_eq!(settings.message_page_size, 20);
    }

    #[test]
    fn page_size_is_clamped_to_backend_limit() {
        let settings = ClientConfig {
            message_page_size: 500,
            ..ClientConfig::default()
        };
        assert_eq!(settings.page_size(), MAX_MESSAGE_PAGE);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(Some(&dir.path().join("absent.toml"))).expect("settings");
        assert_eq!(settings.page_size(), MAX_MESSAGE_PAGE);
    }
}
