//! Where the Jupyter server lives and how to authenticate against it.
//!
//! [`SettingsOptions`] is the loose, layered input: a JSON config file,
//! environment variables and command-line flags each fill in what they know.
//! [`ServerSettings::resolve`] turns the merged options into the immutable
//! value every request and WebSocket connection is built from.

use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::error::{ClientError, Result};

/// Base URL used when nothing else is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8888/";

pub const ENV_BASE_URL: &str = "JUPYTER_BASE_URL";
pub const ENV_WS_URL: &str = "JUPYTER_WS_URL";
pub const ENV_TOKEN: &str = "JUPYTER_TOKEN";

/// HTTP cache behaviour applied to requests that do not choose their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Every request carries a unique query parameter so no cache can answer it.
    #[default]
    NoStore,
    /// Requests are sent unchanged.
    Default,
}

/// Defaults merged into every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestDefaults {
    pub cache: CacheMode,
}

/// Partial settings, as read from one configuration source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOptions {
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
    pub token: Option<String>,
    /// URL of the page hosting the client, when running inside one. Used to
    /// decide whether the WebSocket needs the token in its query string.
    pub page_url: Option<String>,
    /// Value of the server's `_xsrf` cookie.
    pub xsrf_token: Option<String>,
    pub append_token: Option<bool>,
    pub cache: Option<CacheMode>,
}

impl SettingsOptions {
    /// Read options from a JSON file. A missing file yields empty options.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[settings] No config file at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Options taken from `JUPYTER_BASE_URL`, `JUPYTER_WS_URL` and `JUPYTER_TOKEN`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            base_url: var(ENV_BASE_URL),
            ws_url: var(ENV_WS_URL),
            token: var(ENV_TOKEN),
            ..Self::default()
        }
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merge(self, other: SettingsOptions) -> Self {
        Self {
            base_url: other.base_url.or(self.base_url),
            ws_url: other.ws_url.or(self.ws_url),
            token: other.token.or(self.token),
            page_url: other.page_url.or(self.page_url),
            xsrf_token: other.xsrf_token.or(self.xsrf_token),
            append_token: other.append_token.or(self.append_token),
            cache: other.cache.or(self.cache),
        }
    }
}

/// Default location of the JSON config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kernel-client").join("config.json"))
}

/// Resolved connection settings for one Jupyter server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSettings {
    /// Always ends with `/`.
    pub base_url: String,
    /// Always ends with `/`.
    pub ws_url: String,
    pub token: Option<String>,
    /// Whether the token goes into the WebSocket query string.
    pub append_token: bool,
    pub init: RequestDefaults,
    pub xsrf_token: Option<String>,
    pub page_url: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        // The default options always resolve.
        Self::resolve(SettingsOptions::default()).unwrap_or_else(|_| Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: "ws://localhost:8888/".to_string(),
            token: None,
            append_token: true,
            init: RequestDefaults::default(),
            xsrf_token: None,
            page_url: None,
        })
    }
}

impl ServerSettings {
    pub fn resolve(options: SettingsOptions) -> Result<Self> {
        let base_url = normalize(options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let ws_url = match options.ws_url.as_deref() {
            Some(ws) => normalize(ws)?,
            None => derive_ws_url(&base_url)?,
        };

        let append_token = options.append_token.unwrap_or_else(|| {
            match options.page_url.as_deref() {
                None => true,
                Some(page) => host_of(page) != host_of(&ws_url),
            }
        });

        Ok(Self {
            base_url,
            ws_url,
            token: options.token.filter(|t| !t.is_empty()),
            append_token,
            init: RequestDefaults {
                cache: options.cache.unwrap_or_default(),
            },
            xsrf_token: options.xsrf_token.filter(|t| !t.is_empty()),
            page_url: options.page_url,
        })
    }

    /// Join path segments onto the base URL.
    pub fn api_url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                url.push('/');
            }
            url.push_str(segment.trim_matches('/'));
        }
        url
    }

    /// WebSocket URL for a kernel's multiplexed channels. Query values are
    /// form-encoded.
    pub fn kernel_channels_url(&self, kernel_id: &str, client_id: &str) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("session_id", client_id);
        if let (true, Some(token)) = (self.append_token, self.token.as_deref()) {
            query.append_pair("token", token);
        }
        format!(
            "{}api/kernels/{}/channels?{}",
            self.ws_url,
            kernel_id,
            query.finish()
        )
    }
}

fn normalize(raw: &str) -> Result<String> {
    let url = Url::parse(raw)?;
    let mut text = url.to_string();
    if !text.ends_with('/') {
        text.push('/');
    }
    Ok(text)
}

fn derive_ws_url(base_url: &str) -> Result<String> {
    match base_url.strip_prefix("http") {
        Some(rest) => Ok(format!("ws{rest}")),
        None => Err(ClientError::validation(
            "settings",
            format!("cannot derive a WebSocket URL from {base_url}"),
        )),
    }
}

fn host_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(base_url: &str) -> SettingsOptions {
        SettingsOptions {
            base_url: Some(base_url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn ws_url_follows_the_base_url_scheme() {
        let plain = ServerSettings::resolve(options("http://example.com:8888/lab")).unwrap();
        assert_eq!(plain.base_url, "http://example.com:8888/lab/");
        assert_eq!(plain.ws_url, "ws://example.com:8888/lab/");

        let secure = ServerSettings::resolve(options("https://hub.example.com/user/a/")).unwrap();
        assert_eq!(secure.ws_url, "wss://hub.example.com/user/a/");
    }

    #[test]
    fn defaults_use_localhost_and_no_store() {
        let settings = ServerSettings::default();
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.init.cache, CacheMode::NoStore);
        assert!(settings.append_token);
        assert!(settings.token.is_none());
    }

    #[test]
    fn token_is_appended_only_across_hosts() {
        let same_host = ServerSettings::resolve(SettingsOptions {
            page_url: Some("http://localhost:8888/lab".into()),
            ..options("http://localhost:8888/")
        })
        .unwrap();
        assert!(!same_host.append_token);

        let other_host = ServerSettings::resolve(SettingsOptions {
            page_url: Some("http://localhost:3000/".into()),
            ..options("http://localhost:8888/")
        })
        .unwrap();
        assert!(other_host.append_token);
    }

    #[test]
    fn channels_url_carries_session_and_token() {
        let settings = ServerSettings::resolve(SettingsOptions {
            token: Some("secret".into()),
            ..options("http://localhost:8888/")
        })
        .unwrap();
        assert_eq!(
            settings.kernel_channels_url("k1", "c1"),
            "ws://localhost:8888/api/kernels/k1/channels?session_id=c1&token=secret"
        );

        let no_append = ServerSettings {
            append_token: false,
            ..settings
        };
        assert_eq!(
            no_append.kernel_channels_url("k1", "c1"),
            "ws://localhost:8888/api/kernels/k1/channels?session_id=c1"
        );
    }

    #[test]
    fn channel_url_query_values_are_encoded() {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let settings = ServerSettings::resolve(SettingsOptions {
            token: Some("a b&c=d#e+f".into()),
            ..Default::default()
        })
        .unwrap();
        let url = settings.kernel_channels_url("k1", "c 1");
        assert_eq!(
            url,
            "ws://localhost:8888/api/kernels/k1/channels?session_id=c+1&token=a+b%26c%3Dd%23e%2Bf"
        );

        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("session_id".to_string(), "c 1".to_string()),
                ("token".to_string(), "a b&c=d#e+f".to_string()),
            ]
        );
        assert!(url.as_str().into_client_request().is_ok());
    }

    #[test]
    fn api_url_joins_segments() {
        let settings = ServerSettings::default();
        assert_eq!(
            settings.api_url(&["api", "kernels", "abc", "interrupt"]),
            "http://localhost:8888/api/kernels/abc/interrupt"
        );
    }

    #[test]
    fn later_sources_win_when_merging() {
        let file = SettingsOptions {
            base_url: Some("http://file:8888/".into()),
            token: Some("from-file".into()),
            ..Default::default()
        };
        let flags = SettingsOptions {
            token: Some("from-flag".into()),
            ..Default::default()
        };
        let merged = file.merge(flags);
        assert_eq!(merged.base_url.as_deref(), Some("http://file:8888/"));
        assert_eq!(merged.token.as_deref(), Some("from-flag"));
    }

    #[test]
    fn missing_config_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let options = SettingsOptions::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(options, SettingsOptions::default());
    }

    #[test]
    fn config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"base_url": "http://remote:9999/", "token": "abc", "cache": "default"}"#,
        )
        .unwrap();
        let options = SettingsOptions::load(&path).unwrap();
        let settings = ServerSettings::resolve(options).unwrap();
        assert_eq!(settings.base_url, "http://remote:9999/");
        assert_eq!(settings.token.as_deref(), Some("abc"));
        assert_eq!(settings.init.cache, CacheMode::Default);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            ServerSettings::resolve(options("not a url")),
            Err(ClientError::InvalidUrl(_))
        ));
    }
}
