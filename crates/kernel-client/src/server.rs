//! Authenticated HTTP access to the Jupyter server.

use std::sync::{Arc, RwLock};

use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;

use crate::error::{ClientError, ResponseError, Result};
use crate::settings::{CacheMode, ServerSettings, SettingsOptions};

const XSRF_HEADER: &str = "X-XSRFToken";

/// A single HTTP request before authentication is applied.
#[derive(Debug, Clone)]
pub struct RequestInit {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: HeaderMap,
    /// Overrides the settings' cache mode for this request.
    pub cache: Option<CacheMode>,
}

impl RequestInit {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: HeaderMap::new(),
            cache: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn post(body: Value) -> Self {
        Self::new(Method::POST).with_body(body)
    }

    pub fn patch(body: Value) -> Self {
        Self::new(Method::PATCH).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Shared handle to one Jupyter server.
///
/// Cheap to share behind an `Arc`; settings can be swapped at runtime and
/// requests already in flight keep the settings they started with.
#[derive(Debug)]
pub struct ServerConnection {
    settings: RwLock<Arc<ServerSettings>>,
    client: reqwest::Client,
}

impl ServerConnection {
    pub fn new(settings: ServerSettings) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            settings: RwLock::new(Arc::new(settings)),
            client,
        })
    }

    pub fn from_options(options: SettingsOptions) -> Result<Self> {
        Self::new(ServerSettings::resolve(options)?)
    }

    /// The settings currently in effect.
    pub fn settings(&self) -> Arc<ServerSettings> {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the settings wholesale.
    pub fn update_settings(&self, options: SettingsOptions) -> Result<Arc<ServerSettings>> {
        let settings = Arc::new(ServerSettings::resolve(options)?);
        match self.settings.write() {
            Ok(mut guard) => *guard = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }
        debug!("[server] Settings updated: base_url={}", settings.base_url);
        Ok(settings)
    }

    /// Send a request to a URL under `settings.base_url`.
    ///
    /// Adds the token and XSRF headers, a JSON content type for authenticated
    /// requests, and a cache-busting query parameter when the cache mode is
    /// `no-store`. Any HTTP status is returned as-is; only failures to get a
    /// response at all are errors.
    pub async fn make_request(
        &self,
        url: &str,
        init: RequestInit,
        settings: &ServerSettings,
    ) -> Result<Response> {
        if !url.starts_with(&settings.base_url) {
            return Err(ClientError::UrlOutsideBase {
                url: url.to_string(),
            });
        }

        let mut target = url.to_string();
        if init.cache.unwrap_or(settings.init.cache) == CacheMode::NoStore {
            let separator = if target.contains('?') { '&' } else { '?' };
            target.push(separator);
            target.push_str(&chrono::Utc::now().timestamp_millis().to_string());
        }
        let target = url::Url::parse(&target)?;

        let mut headers = init.headers;
        let mut authenticated = false;
        if let Some(token) = settings.token.as_deref() {
            authenticated = true;
            headers.insert(AUTHORIZATION, header_value(&format!("token {token}"))?);
        }
        if let Some(xsrf) = settings.xsrf_token.as_deref() {
            authenticated = true;
            headers.insert(HeaderName::from_static("x-xsrftoken"), header_value(xsrf)?);
        }
        if authenticated && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        debug!("[server] {} {}", init.method, target);
        let mut request = self.client.request(init.method, target).headers(headers);
        if let Some(body) = init.body {
            request = request.body(serde_json::to_vec(&body)?);
        }
        Ok(request.send().await?)
    }

    /// `make_request` against `segments` under the current base URL.
    pub(crate) async fn request(&self, segments: &[&str], init: RequestInit) -> Result<Response> {
        let settings = self.settings();
        let url = settings.api_url(segments);
        self.make_request(&url, init, &settings).await
    }

    /// Like [`request`](Self::request), but any status other than `expected`
    /// becomes a [`ResponseError`].
    pub(crate) async fn request_expecting(
        &self,
        segments: &[&str],
        init: RequestInit,
        expected: StatusCode,
    ) -> Result<Response> {
        let response = self.request(segments, init).await?;
        if response.status() != expected {
            return Err(ResponseError::from_response(response).await.into());
        }
        Ok(response)
    }
}

/// Read a response body as JSON.
pub(crate) async fn read_json(response: Response) -> Result<Value> {
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        ClientError::validation("settings", format!("{XSRF_HEADER} or token is not a valid header value"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn urls_outside_the_base_fail_before_any_io() {
        // Nothing listens on this port; the guard must trip first.
        let server = ServerConnection::from_options(SettingsOptions {
            base_url: Some("http://127.0.0.1:9/jupyter/".into()),
            ..Default::default()
        })
        .unwrap();
        let settings = server.settings();
        let err = server
            .make_request("http://elsewhere.test/api/status", RequestInit::get(), &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UrlOutsideBase { .. }));
    }

    #[test]
    fn update_settings_replaces_the_value() {
        let server = ServerConnection::new(ServerSettings::default()).unwrap();
        let before = server.settings();
        let after = server
            .update_settings(SettingsOptions {
                base_url: Some("http://other:1234/".into()),
                token: Some("t".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(before.base_url, "http://localhost:8888/");
        assert_eq!(after.base_url, "http://other:1234/");
        assert_eq!(server.settings().token.as_deref(), Some("t"));
    }

    #[test]
    fn request_init_builders() {
        let init = RequestInit::patch(serde_json::json!({"path": "a.ipynb"}))
            .with_cache(CacheMode::Default);
        assert_eq!(init.method, Method::PATCH);
        assert_eq!(init.cache, Some(CacheMode::Default));
        assert!(init.body.is_some());
    }
}
