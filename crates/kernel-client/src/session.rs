//! Sessions: the server's mapping from a document path to a kernel.
//!
//! The free functions wrap `api/sessions`. [`SessionManager`] keeps a polled
//! catalog of running sessions and the connections opened through it; when a
//! session disappears from the server its kernel connection is disposed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::catalog::{forward_poll_failures, lock, Catalog, ManagerEvent, Signals};
use crate::error::{ClientError, ResponseError, Result};
use crate::kernel::{KernelConnection, KernelConnectionOptions};
use crate::kernel_manager::{validate_kernel_model, KernelModel};
use crate::poll::{Backoff, Poll, PollOptions, Standby, Visibility};
use crate::server::{read_json, RequestInit, ServerConnection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub kernel: Option<KernelModel>,
}

impl SessionModel {
    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel.as_ref().map(|k| k.id.as_str())
    }
}

/// Which kernel a new or updated session should use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Body of `POST api/sessions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCreate {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelRequest>,
}

/// Rewrite the pre-4.x `{notebook: {path}}` shape into the current one.
fn normalize_legacy(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if obj.contains_key("path") {
        return;
    }
    let Some(path) = obj
        .get("notebook")
        .and_then(|n| n.get("path"))
        .cloned()
    else {
        return;
    };
    obj.insert("path".into(), path);
    obj.insert("type".into(), json!("notebook"));
    obj.insert("name".into(), json!(""));
}

/// Check that `value` is a session model, accepting the legacy shape.
pub fn validate_session_model(mut value: Value) -> Result<SessionModel> {
    normalize_legacy(&mut value);
    for field in ["id", "name", "path", "type"] {
        if !value.get(field).is_some_and(Value::is_string) {
            return Err(ClientError::validation(
                "session",
                format!("missing or non-string {field:?}"),
            ));
        }
    }
    let kernel = match value.get_mut("kernel").map(Value::take) {
        None | Some(Value::Null) => None,
        Some(kernel) => Some(
            validate_kernel_model(kernel)
                .map_err(|e| ClientError::validation("session", format!("invalid kernel: {e}")))?,
        ),
    };
    let field = |name: &str| value[name].as_str().unwrap_or_default().to_string();
    Ok(SessionModel {
        id: field("id"),
        name: field("name"),
        path: field("path"),
        kind: field("type"),
        kernel,
    })
}

fn validate_session_list(value: Value) -> Result<Vec<SessionModel>> {
    let Value::Array(items) = value else {
        return Err(ClientError::validation("session", "expected an array of sessions"));
    };
    items.into_iter().map(validate_session_model).collect()
}

/// `POST api/sessions`. Anything but `201 Created` is an error.
pub async fn start_session(server: &ServerConnection, options: &SessionCreate) -> Result<SessionModel> {
    let response = server
        .request_expecting(
            &["api", "sessions"],
            RequestInit::post(serde_json::to_value(options)?),
            StatusCode::CREATED,
        )
        .await?;
    validate_session_model(read_json(response).await?)
}

/// `GET api/sessions`. One malformed session fails the whole list.
pub async fn list_running(server: &ServerConnection) -> Result<Vec<SessionModel>> {
    let response = server
        .request_expecting(&["api", "sessions"], RequestInit::get(), StatusCode::OK)
        .await?;
    validate_session_list(read_json(response).await?)
}

/// `GET api/sessions/{id}`. `None` when the session does not exist.
pub async fn get_session(server: &ServerConnection, id: &str) -> Result<Option<SessionModel>> {
    let response = server
        .request(&["api", "sessions", id], RequestInit::get())
        .await?;
    match response.status() {
        StatusCode::NOT_FOUND => Ok(None),
        StatusCode::OK => validate_session_model(read_json(response).await?).map(Some),
        _ => Err(ResponseError::from_response(response).await.into()),
    }
}

/// `PATCH api/sessions/{id}` with the fields in `patch`.
pub async fn update_session(server: &ServerConnection, id: &str, patch: Value) -> Result<SessionModel> {
    let mut body = match patch {
        Value::Object(map) => map,
        _ => return Err(ClientError::validation("session", "patch must be an object")),
    };
    body.insert("id".into(), json!(id));
    let response = server
        .request_expecting(
            &["api", "sessions", id],
            RequestInit::patch(Value::Object(body)),
            StatusCode::OK,
        )
        .await?;
    validate_session_model(read_json(response).await?)
}

/// `DELETE api/sessions/{id}`. A session that is already gone is not an error.
pub async fn shutdown_session(server: &ServerConnection, id: &str) -> Result<()> {
    let response = server
        .request(&["api", "sessions", id], RequestInit::delete())
        .await?;
    match response.status() {
        StatusCode::NO_CONTENT => Ok(()),
        StatusCode::NOT_FOUND => {
            warn!("[session-manager] Session {} not found on shutdown", id);
            Ok(())
        }
        _ => Err(ResponseError::from_response(response).await.into()),
    }
}

struct SessionShared {
    server: Arc<ServerConnection>,
    model: Mutex<SessionModel>,
    kernel: Mutex<Option<KernelConnection>>,
    options: KernelConnectionOptions,
}

/// A session together with the connection to its kernel.
#[derive(Clone)]
pub struct SessionConnection {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("model", &*lock(&self.shared.model))
            .finish()
    }
}

impl SessionConnection {
    /// Wrap `model`, connecting to its kernel if it has one.
    pub fn new(model: SessionModel, server: Arc<ServerConnection>, options: KernelConnectionOptions) -> Self {
        let kernel = model
            .kernel
            .as_ref()
            .map(|k| KernelConnection::connect(k, server.clone(), options.clone()));
        Self {
            shared: Arc::new(SessionShared {
                server,
                model: Mutex::new(model),
                kernel: Mutex::new(kernel),
                options,
            }),
        }
    }

    pub fn id(&self) -> String {
        lock(&self.shared.model).id.clone()
    }

    pub fn model(&self) -> SessionModel {
        lock(&self.shared.model).clone()
    }

    pub fn kernel(&self) -> Option<KernelConnection> {
        lock(&self.shared.kernel).clone()
    }

    pub async fn set_path(&self, path: &str) -> Result<SessionModel> {
        self.patch(json!({"path": path})).await
    }

    pub async fn set_name(&self, name: &str) -> Result<SessionModel> {
        self.patch(json!({"name": name})).await
    }

    pub async fn set_type(&self, kind: &str) -> Result<SessionModel> {
        self.patch(json!({"type": kind})).await
    }

    /// Point the session at another kernel and reconnect to it.
    pub async fn change_kernel(&self, kernel: KernelRequest) -> Result<Option<KernelConnection>> {
        let model = self.patch(json!({"kernel": kernel})).await?;
        let previous = lock(&self.shared.kernel).clone();
        let unchanged = match (&previous, model.kernel.as_ref()) {
            (Some(conn), Some(k)) => conn.id() == k.id && !conn.is_disposed(),
            _ => false,
        };
        if unchanged {
            return Ok(previous);
        }
        if let Some(previous) = previous {
            previous.dispose();
        }
        let next = model.kernel.as_ref().map(|k| {
            KernelConnection::connect(k, self.shared.server.clone(), self.shared.options.clone())
        });
        *lock(&self.shared.kernel) = next.clone();
        Ok(next)
    }

    /// Delete the session on the server and dispose the kernel connection.
    pub async fn shutdown(&self) -> Result<()> {
        shutdown_session(&self.shared.server, &self.id()).await?;
        self.dispose();
        Ok(())
    }

    pub fn dispose(&self) {
        if let Some(kernel) = lock(&self.shared.kernel).take() {
            kernel.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.kernel)
            .as_ref()
            .map_or(true, KernelConnection::is_disposed)
    }

    async fn patch(&self, patch: Value) -> Result<SessionModel> {
        let id = self.id();
        let model = update_session(&self.shared.server, &id, patch).await?;
        *lock(&self.shared.model) = model.clone();
        Ok(model)
    }
}

/// Options for [`SessionManager::new`].
#[derive(Debug, Clone)]
pub struct SessionManagerOptions {
    pub frequency: Backoff,
    pub standby: Standby,
    pub visibility: Visibility,
}

impl Default for SessionManagerOptions {
    fn default() -> Self {
        Self {
            frequency: Backoff::new(Duration::from_secs(10), Duration::from_secs(300)),
            standby: Standby::WhenHidden,
            visibility: Visibility::new(),
        }
    }
}

struct Inner {
    server: Arc<ServerConnection>,
    running: Mutex<Catalog<Vec<SessionModel>>>,
    connections: Mutex<Vec<SessionConnection>>,
    signals: Signals,
}

impl Inner {
    async fn refresh(&self) -> Result<()> {
        let result = list_running(&self.server).await;
        if let Ok(models) = &result {
            let alive: HashSet<&str> = models.iter().map(|m| m.id.as_str()).collect();
            lock(&self.connections).retain(|session| {
                if session.is_disposed() {
                    return false;
                }
                let id = session.id();
                if alive.contains(id.as_str()) {
                    return true;
                }
                info!("[session-manager] Session {} is gone, disposing its kernel connection", id);
                session.dispose();
                false
            });
        }
        let outcome = result.map(|models| {
            if lock(&self.running).replace(models) {
                debug!("[session-manager] Running sessions changed");
                self.signals.changed();
            }
        });
        self.signals.settle();
        outcome
    }
}

/// Polled catalog of the server's sessions.
pub struct SessionManager {
    inner: Arc<Inner>,
    poll: Poll,
}

impl SessionManager {
    pub fn new(server: Arc<ServerConnection>, options: SessionManagerOptions) -> Self {
        let inner = Arc::new(Inner {
            server,
            running: Mutex::new(Catalog::default()),
            connections: Mutex::new(Vec::new()),
            signals: Signals::new(),
        });
        let factory = {
            let inner = inner.clone();
            move || {
                let inner = inner.clone();
                async move { inner.refresh().await }
            }
        };
        let poll = Poll::new(
            PollOptions {
                name: "session-manager",
                frequency: options.frequency,
                standby: options.standby,
                visibility: options.visibility,
                auto_start: true,
            },
            factory,
        );
        forward_poll_failures("session-manager", &poll, inner.signals.events.clone());
        Self { inner, poll }
    }

    /// Resolves once the first fetch has settled, successfully or not.
    pub async fn ready(&self) {
        self.inner.signals.ready().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.signals.events.subscribe()
    }

    pub fn running(&self) -> Vec<SessionModel> {
        lock(&self.inner.running)
            .get()
            .map(|models| models.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Fetch the running sessions now.
    pub async fn refresh_running(&self) -> std::result::Result<(), Arc<ClientError>> {
        self.poll.refresh().await
    }

    /// Start a session, refresh the catalog and connect to its kernel.
    pub async fn start_new(
        &self,
        create: &SessionCreate,
        options: KernelConnectionOptions,
    ) -> Result<SessionConnection> {
        let model = start_session(&self.inner.server, create).await?;
        info!(
            "[session-manager] Started session {} for {} (kernel {:?})",
            model.id,
            model.path,
            model.kernel_id()
        );
        if let Err(e) = self.refresh_running().await {
            warn!("[session-manager] Refresh after start failed: {}", e);
        }
        Ok(self.connect_to(model, options))
    }

    /// Open a connection to an existing session's kernel.
    pub fn connect_to(&self, model: SessionModel, options: KernelConnectionOptions) -> SessionConnection {
        let session = SessionConnection::new(model, self.inner.server.clone(), options);
        lock(&self.inner.connections).push(session.clone());
        session
    }

    /// Shut a session down and dispose every connection to it.
    pub async fn shutdown(&self, id: &str) -> Result<()> {
        shutdown_session(&self.inner.server, id).await?;
        lock(&self.inner.connections).retain(|session| {
            if session.id() == id {
                session.dispose();
                return false;
            }
            true
        });
        if let Err(e) = self.refresh_running().await {
            warn!("[session-manager] Refresh after shutdown failed: {}", e);
        }
        Ok(())
    }

    /// Ask the server for one session.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<SessionModel>> {
        get_session(&self.inner.server, id).await
    }

    /// Refresh, then look a session up by its path.
    pub async fn find_by_path(
        &self,
        path: &str,
    ) -> std::result::Result<Option<SessionModel>, Arc<ClientError>> {
        self.refresh_running().await?;
        Ok(self.running().into_iter().find(|m| m.path == path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Value {
        json!({
            "id": id,
            "name": "a.ipynb",
            "path": "work/a.ipynb",
            "type": "notebook",
            "kernel": {"id": "k1", "name": "python3"}
        })
    }

    #[test]
    fn sessions_are_validated() {
        let model = validate_session_model(session("s1")).unwrap();
        assert_eq!(model.kind, "notebook");
        assert_eq!(model.kernel_id(), Some("k1"));

        let mut no_kernel = session("s2");
        no_kernel["kernel"] = Value::Null;
        assert!(validate_session_model(no_kernel).unwrap().kernel.is_none());

        let mut bad = session("s3");
        bad["path"] = json!(7);
        let err = validate_session_model(bad).unwrap_err();
        assert!(matches!(err, ClientError::Validation { kind: "session", .. }));

        let mut bad_kernel = session("s4");
        bad_kernel["kernel"] = json!({"name": "python3"});
        assert!(validate_session_model(bad_kernel).is_err());
    }

    #[test]
    fn legacy_sessions_are_normalized() {
        let model = validate_session_model(json!({
            "id": "s1",
            "notebook": {"path": "old.ipynb"},
            "kernel": {"id": "k1", "name": "python3"}
        }))
        .unwrap();
        assert_eq!(model.path, "old.ipynb");
        assert_eq!(model.kind, "notebook");
        assert_eq!(model.name, "");
    }

    #[test]
    fn one_bad_session_fails_the_list() {
        let list = json!([session("s1"), {"id": "s2"}]);
        assert!(validate_session_list(list).is_err());
        assert_eq!(validate_session_list(json!([session("s1")])).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_forgets_disposed_connections() {
        let app = axum::Router::new().route(
            "/api/sessions",
            axum::routing::get(|| async { axum::Json(json!([session("s1")])) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let server = ServerConnection::from_options(crate::settings::SettingsOptions {
            base_url: Some(format!("http://{addr}/")),
            ..Default::default()
        })
        .unwrap();
        let manager = SessionManager::new(
            Arc::new(server),
            SessionManagerOptions {
                frequency: Backoff::new(Duration::from_secs(3600), Duration::from_secs(7200)),
                ..Default::default()
            },
        );
        manager.ready().await;

        let model = validate_session_model(session("s1")).unwrap();
        let kept = manager.connect_to(model.clone(), Default::default());
        let dropped = manager.connect_to(model, Default::default());
        dropped.dispose();
        assert_eq!(lock(&manager.inner.connections).len(), 2);

        manager.refresh_running().await.unwrap();
        let connections = lock(&manager.inner.connections);
        assert_eq!(connections.len(), 1);
        assert!(!connections[0].is_disposed());
        assert!(!kept.is_disposed());
    }

    #[test]
    fn create_body_uses_type() {
        let body = serde_json::to_value(SessionCreate {
            path: "a.ipynb".into(),
            name: "a.ipynb".into(),
            kind: "notebook".into(),
            kernel: Some(KernelRequest {
                name: Some("python3".into()),
                id: None,
            }),
        })
        .unwrap();
        assert_eq!(body["type"], "notebook");
        assert_eq!(body["kernel"], json!({"name": "python3"}));
    }
}
