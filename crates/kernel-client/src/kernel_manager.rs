//! The `api/kernels` REST endpoints and a polling catalog of running kernels.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::catalog::{forward_poll_failures, lock, Catalog, ManagerEvent, Signals};
use crate::error::{ClientError, ResponseError, Result};
use crate::kernel::{KernelConnection, KernelConnectionOptions};
use crate::poll::{Backoff, Poll, PollOptions, Standby, Visibility};
use crate::server::{read_json, RequestInit, ServerConnection};

/// A running kernel as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl KernelModel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            last_activity: None,
            execution_state: None,
            connections: None,
            reason: None,
            traceback: None,
        }
    }
}

/// Check that `value` is a kernel model.
pub fn validate_kernel_model(value: Value) -> Result<KernelModel> {
    for field in ["id", "name"] {
        if !value.get(field).is_some_and(Value::is_string) {
            return Err(ClientError::validation(
                "kernel",
                format!("missing or non-string {field:?}"),
            ));
        }
    }
    serde_json::from_value(value).map_err(|e| ClientError::validation("kernel", e.to_string()))
}

fn validate_kernel_list(value: Value) -> Result<Vec<KernelModel>> {
    let Value::Array(items) = value else {
        return Err(ClientError::validation("kernel", "expected an array of kernels"));
    };
    items.into_iter().map(validate_kernel_model).collect()
}

/// `GET api/kernels`.
pub async fn list_running(server: &ServerConnection) -> Result<Vec<KernelModel>> {
    let response = server
        .request_expecting(&["api", "kernels"], RequestInit::get(), StatusCode::OK)
        .await?;
    validate_kernel_list(read_json(response).await?)
}

/// `POST api/kernels`. Starts the server's default kernel when `name` is unset.
pub async fn start_new(server: &ServerConnection, name: Option<&str>) -> Result<KernelModel> {
    let body = match name {
        Some(name) => json!({"name": name}),
        None => json!({}),
    };
    let response = server
        .request_expecting(&["api", "kernels"], RequestInit::post(body), StatusCode::CREATED)
        .await?;
    validate_kernel_model(read_json(response).await?)
}

/// `GET api/kernels/{id}`. `None` when the kernel does not exist.
pub async fn get_kernel_model(server: &ServerConnection, id: &str) -> Result<Option<KernelModel>> {
    let response = server
        .request(&["api", "kernels", id], RequestInit::get())
        .await?;
    match response.status() {
        StatusCode::NOT_FOUND => Ok(None),
        StatusCode::OK => validate_kernel_model(read_json(response).await?).map(Some),
        _ => Err(ResponseError::from_response(response).await.into()),
    }
}

/// `DELETE api/kernels/{id}`. A kernel that is already gone is not an error.
pub async fn shutdown_kernel(server: &ServerConnection, id: &str) -> Result<()> {
    let response = server
        .request(&["api", "kernels", id], RequestInit::delete())
        .await?;
    match response.status() {
        StatusCode::NO_CONTENT => Ok(()),
        StatusCode::NOT_FOUND => {
            warn!("[kernel-manager] Kernel {} not found on shutdown", id);
            Ok(())
        }
        _ => Err(ResponseError::from_response(response).await.into()),
    }
}

/// `POST api/kernels/{id}/restart`.
pub async fn restart_kernel(server: &ServerConnection, id: &str) -> Result<KernelModel> {
    let response = server
        .request_expecting(
            &["api", "kernels", id, "restart"],
            RequestInit::post(json!({})),
            StatusCode::OK,
        )
        .await?;
    validate_kernel_model(read_json(response).await?)
}

/// `POST api/kernels/{id}/interrupt`.
pub async fn interrupt_kernel(server: &ServerConnection, id: &str) -> Result<()> {
    server
        .request_expecting(
            &["api", "kernels", id, "interrupt"],
            RequestInit::post(json!({})),
            StatusCode::NO_CONTENT,
        )
        .await?;
    Ok(())
}

/// Options for [`KernelManager::new`].
#[derive(Debug, Clone)]
pub struct KernelManagerOptions {
    pub frequency: Backoff,
    pub standby: Standby,
    pub visibility: Visibility,
}

impl Default for KernelManagerOptions {
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
    running: Mutex<Catalog<Vec<KernelModel>>>,
    connections: Mutex<Vec<KernelConnection>>,
    signals: Signals,
}

impl Inner {
    async fn refresh(&self) -> Result<()> {
        let result = list_running(&self.server).await;
        if let Ok(models) = &result {
            let alive: HashSet<&str> = models.iter().map(|m| m.id.as_str()).collect();
            lock(&self.connections).retain(|conn| {
                if conn.is_disposed() {
                    return false;
                }
                if alive.contains(conn.id()) {
                    return true;
                }
                info!("[kernel-manager] Kernel {} is gone, disposing its connection", conn.id());
                conn.dispose();
                false
            });
        }
        let outcome = result.map(|models| {
            if lock(&self.running).replace(models) {
                self.signals.changed();
            }
        });
        self.signals.settle();
        outcome
    }
}

/// Tracks the server's running kernels and the connections opened to them.
pub struct KernelManager {
    inner: Arc<Inner>,
    poll: Poll,
}

impl KernelManager {
    pub fn new(server: Arc<ServerConnection>, options: KernelManagerOptions) -> Self {
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
                name: "kernel-manager",
                frequency: options.frequency,
                standby: options.standby,
                visibility: options.visibility,
                auto_start: true,
            },
            factory,
        );
        forward_poll_failures("kernel-manager", &poll, inner.signals.events.clone());
        Self { inner, poll }
    }

    /// Resolves once the first fetch has settled, successfully or not.
    pub async fn ready(&self) {
        self.inner.signals.ready().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.signals.events.subscribe()
    }

    pub fn running(&self) -> Vec<KernelModel> {
        lock(&self.inner.running)
            .get()
            .map(|models| models.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn find_by_id(&self, id: &str) -> Option<KernelModel> {
        self.running().into_iter().find(|m| m.id == id)
    }

    /// Fetch the running kernels now.
    pub async fn refresh_running(&self) -> std::result::Result<(), Arc<ClientError>> {
        self.poll.refresh().await
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Start a kernel and connect to it.
    pub async fn start_new(
        &self,
        name: Option<&str>,
        options: KernelConnectionOptions,
    ) -> Result<KernelConnection> {
        let model = start_new(&self.inner.server, name).await?;
        info!("[kernel-manager] Started kernel {} ({})", model.id, model.name);
        if let Err(e) = self.refresh_running().await {
            warn!("[kernel-manager] Refresh after start failed: {}", e);
        }
        Ok(self.connect_to(&model, options))
    }

    /// Open a connection to an existing kernel.
    pub fn connect_to(&self, model: &KernelModel, options: KernelConnectionOptions) -> KernelConnection {
        let connection = KernelConnection::connect(model, self.inner.server.clone(), options);
        lock(&self.inner.connections).push(connection.clone());
        connection
    }

    /// Shut a kernel down and dispose every connection to it.
    pub async fn shutdown(&self, id: &str) -> Result<()> {
        shutdown_kernel(&self.inner.server, id).await?;
        lock(&self.inner.connections).retain(|conn| {
            if conn.id() == id {
                conn.dispose();
                return false;
            }
            true
        });
        if let Err(e) = self.refresh_running().await {
            warn!("[kernel-manager] Refresh after shutdown failed: {}", e);
        }
        Ok(())
    }
}
