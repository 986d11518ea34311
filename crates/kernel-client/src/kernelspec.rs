//! The kernelspecs the server can launch, refreshed on a slow poll.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};

use crate::catalog::{forward_poll_failures, lock, Catalog, ManagerEvent, Signals};
use crate::error::{ClientError, Result};
use crate::poll::{Backoff, Poll, PollOptions, Standby, Visibility};
use crate::server::{read_json, RequestInit, ServerConnection};

/// One launchable kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecModel {
    pub name: String,
    pub display_name: String,
    pub language: String,
    pub argv: Vec<String>,
    /// Resource name to URL, e.g. `logo-64x64`.
    pub resources: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// The server's kernelspec catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecs {
    pub default: String,
    pub kernelspecs: BTreeMap<String, KernelSpecModel>,
}

impl KernelSpecs {
    pub fn default_spec(&self) -> Option<&KernelSpecModel> {
        self.kernelspecs.get(&self.default)
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> std::result::Result<String, String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing or non-string {key:?}"))
}

fn object_field(obj: &Map<String, Value>, key: &str) -> std::result::Result<Option<Map<String, Value>>, String> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(format!("{key:?} is not an object")),
    }
}

/// Check one `{name, resources, spec: {...}}` entry.
pub fn validate_spec_model(value: &Value) -> Result<KernelSpecModel> {
    let invalid = |reason: String| ClientError::validation("kernelspec", reason);
    let entry = value
        .as_object()
        .ok_or_else(|| invalid("kernelspec is not an object".into()))?;
    let spec = entry
        .get("spec")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("missing \"spec\"".into()))?;

    let name = string_field(entry, "name").map_err(invalid)?;
    let resources = object_field(entry, "resources")
        .map_err(invalid)?
        .ok_or_else(|| invalid("missing \"resources\"".into()))?;
    let language = string_field(spec, "language").map_err(invalid)?;
    let display_name = string_field(spec, "display_name").map_err(invalid)?;
    let argv = match spec.get("argv") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|arg| arg.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("\"argv\" must hold strings".into()))?,
        _ => return Err(invalid("missing or non-array \"argv\"".into())),
    };
    Ok(KernelSpecModel {
        name,
        display_name,
        language,
        argv,
        resources,
        env: object_field(spec, "env").map_err(invalid)?,
        metadata: object_field(spec, "metadata").map_err(invalid)?,
    })
}

/// Validate the `GET api/kernelspecs` payload.
///
/// Errant specs are dropped with a warning. At least one must survive. A
/// missing or unknown `default` falls back to the first name.
pub fn validate_specs(value: &Value) -> Result<KernelSpecs> {
    let Some(entries) = value.get("kernelspecs").and_then(Value::as_object) else {
        return Err(ClientError::validation("kernelspec", "no kernelspecs found"));
    };
    let mut kernelspecs = BTreeMap::new();
    for (name, entry) in entries {
        match validate_spec_model(entry) {
            Ok(spec) => {
                kernelspecs.insert(name.clone(), spec);
            }
            Err(e) => warn!("[kernelspec] Removing errant kernelspec {}: {}", name, e),
        }
    }
    let Some(first) = kernelspecs.keys().next().cloned() else {
        return Err(ClientError::validation("kernelspec", "no valid kernelspecs found"));
    };
    let default = match value.get("default").and_then(Value::as_str) {
        Some(name) if kernelspecs.contains_key(name) => name.to_string(),
        _ => {
            warn!("[kernelspec] Default kernelspec not found, using {}", first);
            first
        }
    };
    Ok(KernelSpecs {
        default,
        kernelspecs,
    })
}

/// `GET api/kernelspecs`.
pub async fn get_specs(server: &ServerConnection) -> Result<KernelSpecs> {
    let response = server
        .request_expecting(&["api", "kernelspecs"], RequestInit::get(), StatusCode::OK)
        .await?;
    validate_specs(&read_json(response).await?)
}

/// Options for [`KernelSpecManager::new`].
#[derive(Debug, Clone)]
pub struct KernelSpecManagerOptions {
    pub frequency: Backoff,
    pub standby: Standby,
    pub visibility: Visibility,
}

impl Default for KernelSpecManagerOptions {
    fn default() -> Self {
        Self {
            frequency: Backoff::new(Duration::from_secs(61), Duration::from_secs(300)),
            standby: Standby::WhenHidden,
            visibility: Visibility::new(),
        }
    }
}

struct Inner {
    server: Arc<ServerConnection>,
    catalog: Mutex<Catalog<KernelSpecs>>,
    specs: watch::Sender<Option<Arc<KernelSpecs>>>,
    signals: Signals,
}

impl Inner {
    async fn refresh(&self) -> Result<()> {
        let outcome = get_specs(&self.server).await.map(|specs| {
            let mut catalog = lock(&self.catalog);
            if catalog.replace(specs) {
                debug!("[kernelspec] Kernelspecs changed");
                self.specs.send_replace(catalog.get());
                self.signals.changed();
            }
        });
        self.signals.settle();
        outcome
    }
}

/// Polled catalog of kernelspecs.
pub struct KernelSpecManager {
    inner: Arc<Inner>,
    poll: Poll,
}

impl KernelSpecManager {
    pub fn new(server: Arc<ServerConnection>, options: KernelSpecManagerOptions) -> Self {
        let (specs, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            server,
            catalog: Mutex::new(Catalog::default()),
            specs,
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
                name: "kernelspec",
                frequency: options.frequency,
                standby: options.standby,
                visibility: options.visibility,
                auto_start: true,
            },
            factory,
        );
        forward_poll_failures("kernelspec", &poll, inner.signals.events.clone());
        Self { inner, poll }
    }

    /// Resolves once the first fetch has settled, successfully or not.
    pub async fn ready(&self) {
        self.inner.signals.ready().await
    }

    /// Resolves with the first successfully fetched catalog.
    pub async fn specs_ready(&self) -> Option<Arc<KernelSpecs>> {
        let mut specs = self.inner.specs.subscribe();
        let ready = specs.wait_for(Option::is_some).await.ok()?;
        ready.clone()
    }

    pub fn specs(&self) -> Option<Arc<KernelSpecs>> {
        lock(&self.inner.catalog).get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.signals.events.subscribe()
    }

    pub fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Fetch now and wait for the fetch to settle.
    pub async fn refresh_specs(&self) -> std::result::Result<(), Arc<ClientError>> {
        self.poll.refresh().await
    }
}
