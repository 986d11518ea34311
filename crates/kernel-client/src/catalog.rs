//! Change-detecting storage shared by the managers.

use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::error::ClientError;
use crate::poll::{Phase, Poll};

/// Holds the latest server model and reports whether a new one differs.
///
/// Models are compared by their JSON form, computed once per replacement.
/// Object keys are ordered, so two models that serialize the same way are
/// the same model.
#[derive(Debug)]
pub struct Catalog<T> {
    value: Option<Arc<T>>,
    fingerprint: Option<Value>,
}

impl<T> Default for Catalog<T> {
    fn default() -> Self {
        Self {
            value: None,
            fingerprint: None,
        }
    }
}

impl<T: Serialize> Catalog<T> {
    /// Store `value`. Returns `true` when it is structurally different from
    /// the previous one (or there was none).
    pub fn replace(&mut self, value: T) -> bool {
        let fingerprint = match serde_json::to_value(&value) {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                warn!("[catalog] Could not fingerprint model: {}", e);
                None
            }
        };
        let changed = fingerprint.is_none() || fingerprint != self.fingerprint;
        self.value = Some(Arc::new(value));
        self.fingerprint = fingerprint;
        changed
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.value.clone()
    }
}

/// Notifications from the session, kernel and kernelspec managers.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// The catalog changed; read the new value from the manager.
    Changed,
    /// The server could not be reached or reported itself unavailable.
    ConnectionFailure(Arc<ClientError>),
    /// Polling has backed off to its maximum interval.
    Degraded,
    /// The server returned data that failed validation; polling stopped.
    Failed(Arc<ClientError>),
}

/// Report a failed refresh on a manager's event channel.
pub(crate) fn report_failure(events: &broadcast::Sender<ManagerEvent>, err: &Arc<ClientError>) {
    if err.is_connection_failure() {
        let _ = events.send(ManagerEvent::ConnectionFailure(err.clone()));
    } else if matches!(**err, ClientError::Validation { .. }) {
        let _ = events.send(ManagerEvent::Failed(err.clone()));
    }
}

/// Event channel and ready flag shared by a manager and its poll.
pub(crate) struct Signals {
    pub(crate) events: broadcast::Sender<ManagerEvent>,
    ready: watch::Sender<bool>,
}

impl Signals {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (ready, _) = watch::channel(false);
        Self { events, ready }
    }

    /// Mark the first fetch as settled.
    pub(crate) fn settle(&self) {
        self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    pub(crate) async fn ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|r| *r).await;
    }

    pub(crate) fn changed(&self) {
        let _ = self.events.send(ManagerEvent::Changed);
    }
}

/// Turn a poll's ticks into manager events: failures as they happen, and
/// [`ManagerEvent::Degraded`] once per outage when backoff tops out.
pub(crate) fn forward_poll_failures(name: &'static str, poll: &Poll, events: broadcast::Sender<ManagerEvent>) {
    let mut ticks = poll.subscribe();
    let frequency = poll.frequency();
    tokio::spawn(async move {
        let mut degraded = false;
        while ticks.changed().await.is_ok() {
            let tick = ticks.borrow_and_update().clone();
            if tick.phase == Phase::Disposed {
                break;
            }
            if tick.failures == 0 {
                degraded = false;
                continue;
            }
            if let Some(err) = &tick.error {
                report_failure(&events, err);
            }
            if !degraded && tick.at_max(&frequency) {
                degraded = true;
                warn!("[{}] Polling has backed off to {:?}", name, tick.interval);
                let _ = events.send(ManagerEvent::Degraded);
            }
        }
    });
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn first_value_is_a_change() {
        let mut catalog = Catalog::default();
        assert!(catalog.replace(json!({"default": "python3"})));
        assert_eq!(catalog.get().unwrap()["default"], "python3");
    }

    #[test]
    fn equal_values_are_not_changes() {
        let mut catalog = Catalog::default();
        let specs = |lang: &str| {
            let mut map = BTreeMap::new();
            map.insert("python3".to_string(), json!({"language": lang}));
            map
        };
        assert!(catalog.replace(specs("python")));
        assert!(!catalog.replace(specs("python")));
        assert!(catalog.replace(specs("julia")));
    }

    #[test]
    fn key_order_does_not_matter() {
        let mut catalog = Catalog::default();
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert!(catalog.replace(a));
        assert!(!catalog.replace(b));
    }

    #[test]
    fn failures_map_to_events() {
        let (tx, mut rx) = broadcast::channel(4);
        report_failure(
            &tx,
            &Arc::new(ClientError::validation("kernelspec", "no kernelspecs")),
        );
        assert!(matches!(rx.try_recv(), Ok(ManagerEvent::Failed(_))));

        report_failure(&tx, &Arc::new(ClientError::KernelDead));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ready_resolves_once_settled() {
        let signals = Signals::new();
        signals.settle();
        signals.settle();
        signals.ready().await;
    }
}
