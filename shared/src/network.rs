use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::remote::RemoteApi;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEvent {
    BecameOnline,
    BecameOffline,
}

/// Connectivity signal: a level (`is_online`) plus one edge event per
/// transition.
///
/// Hosts feed it from platform reachability callbacks via
/// [`set_online`](Self::set_online); the optional probe does the same from
/// periodic pings.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    level: watch::Sender<bool>,
    edges: broadcast::Sender<NetworkEvent>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (level, _) = watch::channel(initially_online);
        let (edges, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(MonitorInner {
                level,
                edges,
                probe: Mutex::new(None),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.level.borrow()
    }

    /// Returns true when this call flipped the level. Repeated reports of
    /// the same state emit nothing.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.level.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });

        if changed {
            let event = if online {
                NetworkEvent::BecameOnline
            } else {
                NetworkEvent::BecameOffline
            };
            info!(?event, "connectivity changed");
            if self.inner.edges.send(event).is_err() {
                trace!("no subscribers for connectivity event");
            }
        }
        changed
    }

    /// Edge events; each transition is delivered once per receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.edges.subscribe()
    }

    /// Level signal for tasks that want to await a state.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.level.subscribe()
    }

    /// Pings `remote` every `interval` and feeds the result into the level.
    /// Replaces a previously started probe.
    pub fn start_probe(&self, remote: Arc<dyn RemoteApi>, interval: Duration) {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = remote.ping().await;
                debug!(reachable, "reachability probe");
                monitor.set_online(reachable);
            }
        });

        let previous = self
            .inner
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop_probe(&self) {
        let task = self
            .inner
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
