//! Registry of the heaters behind one gateway ("Home Server").
//!
//! The registry owns one [`DeviceController`] per listed device, tracks when the gateway was
//! last polled, and holds the queue of [`AsyncUpdate`]s waiting for the gateway's poller.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::DeviceController;
use crate::device::DeviceSnapshot;
use crate::device::UpdateSeverity;
use crate::error::Result;
use crate::model;
use crate::telemetry::DeviceTelemetry;
use crate::update::AsyncUpdate;

/// Change notifications fanned out to subscribers (the scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeServerEvent {
    DevicesUpdated { uri: String, urgent: bool },
}

pub type HomeServerEventSender = mpsc::Sender<HomeServerEvent>;

#[derive(Debug, Default)]
struct Registry {
    controllers: BTreeMap<String, Arc<DeviceController>>,
    /// Ids whose model failed to resolve; skipped in later listings.
    unsupported: HashSet<String>,
    last_poll: Option<Instant>,
    last_alive_check: Option<Instant>,
    pending: Vec<AsyncUpdate>,
}

/// Serializable view of a gateway for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct HomeServerSnapshot {
    pub uri: String,
    pub name: Option<String>,
    pub polled_recently: bool,
    pub pending_updates: usize,
    pub devices: Vec<DeviceSnapshot>,
}

pub struct HomeServer {
    uri: String,
    password: String,
    name: Option<String>,
    poll_tolerance: Duration,
    registry: Mutex<Registry>,
    updates_pending: Notify,
    listeners: Mutex<Vec<HomeServerEventSender>>,
}

impl std::fmt::Debug for HomeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeServer")
            .field("uri", &self.uri)
            .field("name", &self.name)
            .field("poll_tolerance", &self.poll_tolerance)
            .finish_non_exhaustive()
    }
}

impl HomeServer {
    pub fn new(
        uri: impl Into<String>,
        password: impl Into<String>,
        name: Option<String>,
        poll_tolerance: Duration,
    ) -> Self {
        Self {
            uri: uri.into(),
            password: password.into(),
            name,
            poll_tolerance,
            registry: Mutex::new(Registry::default()),
            updates_pending: Notify::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self, tx: HomeServerEventSender) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
    }

    /// Reconcile the registry with a fresh device listing.
    ///
    /// Returns the ids whose detailed status is required before the listing can be applied;
    /// in that case stale devices are kept and no notification is sent, and the caller must
    /// call again with those blocks spliced in. An empty result means the listing was applied.
    ///
    /// Fails if a listed device's model cannot be controlled. That id is remembered and left
    /// out of later listings.
    pub fn update_device_controllers(
        &self,
        listing: &[DeviceTelemetry],
        now: Instant,
    ) -> Result<Vec<String>> {
        let mut registry = self.registry();
        registry.last_poll = Some(now);

        let mut created = Vec::new();
        for telemetry in listing {
            if registry.unsupported.contains(&telemetry.id)
                || registry.controllers.contains_key(&telemetry.id)
            {
                continue;
            }
            match model::resolve(&telemetry.id) {
                Ok(model) => {
                    let name = telemetry.name.clone().unwrap_or_else(|| telemetry.id.clone());
                    created.push(Arc::new(DeviceController::new(
                        telemetry.id.clone(),
                        name,
                        self.uri.clone(),
                        model,
                    )));
                }
                Err(e) => {
                    warn!("[{}] {}", self.uri, e);
                    registry.unsupported.insert(telemetry.id.clone());
                    return Err(e);
                }
            }
        }

        for controller in created {
            info!(
                "[{}] New device {} ({}, {})",
                self.uri,
                controller.id(),
                controller.name(),
                controller.model().name
            );
            registry
                .controllers
                .insert(controller.id().to_string(), controller);
        }

        let mut severity = UpdateSeverity::NoUpdates;
        let mut status_required = Vec::new();
        let mut queued = false;
        for telemetry in listing {
            let Some(controller) = registry.controllers.get(&telemetry.id).cloned() else {
                continue;
            };
            let outcome = controller.update(telemetry, now);
            if outcome.severity == UpdateSeverity::DeviceStatusRequired {
                status_required.push(telemetry.id.clone());
            }
            severity = severity.max(outcome.severity);
            if let Some(update) = outcome.update {
                registry.pending.push(update);
                queued = true;
            }
        }

        if status_required.is_empty() {
            let listed: HashSet<&str> = listing.iter().map(|t| t.id.as_str()).collect();
            let before = registry.controllers.len();
            registry.controllers.retain(|id, _| {
                let keep = listed.contains(id.as_str());
                if !keep {
                    info!("[{}] Device {} removed", self.uri, id);
                }
                keep
            });
            if registry.controllers.len() != before {
                severity = severity.max(UpdateSeverity::UrgentUpdates);
            }
        }
        drop(registry);

        if queued {
            self.updates_pending.notify_one();
        }

        if !status_required.is_empty() {
            debug!(
                "[{}] Detailed status required for {:?}",
                self.uri, status_required
            );
            return Ok(status_required);
        }

        self.notify_devices_updated(severity >= UpdateSeverity::UrgentUpdates);
        Ok(Vec::new())
    }

    fn notify_devices_updated(&self, urgent: bool) {
        let event = HomeServerEvent::DevicesUpdated {
            uri: self.uri.clone(),
            urgent,
        };
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("[{}] Listener busy, dropping notification", self.uri);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Whether the gateway can be trusted as a source of current device state.
    ///
    /// Alive means polled since the previous check, or polled within the tolerance window.
    /// Each call records the check time, so repeated calls without a poll in between
    /// eventually report not alive.
    pub fn is_alive(&self, now: Instant) -> bool {
        let mut registry = self.registry();
        let alive = match registry.last_poll {
            None => false,
            Some(polled) => {
                registry.last_alive_check.is_some_and(|checked| polled > checked)
                    || now.saturating_duration_since(polled) <= self.poll_tolerance
            }
        };
        registry.last_alive_check = Some(now);
        alive
    }

    pub fn device_controllers(&self) -> Vec<Arc<DeviceController>> {
        self.registry().controllers.values().cloned().collect()
    }

    pub fn device_controller(&self, device_id: &str) -> Option<Arc<DeviceController>> {
        self.registry().controllers.get(device_id).cloned()
    }

    /// Queue updates for the poller, skipping void ones, and wake the poller once.
    pub fn put_device_updates(&self, updates: impl IntoIterator<Item = AsyncUpdate>) {
        let mut registry = self.registry();
        let before = registry.pending.len();
        registry
            .pending
            .extend(updates.into_iter().filter(|u| !u.is_void()));
        let queued = registry.pending.len() > before;
        drop(registry);

        if queued {
            self.updates_pending.notify_one();
        }
    }

    pub fn put_device_update(&self, update: AsyncUpdate) {
        self.put_device_updates(std::iter::once(update));
    }

    /// Return updates that could not be delivered to the front of the queue, ahead of anything
    /// queued since they were taken. The poller is not woken; it retries after its next poll.
    pub fn requeue_device_updates(&self, updates: impl IntoIterator<Item = AsyncUpdate>) {
        let mut registry = self.registry();
        let mut front: Vec<AsyncUpdate> = updates.into_iter().filter(|u| !u.is_void()).collect();
        front.append(&mut registry.pending);
        registry.pending = front;
    }

    /// Take every queued update, leaving the queue empty.
    pub fn take_device_updates(&self) -> Vec<AsyncUpdate> {
        std::mem::take(&mut self.registry().pending)
    }

    /// Resolves once updates have been queued since the last wake-up.
    pub async fn updates_pending(&self) {
        self.updates_pending.notified().await;
    }

    pub fn snapshot(&self, now: Instant) -> HomeServerSnapshot {
        let registry = self.registry();
        HomeServerSnapshot {
            uri: self.uri.clone(),
            name: self.name.clone(),
            polled_recently: registry
                .last_poll
                .is_some_and(|polled| now.saturating_duration_since(polled) <= self.poll_tolerance),
            pending_updates: registry.pending.len(),
            devices: registry
                .controllers
                .values()
                .map(|c| c.snapshot())
                .collect(),
        }
    }
}
