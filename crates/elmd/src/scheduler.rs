//! Global power scheduler.
//!
//! One [`Scheduler`] decides, every cycle, which heaters may draw full power and which are
//! denied, keeping the aggregate demand under the configured overload limit. Decisions are
//! pushed into each [`DeviceController`] and queued as updates on the owning gateway; the
//! scheduler itself never performs network I/O.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ConfigError;
use crate::device::ApprovedPower;
use crate::device::DeviceController;
use crate::device::DeviceSnapshot;
use crate::device::DeviceStatus;
use crate::home_server::HomeServer;
use crate::home_server::HomeServerEvent;
use crate::home_server::HomeServerSnapshot;
use crate::update::AsyncUpdate;
use crate::update::ElmStatus;

/// Capacity for the gateway→scheduler change channel.
/// Notifications beyond this are dropped; the next periodic pass picks the changes up.
const HOME_SERVER_EVENT_CHANNEL_SIZE: usize = 1024;

/// Capacity of the observer channel. Observers that fall further behind lag.
const SCHEDULER_EVENT_CHANNEL_SIZE: usize = 64;

/// Power budget and timing of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub saturation_power_limit_watt: u32,
    pub overload_power_limit_watt: u32,
    pub scheduling_interval: Duration,
    /// Typical length of a tap; basis of the waiting-time estimates.
    pub mean_consumption: Duration,
    /// Abort a cycle when a gateway is not alive. Only disabled for debugging.
    pub check_alive: bool,
}

impl SchedulerConfig {
    pub fn new(saturation_power_limit_watt: u32, overload_power_limit_watt: u32) -> Self {
        Self {
            saturation_power_limit_watt,
            overload_power_limit_watt,
            scheduling_interval: Duration::from_millis(1000),
            mean_consumption: Duration::from_secs(180),
            check_alive: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.saturation_power_limit_watt >= self.overload_power_limit_watt {
            return Err(ConfigError::Invalid(format!(
                "saturation power limit ({} W) must be below the overload power limit ({} W)",
                self.saturation_power_limit_watt, self.overload_power_limit_watt
            )));
        }
        if self.scheduling_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduling interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Notifications for observers of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    StatusChanged { from: ElmStatus, to: ElmStatus },
    TotalDemandChanged(u32),
    TotalGrantedChanged(u32),
}

/// Serializable view of the scheduler for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub status: ElmStatus,
    pub saturation_power_limit_watt: u32,
    pub overload_power_limit_watt: u32,
    pub total_demand_power_watt: u32,
    pub total_granted_power_watt: u32,
    pub overload_duration_ms: Option<u64>,
    pub home_servers: Vec<HomeServerSnapshot>,
}

#[derive(Debug)]
struct SchedulerState {
    status: ElmStatus,
    total_demand_power_watt: u32,
    total_granted_power_watt: u32,
    overload_mode_begin_time: Option<Instant>,
    /// Push the decision to every device on the next completed pass, not only to
    /// transitioning ones. Set on start, since `stop()` leaves every device at `NO_POWER`.
    full_update_pending: bool,
    home_servers: Vec<Arc<HomeServer>>,
}

/// A device as seen by one scheduling pass.
struct Candidate {
    home_server: usize,
    controller: Arc<DeviceController>,
    snapshot: DeviceSnapshot,
}

pub struct Scheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<SchedulerEvent>,
    home_server_tx: mpsc::Sender<HomeServerEvent>,
    /// Owned by the decision loop while it runs.
    home_server_rx: Mutex<Option<mpsc::Receiver<HomeServerEvent>>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<mpsc::Receiver<HomeServerEvent>>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let (home_server_tx, home_server_rx) = mpsc::channel(HOME_SERVER_EVENT_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(SCHEDULER_EVENT_CHANNEL_SIZE);
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(SchedulerState {
                status: ElmStatus::Off,
                total_demand_power_watt: 0,
                total_granted_power_watt: 0,
                overload_mode_begin_time: None,
                full_update_pending: true,
                home_servers: Vec::new(),
            }),
            events,
            home_server_tx,
            home_server_rx: Mutex::new(Some(home_server_rx)),
            stop_tx,
            task: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ElmStatus {
        self.state().status
    }

    pub fn total_demand_power_watt(&self) -> u32 {
        self.state().total_demand_power_watt
    }

    pub fn total_granted_power_watt(&self) -> u32 {
        self.state().total_granted_power_watt
    }

    /// Observe status and aggregate changes. Never blocks the scheduler.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Register a gateway. Returns false if one with the same URI is already registered.
    pub fn add_home_server(&self, home_server: Arc<HomeServer>) -> bool {
        let mut state = self.state();
        if state
            .home_servers
            .iter()
            .any(|hs| hs.uri() == home_server.uri())
        {
            warn!("Home server {} is already registered", home_server.uri());
            return false;
        }
        home_server.subscribe(self.home_server_tx.clone());
        info!("Home server {} registered", home_server.uri());
        state.home_servers.push(home_server);
        true
    }

    pub fn remove_home_server(&self, uri: &str) -> Option<Arc<HomeServer>> {
        let mut state = self.state();
        let index = state.home_servers.iter().position(|hs| hs.uri() == uri)?;
        info!("Home server {} deregistered", uri);
        Some(state.home_servers.remove(index))
    }

    pub fn home_servers(&self) -> Vec<Arc<HomeServer>> {
        self.state().home_servers.clone()
    }

    /// Launch the decision loop. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .home_server_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            warn!("Scheduler already running");
            return;
        };

        self.stop_tx.send_replace(false);
        {
            let mut state = self.state();
            state.full_update_pending = true;
            self.set_status(&mut state, ElmStatus::On, Instant::now());
        }

        let scheduler = Arc::clone(self);
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move { scheduler.run(rx, stop_rx).await });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(
            "Scheduler started (saturation {} W, overload {} W)",
            self.config.saturation_power_limit_watt, self.config.overload_power_limit_watt
        );
    }

    /// Stop the decision loop and deny power to every device.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(rx) => {
                    *self
                        .home_server_rx
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(rx);
                }
                Err(e) => error!("Scheduler task failed: {}", e),
            }
        }

        let now = Instant::now();
        let mut state = self.state();
        self.set_status(&mut state, ElmStatus::Off, now);
        for home_server in &state.home_servers {
            let updates: Vec<AsyncUpdate> = home_server
                .device_controllers()
                .iter()
                .filter_map(|c| {
                    c.update_maximum_power_consumption(
                        ElmStatus::Off,
                        ApprovedPower::NO_POWER,
                        0,
                        now,
                    )
                })
                .collect();
            home_server.put_device_updates(updates);
        }
        self.set_totals(&mut state, 0, 0);
        info!("Scheduler stopped");
    }

    async fn run(
        &self,
        mut rx: mpsc::Receiver<HomeServerEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> mpsc::Receiver<HomeServerEvent> {
        let mut interval = tokio::time::interval(self.config.scheduling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = stop_rx.changed() => continue,
                _ = interval.tick() => {}
                Some(event) = rx.recv() => {
                    let HomeServerEvent::DevicesUpdated { uri, urgent } = event;
                    if !urgent {
                        continue;
                    }
                    debug!("Urgent device change on {}", uri);
                    interval.reset();
                }
            }
            self.process_devices(Instant::now());
        }

        rx
    }

    /// Run one decision cycle over every registered gateway's devices.
    ///
    /// Deterministic for a given device state and `now`.
    ///
    /// When a gateway is not alive the cycle is abandoned with status `ERROR` and every grant
    /// is left as it was. `ERROR` is therefore not fail-safe: devices keep their last ceiling,
    /// and a consumption that starts meanwhile runs under its initial `Unlimited` grant until
    /// the next completed cycle. Only [`Scheduler::stop`] forces `NO_POWER`.
    pub fn process_devices(&self, now: Instant) {
        let mut state = self.state();

        if self.config.check_alive {
            let dead: Vec<&str> = state
                .home_servers
                .iter()
                .filter(|hs| !hs.is_alive(now))
                .map(|hs| hs.uri())
                .collect();
            if !dead.is_empty() {
                warn!(
                    "Home servers not alive: {:?}; skipping allocation",
                    dead
                );
                self.set_status(&mut state, ElmStatus::Error, now);
                return;
            }
        }

        let mut consuming = Vec::new();
        let mut standby = Vec::new();
        let mut total_demand: u32 = 0;
        for (index, home_server) in state.home_servers.iter().enumerate() {
            for controller in home_server.device_controllers() {
                let snapshot = controller.snapshot();
                let candidate = Candidate {
                    home_server: index,
                    controller,
                    snapshot,
                };
                let demand = candidate.snapshot.demand_power_watt;
                if demand > 0 {
                    total_demand = total_demand.saturating_add(demand);
                    consuming.push(candidate);
                } else {
                    standby.push(candidate);
                }
            }
        }

        let target = if total_demand <= self.config.saturation_power_limit_watt {
            ElmStatus::On
        } else if total_demand <= self.config.overload_power_limit_watt {
            ElmStatus::Saturation
        } else {
            ElmStatus::Overload
        };

        let mut updates: Vec<Vec<AsyncUpdate>> = vec![Vec::new(); state.home_servers.len()];
        let total_granted = if target == ElmStatus::Overload {
            self.set_status(&mut state, target, now);
            self.allocate_overload(&mut consuming, &standby, &mut updates, now)
        } else {
            let update_all = state.full_update_pending
                || state.status != target
                || state.overload_mode_begin_time.is_some();
            self.set_status(&mut state, target, now);

            for candidate in consuming.iter().chain(standby.iter()) {
                if update_all || candidate.snapshot.status.is_transitioning() {
                    if let Some(update) = candidate.controller.update_maximum_power_consumption(
                        target,
                        ApprovedPower::Unlimited,
                        0,
                        now,
                    ) {
                        updates[candidate.home_server].push(update);
                    }
                }
            }
            total_demand
        };

        for (home_server, updates) in state.home_servers.iter().zip(updates) {
            home_server.put_device_updates(updates);
        }
        state.full_update_pending = false;

        self.set_totals(&mut state, total_demand, total_granted);
    }

    /// Grant full power in priority order until the overload limit is reached; deny the rest.
    ///
    /// Returns the granted total.
    fn allocate_overload(
        &self,
        consuming: &mut [Candidate],
        standby: &[Candidate],
        updates: &mut [Vec<AsyncUpdate>],
        now: Instant,
    ) -> u32 {
        let overload_limit = self.config.overload_power_limit_watt;

        // Running consumptions first, then first come first served.
        consuming.sort_by(|a, b| {
            let a_satisfied = a.snapshot.approved_power.satisfies(a.snapshot.demand_power_watt);
            let b_satisfied = b.snapshot.approved_power.satisfies(b.snapshot.demand_power_watt);
            b_satisfied
                .cmp(&a_satisfied)
                .then(a.snapshot.consumption_start_time.cmp(&b.snapshot.consumption_start_time))
                .then(a.snapshot.demand_power_watt.cmp(&b.snapshot.demand_power_watt))
        });

        let mut waiting_times: Vec<u64> = consuming
            .iter()
            .map(|c| {
                let elapsed = c
                    .snapshot
                    .consumption_start_time
                    .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
                self.config
                    .mean_consumption
                    .saturating_sub(elapsed)
                    .as_millis() as u64
            })
            .collect();
        waiting_times.sort_unstable();

        let mut granted: u32 = 0;
        let mut next_slot = 0;
        for candidate in consuming.iter() {
            let demand = candidate.snapshot.demand_power_watt;
            let (approved, waiting_time) = if candidate.snapshot.status
                == DeviceStatus::ConsumptionApproved
                || granted.saturating_add(demand) <= overload_limit
            {
                granted = granted.saturating_add(demand);
                (ApprovedPower::Unlimited, 0)
            } else {
                let waiting_time = waiting_times.get(next_slot).copied().unwrap_or(0);
                next_slot += 1;
                (ApprovedPower::NO_POWER, waiting_time)
            };

            if let Some(update) = candidate.controller.update_maximum_power_consumption(
                ElmStatus::Overload,
                approved,
                waiting_time,
                now,
            ) {
                updates[candidate.home_server].push(update);
            }
        }

        let longest_waiting_time = waiting_times.last().copied().unwrap_or(0);
        for candidate in standby {
            if let Some(update) = candidate.controller.update_maximum_power_consumption(
                ElmStatus::Overload,
                ApprovedPower::NO_POWER,
                longest_waiting_time,
                now,
            ) {
                updates[candidate.home_server].push(update);
            }
        }

        if granted > overload_limit {
            warn!(
                "Granted {} W exceeds the overload limit of {} W (running consumptions kept)",
                granted, overload_limit
            );
        }

        granted
    }

    fn set_status(&self, state: &mut SchedulerState, status: ElmStatus, now: Instant) {
        if state.status == status {
            return;
        }
        let previous = state.status;
        state.status = status;
        info!("ELM status {} -> {}", previous, status);

        if status == ElmStatus::Overload {
            state.overload_mode_begin_time = Some(now);
        } else if let Some(begin) = state.overload_mode_begin_time.take() {
            info!(
                "Overload mode ended after {} ms",
                now.saturating_duration_since(begin).as_millis()
            );
        }

        // Err only means nobody is listening.
        let _ = self.events.send(SchedulerEvent::StatusChanged {
            from: previous,
            to: status,
        });

        for home_server in &state.home_servers {
            home_server.put_device_update(AsyncUpdate::broadcast(status));
        }
    }

    fn set_totals(&self, state: &mut SchedulerState, demand: u32, granted: u32) {
        if state.total_demand_power_watt != demand {
            state.total_demand_power_watt = demand;
            let _ = self.events.send(SchedulerEvent::TotalDemandChanged(demand));
        }
        if state.total_granted_power_watt != granted {
            state.total_granted_power_watt = granted;
            let _ = self.events.send(SchedulerEvent::TotalGrantedChanged(granted));
        }
    }

    pub fn snapshot(&self, now: Instant) -> SchedulerSnapshot {
        let state = self.state();
        SchedulerSnapshot {
            status: state.status,
            saturation_power_limit_watt: self.config.saturation_power_limit_watt,
            overload_power_limit_watt: self.config.overload_power_limit_watt,
            total_demand_power_watt: state.total_demand_power_watt,
            total_granted_power_watt: state.total_granted_power_watt,
            overload_duration_ms: state
                .overload_mode_begin_time
                .map(|begin| now.saturating_duration_since(begin).as_millis() as u64),
            home_servers: state
                .home_servers
                .iter()
                .map(|hs| hs.snapshot(now))
                .collect(),
        }
    }
}
