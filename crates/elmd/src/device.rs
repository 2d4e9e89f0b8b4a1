//! Per-heater state machine.
//!
//! A [`DeviceController`] turns raw telemetry into demand and consumption state, and turns
//! the scheduler's power grants into the one control signal the heaters accept: a
//! scald-protection temperature ceiling.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::model::DeviceModel;
use crate::telemetry::DeviceTelemetry;
use crate::update::AsyncUpdate;
use crate::update::ElmStatus;
use crate::update::TemperatureInstruction;
use crate::update::UserFeedback;

/// Intake temperature changes at or below this (tenths of a degree) are sensor noise.
pub const INTAKE_TEMPERATURE_NOISE_UNITS: i16 = 20;

/// Minimum spacing of repeated feedback that only refreshes a waiting-time estimate.
pub const FEEDBACK_REPEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Lifecycle of a controlled heater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Initializing,
    NotConnected,
    Ready,
    ConsumptionStarted,
    ConsumptionApproved,
    ConsumptionLimited,
    ConsumptionDenied,
    ConsumptionEnded,
    Error,
}

impl DeviceStatus {
    pub fn is_consuming(self) -> bool {
        matches!(
            self,
            DeviceStatus::ConsumptionStarted
                | DeviceStatus::ConsumptionApproved
                | DeviceStatus::ConsumptionLimited
                | DeviceStatus::ConsumptionDenied
        )
    }

    /// Marker states that the next scheduling pass consumes.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            DeviceStatus::ConsumptionStarted | DeviceStatus::ConsumptionEnded
        )
    }
}

/// How much a telemetry update changed a controller, in increasing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateSeverity {
    NoUpdates,
    MinorUpdates,
    UrgentUpdates,
    /// The detailed status block is needed before this device can be scheduled.
    DeviceStatusRequired,
    Error,
}

/// Power ceiling granted by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovedPower {
    Unlimited,
    Watts(u32),
}

impl ApprovedPower {
    pub const NO_POWER: ApprovedPower = ApprovedPower::Watts(0);

    /// A demand of `demand_watt` fits under this ceiling.
    pub fn satisfies(self, demand_watt: u32) -> bool {
        match self {
            ApprovedPower::Unlimited => true,
            ApprovedPower::Watts(w) => demand_watt <= w,
        }
    }
}

/// Result of feeding telemetry to a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryOutcome {
    pub severity: UpdateSeverity,
    /// One-time safety update raised on initialization.
    pub update: Option<AsyncUpdate>,
}

/// Point-in-time copy of a controller's scheduling-relevant state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub model: &'static str,
    pub status: DeviceStatus,
    pub demand_power_watt: u32,
    pub approved_power: ApprovedPower,
    #[serde(skip)]
    pub consumption_start_time: Option<Instant>,
    pub actual_demand_temperature: Option<i16>,
    pub user_demand_temperature: Option<i16>,
    pub scald_protection_temperature: Option<i16>,
    pub intake_water_temperature: Option<i16>,
}

#[derive(Debug)]
struct ControllerState {
    status: DeviceStatus,
    demand_power_watt: u32,
    approved_power: ApprovedPower,
    consumption_start_time: Option<Instant>,
    actual_demand_temperature: Option<i16>,
    /// The user's own setpoint, remembered only while scald protection overrides it.
    user_demand_temperature: Option<i16>,
    scald_protection_temperature: Option<i16>,
    intake_water_temperature: Option<i16>,
    last_feedback: Option<(ElmStatus, Instant)>,
    scald_protection_reset: bool,
}

/// Controller for one physical heater.
#[derive(Debug)]
pub struct DeviceController {
    id: String,
    name: String,
    home_server_uri: String,
    model: DeviceModel,
    state: Mutex<ControllerState>,
}

impl DeviceController {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        home_server_uri: impl Into<String>,
        model: DeviceModel,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            home_server_uri: home_server_uri.into(),
            model,
            state: Mutex::new(ControllerState {
                status: DeviceStatus::Initializing,
                demand_power_watt: 0,
                approved_power: ApprovedPower::Unlimited,
                consumption_start_time: None,
                actual_demand_temperature: None,
                user_demand_temperature: None,
                scald_protection_temperature: None,
                intake_water_temperature: None,
                last_feedback: None,
                scald_protection_reset: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn status(&self) -> DeviceStatus {
        self.lock().status
    }

    pub fn demand_power_watt(&self) -> u32 {
        self.lock().demand_power_watt
    }

    pub fn approved_power(&self) -> ApprovedPower {
        self.lock().approved_power
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.lock();
        DeviceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            model: self.model.name,
            status: state.status,
            demand_power_watt: state.demand_power_watt,
            approved_power: state.approved_power,
            consumption_start_time: state.consumption_start_time,
            actual_demand_temperature: state.actual_demand_temperature,
            user_demand_temperature: state.user_demand_temperature,
            scald_protection_temperature: state.scald_protection_temperature,
            intake_water_temperature: state.intake_water_temperature,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed the latest telemetry for this device.
    ///
    /// Returns [`UpdateSeverity::DeviceStatusRequired`] when only the coarse block is present
    /// but the device is (or may be) consuming; the caller must fetch the detailed block and
    /// call again. The very first call also yields a one-time "clear scald protection" update,
    /// which recovers devices left limited by a previous run.
    pub fn update(&self, telemetry: &DeviceTelemetry, now: Instant) -> TelemetryOutcome {
        let mut state = self.lock();

        if state.status == DeviceStatus::Error {
            return TelemetryOutcome {
                severity: UpdateSeverity::Error,
                update: None,
            };
        }

        let mut safety_update = None;
        if state.status == DeviceStatus::Initializing && !state.scald_protection_reset {
            state.scald_protection_reset = true;
            debug!("[{}] Clearing scald protection left by a previous run", self.id);
            safety_update = Some(AsyncUpdate::for_device(
                self.id.clone(),
                Some(TemperatureInstruction::ClearScaldProtection { restore: None }),
                None,
            ));
        }

        let error_code = telemetry.error_code();
        if error_code != 0 {
            warn!(
                "[{}] Device {} reported error code {}, excluding it from scheduling",
                self.home_server_uri, self.id, error_code
            );
            state.status = DeviceStatus::Error;
            state.demand_power_watt = 0;
            state.consumption_start_time = None;
            return TelemetryOutcome {
                severity: UpdateSeverity::Error,
                update: safety_update,
            };
        }

        let mut severity = UpdateSeverity::NoUpdates;

        if !telemetry.connected {
            if state.status != DeviceStatus::NotConnected {
                let was_consuming = state.status.is_consuming();
                info!("[{}] Device {} disconnected", self.home_server_uri, self.id);
                state.status = DeviceStatus::NotConnected;
                state.demand_power_watt = 0;
                state.consumption_start_time = None;
                severity = if was_consuming {
                    UpdateSeverity::UrgentUpdates
                } else {
                    UpdateSeverity::MinorUpdates
                };
            }
            return TelemetryOutcome {
                severity,
                update: safety_update,
            };
        }

        if telemetry.status.is_none()
            && (state.status == DeviceStatus::Initializing
                || telemetry.is_on()
                || state.status.is_consuming())
        {
            return TelemetryOutcome {
                severity: UpdateSeverity::DeviceStatusRequired,
                update: safety_update,
            };
        }

        if matches!(
            state.status,
            DeviceStatus::Initializing | DeviceStatus::NotConnected
        ) {
            info!("[{}] Device {} ready", self.home_server_uri, self.id);
            state.status = DeviceStatus::Ready;
            severity = UpdateSeverity::MinorUpdates;
        }

        if let Some(detail) = &telemetry.status {
            let demand = self
                .model
                .power_units_to_watt(detail.power_units, detail.power_max_units);
            if demand != state.demand_power_watt {
                if state.demand_power_watt == 0 {
                    state.status = DeviceStatus::ConsumptionStarted;
                    state.consumption_start_time = Some(now);
                } else if demand == 0 {
                    state.status = DeviceStatus::ConsumptionEnded;
                    state.consumption_start_time = None;
                }
                debug!(
                    "[{}] Device {} demand {} W -> {} W",
                    self.home_server_uri, self.id, state.demand_power_watt, demand
                );
                state.demand_power_watt = demand;
                severity = severity.max(UpdateSeverity::UrgentUpdates);
            }

            state.actual_demand_temperature = Some(detail.setpoint_units);

            let intake_changed = match state.intake_water_temperature {
                None => true,
                Some(previous) => {
                    (detail.intake_temp_units - previous).abs() > INTAKE_TEMPERATURE_NOISE_UNITS
                }
            };
            if intake_changed {
                state.intake_water_temperature = Some(detail.intake_temp_units);
                severity = severity.max(if state.status.is_consuming() {
                    UpdateSeverity::UrgentUpdates
                } else {
                    UpdateSeverity::MinorUpdates
                });
            }
        }

        TelemetryOutcome {
            severity,
            update: safety_update,
        }
    }

    /// Apply a scheduling decision.
    ///
    /// Called by the scheduler with its own lock held: it only touches in-memory state and
    /// returns the update to queue on the owning gateway, if any.
    pub fn update_maximum_power_consumption(
        &self,
        elm_status: ElmStatus,
        approved_power: ApprovedPower,
        expected_waiting_time_ms: u64,
        now: Instant,
    ) -> Option<AsyncUpdate> {
        let mut state = self.lock();

        if matches!(
            state.status,
            DeviceStatus::NotConnected | DeviceStatus::Initializing
        ) {
            return None;
        }

        let mut temperature = None;
        if state.status != DeviceStatus::Error {
            if approved_power != state.approved_power || state.status.is_transitioning() {
                temperature = self.apply_power_ceiling(&mut state, approved_power);
                state.approved_power = approved_power;
            }

            let demand = state.demand_power_watt;
            state.status = match state.status {
                s if s.is_consuming() => {
                    if approved_power == ApprovedPower::NO_POWER {
                        DeviceStatus::ConsumptionDenied
                    } else if approved_power.satisfies(demand) {
                        DeviceStatus::ConsumptionApproved
                    } else {
                        DeviceStatus::ConsumptionLimited
                    }
                }
                DeviceStatus::ConsumptionEnded => DeviceStatus::Ready,
                s => s,
            };
        }

        let feedback = self.user_feedback(&mut state, elm_status, expected_waiting_time_ms, now);

        let update = AsyncUpdate::for_device(self.id.clone(), temperature, feedback);
        if update.is_void() {
            None
        } else {
            Some(update)
        }
    }

    fn apply_power_ceiling(
        &self,
        state: &mut ControllerState,
        approved_power: ApprovedPower,
    ) -> Option<TemperatureInstruction> {
        match approved_power {
            ApprovedPower::Unlimited => {
                let restore = state
                    .user_demand_temperature
                    .take()
                    .or(state.actual_demand_temperature);
                state.scald_protection_temperature.take()?;
                if restore.is_some() {
                    state.actual_demand_temperature = restore;
                }
                Some(TemperatureInstruction::ClearScaldProtection { restore })
            }
            ApprovedPower::Watts(watt) => {
                let temperature = self.scald_protection_temperature(state, watt);
                if state.user_demand_temperature.is_none() {
                    state.user_demand_temperature = state.actual_demand_temperature;
                }
                if state.scald_protection_temperature == Some(temperature) {
                    return None;
                }
                state.scald_protection_temperature = Some(temperature);
                Some(TemperatureInstruction::SetScaldProtection(temperature))
            }
        }
    }

    /// Translate a power ceiling into a temperature ceiling.
    ///
    /// While consuming, the flow is taken as constant so power scales with the temperature
    /// rise over intake. Otherwise the ceiling is interpolated between the model's off and max
    /// temperatures, which assumes a worst-case cold intake.
    fn scald_protection_temperature(&self, state: &ControllerState, approved_watt: u32) -> i16 {
        let off = f64::from(self.model.temperature_off_units);
        let max = f64::from(self.model.temperature_max_units);

        let consuming_rise = match (
            state.actual_demand_temperature,
            state.intake_water_temperature,
        ) {
            (Some(demand_temp), Some(intake))
                if state.status.is_consuming()
                    && state.demand_power_watt > 0
                    && demand_temp > intake =>
            {
                Some((demand_temp, intake))
            }
            _ => None,
        };

        let temperature = match consuming_rise {
            Some((demand_temp, intake)) => {
                let watt_per_unit =
                    f64::from(state.demand_power_watt) / f64::from(demand_temp - intake);
                f64::from(approved_watt) / watt_per_unit + f64::from(intake)
            }
            None => {
                let fraction =
                    (f64::from(approved_watt) / f64::from(self.model.power_max_watt)).min(1.0);
                off + (max - off) * fraction
            }
        };

        temperature.round().clamp(off, max) as i16
    }

    fn user_feedback(
        &self,
        state: &mut ControllerState,
        elm_status: ElmStatus,
        expected_waiting_time_ms: u64,
        now: Instant,
    ) -> Option<UserFeedback> {
        let status = match elm_status {
            ElmStatus::Off | ElmStatus::Error => elm_status,
            _ => match state.status {
                DeviceStatus::Ready => elm_status,
                DeviceStatus::ConsumptionStarted | DeviceStatus::ConsumptionApproved => {
                    ElmStatus::On
                }
                DeviceStatus::ConsumptionLimited => ElmStatus::Saturation,
                DeviceStatus::ConsumptionDenied => ElmStatus::Overload,
                DeviceStatus::Error => ElmStatus::Error,
                s @ (DeviceStatus::Initializing
                | DeviceStatus::NotConnected
                | DeviceStatus::ConsumptionEnded) => {
                    warn!("[{}] No user feedback for device status {:?}", self.id, s);
                    return None;
                }
            },
        };

        let due = match state.last_feedback {
            None => true,
            Some((last_status, at)) => {
                last_status != status
                    || (expected_waiting_time_ms > 0
                        && now.saturating_duration_since(at) >= FEEDBACK_REPEAT_INTERVAL)
            }
        };
        if !due {
            return None;
        }

        state.last_feedback = Some((status, now));
        Some(UserFeedback {
            status,
            expected_waiting_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model;
    use crate::telemetry::DeviceInfo;
    use crate::telemetry::DeviceStatusBlock;

    const ID: &str = "0127-00a3f1";

    fn controller() -> DeviceController {
        DeviceController::new(ID, "Kitchen", "http://hs", model::resolve(ID).unwrap())
    }

    /// Detailed telemetry for the 27 kW model, where one power unit is 100 W.
    fn detailed(power_watt: u32, setpoint: i16, intake: i16) -> DeviceTelemetry {
        DeviceTelemetry::new(ID, true).with_status(DeviceStatusBlock {
            setpoint_units: setpoint,
            intake_temp_units: intake,
            out_temp_units: setpoint,
            power_units: power_watt / 100,
            power_max_units: 270,
            flags_units: 0,
            error_code: 0,
        })
    }

    fn coarse(on: bool) -> DeviceTelemetry {
        DeviceTelemetry::new(ID, true).with_info(DeviceInfo { on, error_code: 0 })
    }

    #[test]
    fn test_first_update_requires_status_and_clears_scald_protection() {
        let c = controller();
        let now = Instant::now();

        let outcome = c.update(&coarse(false), now);
        assert_eq!(outcome.severity, UpdateSeverity::DeviceStatusRequired);
        assert_eq!(
            outcome.update.unwrap().temperature,
            Some(TemperatureInstruction::ClearScaldProtection { restore: None })
        );

        let outcome = c.update(&detailed(0, 380, 100), now);
        assert_eq!(outcome.severity, UpdateSeverity::MinorUpdates);
        assert!(outcome.update.is_none());
        assert_eq!(c.status(), DeviceStatus::Ready);
    }

    #[test]
    fn test_coarse_on_requires_status() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);

        assert_eq!(
            c.update(&coarse(false), now).severity,
            UpdateSeverity::NoUpdates
        );
        assert_eq!(
            c.update(&coarse(true), now).severity,
            UpdateSeverity::DeviceStatusRequired
        );
    }

    #[test]
    fn test_identical_telemetry_is_idempotent() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(10_000, 380, 100), now);

        let outcome = c.update(&detailed(10_000, 380, 100), now);
        assert_eq!(outcome.severity, UpdateSeverity::NoUpdates);
        assert!(outcome.update.is_none());
    }

    #[test]
    fn test_consumption_start_and_end() {
        let c = controller();
        let start = Instant::now();
        c.update(&detailed(0, 380, 100), start);

        let outcome = c.update(&detailed(12_000, 380, 100), start);
        assert_eq!(outcome.severity, UpdateSeverity::UrgentUpdates);
        let snapshot = c.snapshot();
        assert_eq!(snapshot.status, DeviceStatus::ConsumptionStarted);
        assert_eq!(snapshot.demand_power_watt, 12_000);
        assert_eq!(snapshot.consumption_start_time, Some(start));

        c.update_maximum_power_consumption(ElmStatus::On, ApprovedPower::Unlimited, 0, start);
        assert_eq!(c.status(), DeviceStatus::ConsumptionApproved);

        let outcome = c.update(&detailed(0, 380, 100), start);
        assert_eq!(outcome.severity, UpdateSeverity::UrgentUpdates);
        assert_eq!(c.status(), DeviceStatus::ConsumptionEnded);

        c.update_maximum_power_consumption(ElmStatus::On, ApprovedPower::Unlimited, 0, start);
        assert_eq!(c.status(), DeviceStatus::Ready);
    }

    #[test]
    fn test_intake_noise_threshold() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);

        assert_eq!(
            c.update(&detailed(0, 380, 120), now).severity,
            UpdateSeverity::NoUpdates
        );
        assert_eq!(
            c.update(&detailed(0, 380, 121), now).severity,
            UpdateSeverity::MinorUpdates
        );

        c.update(&detailed(10_000, 380, 121), now);
        assert_eq!(
            c.update(&detailed(10_000, 380, 150), now).severity,
            UpdateSeverity::UrgentUpdates
        );
    }

    #[test]
    fn test_disconnect() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(10_000, 380, 100), now);

        let offline = DeviceTelemetry::new(ID, false).with_info(DeviceInfo::default());
        let outcome = c.update(&offline, now);
        assert_eq!(outcome.severity, UpdateSeverity::UrgentUpdates);
        assert_eq!(c.status(), DeviceStatus::NotConnected);
        assert_eq!(c.demand_power_watt(), 0);
        assert!(c
            .update_maximum_power_consumption(ElmStatus::Overload, ApprovedPower::NO_POWER, 0, now)
            .is_none());
    }

    #[test]
    fn test_error_code_is_terminal() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);

        let failing = DeviceTelemetry::new(ID, true).with_info(DeviceInfo {
            on: false,
            error_code: 7,
        });
        assert_eq!(c.update(&failing, now).severity, UpdateSeverity::Error);
        assert_eq!(
            c.update(&detailed(0, 380, 100), now).severity,
            UpdateSeverity::Error
        );

        let update = c
            .update_maximum_power_consumption(ElmStatus::On, ApprovedPower::Unlimited, 0, now)
            .unwrap();
        assert_eq!(update.feedback.unwrap().status, ElmStatus::Error);
        assert!(update.temperature.is_none());
    }

    #[test]
    fn test_scald_temperature_while_consuming() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);
        c.update(&detailed(10_000, 380, 100), now);

        let update = c
            .update_maximum_power_consumption(
                ElmStatus::Overload,
                ApprovedPower::Watts(5_000),
                0,
                now,
            )
            .unwrap();

        // 10 kW over a 28.0 degree rise; 5 kW buys half the rise.
        assert_eq!(
            update.temperature,
            Some(TemperatureInstruction::SetScaldProtection(240))
        );
        assert_eq!(c.status(), DeviceStatus::ConsumptionLimited);
        assert_eq!(update.feedback.unwrap().status, ElmStatus::Saturation);
    }

    #[test]
    fn test_scald_temperature_clamped_to_model_range() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);
        c.update(&detailed(20_000, 380, 100), now);

        let update = c
            .update_maximum_power_consumption(
                ElmStatus::Overload,
                ApprovedPower::Watts(1_000),
                0,
                now,
            )
            .unwrap();
        assert_eq!(
            update.temperature,
            Some(TemperatureInstruction::SetScaldProtection(200))
        );
    }

    #[test]
    fn test_scald_temperature_when_idle_interpolates() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);

        let update = c
            .update_maximum_power_consumption(
                ElmStatus::Overload,
                ApprovedPower::Watts(13_500),
                0,
                now,
            )
            .unwrap();
        // Half of 27 kW: halfway between 20.0 and 60.0 degrees.
        assert_eq!(
            update.temperature,
            Some(TemperatureInstruction::SetScaldProtection(400))
        );

        let update = c
            .update_maximum_power_consumption(ElmStatus::Overload, ApprovedPower::NO_POWER, 0, now)
            .unwrap();
        assert_eq!(
            update.temperature,
            Some(TemperatureInstruction::SetScaldProtection(200))
        );
    }

    #[test]
    fn test_unlimited_restores_user_temperature() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 420, 100), now);
        c.update(&detailed(10_000, 420, 100), now);

        let limited = |watt| ApprovedPower::Watts(watt);
        c.update_maximum_power_consumption(ElmStatus::Overload, limited(5_000), 0, now);
        // The device now reports the scald ceiling as its setpoint.
        c.update(&detailed(5_000, 260, 100), now);
        c.update_maximum_power_consumption(ElmStatus::Overload, limited(4_000), 0, now);
        assert_eq!(c.snapshot().user_demand_temperature, Some(420));

        let update = c
            .update_maximum_power_consumption(ElmStatus::On, ApprovedPower::Unlimited, 0, now)
            .unwrap();
        assert_eq!(
            update.temperature,
            Some(TemperatureInstruction::ClearScaldProtection { restore: Some(420) })
        );
        let snapshot = c.snapshot();
        assert_eq!(snapshot.user_demand_temperature, None);
        assert_eq!(snapshot.scald_protection_temperature, None);
        assert_eq!(snapshot.actual_demand_temperature, Some(420));
    }

    #[test]
    fn test_repeated_decision_is_quiet() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);
        c.update(&detailed(10_000, 380, 100), now);

        assert!(c
            .update_maximum_power_consumption(ElmStatus::On, ApprovedPower::Unlimited, 0, now)
            .is_some());
        assert!(c
            .update_maximum_power_consumption(ElmStatus::On, ApprovedPower::Unlimited, 0, now)
            .is_none());
    }

    #[test]
    fn test_waiting_time_feedback_debounce() {
        let c = controller();
        let start = Instant::now();
        c.update(&detailed(0, 380, 100), start);
        c.update(&detailed(10_000, 380, 100), start);

        let first = c
            .update_maximum_power_consumption(
                ElmStatus::Overload,
                ApprovedPower::NO_POWER,
                60_000,
                start,
            )
            .unwrap();
        assert_eq!(
            first.feedback,
            Some(UserFeedback {
                status: ElmStatus::Overload,
                expected_waiting_time_ms: 60_000
            })
        );

        let soon = start + Duration::from_millis(1_000);
        assert!(c
            .update_maximum_power_consumption(
                ElmStatus::Overload,
                ApprovedPower::NO_POWER,
                59_000,
                soon
            )
            .is_none());

        let later = start + FEEDBACK_REPEAT_INTERVAL;
        let refreshed = c
            .update_maximum_power_consumption(
                ElmStatus::Overload,
                ApprovedPower::NO_POWER,
                55_000,
                later,
            )
            .unwrap();
        assert_eq!(refreshed.feedback.unwrap().expected_waiting_time_ms, 55_000);
        assert!(refreshed.temperature.is_none());
    }

    #[test]
    fn test_ready_device_mirrors_scheduler_status() {
        let c = controller();
        let now = Instant::now();
        c.update(&detailed(0, 380, 100), now);

        let update = c
            .update_maximum_power_consumption(
                ElmStatus::Saturation,
                ApprovedPower::Unlimited,
                0,
                now,
            )
            .unwrap();
        assert_eq!(update.feedback.unwrap().status, ElmStatus::Saturation);
        assert!(update.temperature.is_none());
    }
}
