//! Deferred device updates.
//!
//! The scheduler never talks to a gateway itself. Each decision that needs to reach a heater
//! becomes an [`AsyncUpdate`] queued on the gateway registry; the gateway's poller drains the
//! queue and performs the network calls.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Load-management status, both scheduler-wide and as reported to a device's user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElmStatus {
    Off,
    On,
    Saturation,
    Overload,
    Error,
}

impl fmt::Display for ElmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElmStatus::Off => "OFF",
            ElmStatus::On => "ON",
            ElmStatus::Saturation => "SATURATION",
            ElmStatus::Overload => "OVERLOAD",
            ElmStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A change to a device's temperature setpoint.
///
/// One variant per update, so an update can never both set and clear scald protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureInstruction {
    /// Impose a scald-protection ceiling (tenths of a degree).
    SetScaldProtection(i16),
    /// Lift scald protection and, when known, restore the user's setpoint.
    ClearScaldProtection { restore: Option<i16> },
}

/// Status notice for the user interface of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserFeedback {
    pub status: ElmStatus,
    pub expected_waiting_time_ms: u64,
}

/// A pending update for one gateway.
///
/// `device_id` is `None` for scheduler-wide feedback broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncUpdate {
    pub device_id: Option<String>,
    pub temperature: Option<TemperatureInstruction>,
    pub feedback: Option<UserFeedback>,
}

impl AsyncUpdate {
    pub fn for_device(
        device_id: impl Into<String>,
        temperature: Option<TemperatureInstruction>,
        feedback: Option<UserFeedback>,
    ) -> Self {
        Self {
            device_id: Some(device_id.into()),
            temperature,
            feedback,
        }
    }

    /// Feedback addressed to every device of a gateway.
    pub fn broadcast(status: ElmStatus) -> Self {
        Self {
            device_id: None,
            temperature: None,
            feedback: Some(UserFeedback {
                status,
                expected_waiting_time_ms: 0,
            }),
        }
    }

    /// Nothing to do; such updates are never queued.
    pub fn is_void(&self) -> bool {
        self.temperature.is_none() && self.feedback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_void_update() {
        assert!(AsyncUpdate::for_device("0127-1", None, None).is_void());
        assert!(!AsyncUpdate::broadcast(ElmStatus::Overload).is_void());
        assert!(!AsyncUpdate::for_device(
            "0127-1",
            Some(TemperatureInstruction::ClearScaldProtection { restore: None }),
            None
        )
        .is_void());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ElmStatus::Saturation).unwrap(),
            "\"saturation\""
        );
        assert_eq!(ElmStatus::Saturation.to_string(), "SATURATION");
    }
}
