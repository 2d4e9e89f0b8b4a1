//! Telemetry reported by a gateway for each of its heaters.
//!
//! A device listing carries the coarse [`DeviceInfo`] block for every device. The detailed
//! [`DeviceStatusBlock`] is only present when it was asked for, either because the gateway
//! included it or because the poller fetched it for that one device.

use serde::Deserialize;
use serde::Serialize;

/// Coarse per-device state: on/off only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub on: bool,
    #[serde(default)]
    pub error_code: u16,
}

/// Detailed per-device state. Temperatures in tenths of a degree Celsius, power in the
/// device-native scale described by `power_max_units`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatusBlock {
    pub setpoint_units: i16,
    pub intake_temp_units: i16,
    pub out_temp_units: i16,
    pub power_units: u32,
    pub power_max_units: u32,
    #[serde(default)]
    pub flags_units: u32,
    #[serde(default)]
    pub error_code: u16,
}

/// One entry of a gateway's device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub connected: bool,
    #[serde(default)]
    pub info: Option<DeviceInfo>,
    #[serde(default)]
    pub status: Option<DeviceStatusBlock>,
}

impl DeviceTelemetry {
    pub fn new(id: impl Into<String>, connected: bool) -> Self {
        Self {
            id: id.into(),
            name: None,
            connected,
            info: None,
            status: None,
        }
    }

    pub fn with_info(mut self, info: DeviceInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_status(mut self, status: DeviceStatusBlock) -> Self {
        self.replace_status(status);
        self
    }

    /// Splice in a freshly fetched detailed block.
    ///
    /// The coarse block is dropped: it was read at a different time and its on/off flag may
    /// disagree with the new power reading.
    pub fn replace_status(&mut self, status: DeviceStatusBlock) {
        self.status = Some(status);
        self.info = None;
    }

    /// The heater reports itself as running, judged from whichever block is present.
    pub fn is_on(&self) -> bool {
        match (&self.status, &self.info) {
            (Some(status), _) => status.power_units > 0,
            (None, Some(info)) => info.on,
            (None, None) => false,
        }
    }

    pub fn error_code(&self) -> u16 {
        match (&self.status, &self.info) {
            (Some(status), _) => status.error_code,
            (None, Some(info)) => info.error_code,
            (None, None) => 0,
        }
    }
}
