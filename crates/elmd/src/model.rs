//! Static catalogue of heater models.
//!
//! Every device id starts with a 4-hex-digit type code (e.g. `0127-00a3f1`). The high byte
//! names the device class, the low byte the variant within that class. The catalogue maps
//! the full code to the electrical and thermal characteristics the scheduler relies on.

use crate::error::ElmError;
use crate::error::Result;

/// Electrical and thermal characteristics of one heater model.
///
/// Temperatures are in tenths of a degree Celsius, like every temperature the devices report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceModel {
    pub type_code: u16,
    pub name: &'static str,
    pub power_max_watt: u32,
    /// Device-native scale of the power reading: `power_max_units` means `power_max_watt`.
    pub power_max_units: u32,
    /// Below this reference temperature the heater stays off whatever the intake temperature.
    pub temperature_off_units: i16,
    pub temperature_max_units: i16,
    pub remote_controllable: bool,
}

impl DeviceModel {
    /// Convert a device-native power reading into watts, using the scale the device reported.
    ///
    /// The result is clamped to `[0, power_max_watt]`.
    pub fn power_units_to_watt(&self, power_units: u32, reported_max_units: u32) -> u32 {
        let scale = if reported_max_units == 0 {
            self.power_max_units
        } else {
            reported_max_units
        };
        let watt = u64::from(power_units) * u64::from(self.power_max_watt) / u64::from(scale);
        watt.min(u64::from(self.power_max_watt)) as u32
    }
}

const fn heater(
    type_code: u16,
    name: &'static str,
    power_max_watt: u32,
    temperature_max_units: i16,
    remote_controllable: bool,
) -> DeviceModel {
    DeviceModel {
        type_code,
        name,
        power_max_watt,
        power_max_units: power_max_watt / 100,
        temperature_off_units: 200,
        temperature_max_units,
        remote_controllable,
    }
}

const CATALOGUE: &[DeviceModel] = &[
    heater(0x0118, "DSX 18", 18_000, 600, true),
    heater(0x0121, "DSX 21", 21_000, 600, true),
    heater(0x0124, "DSX 24", 24_000, 600, true),
    heater(0x0127, "DSX 27", 27_000, 600, true),
    heater(0x0208, "MBX 8", 8_800, 550, false),
    heater(0x0318, "DEX 18", 18_000, 550, true),
    heater(0x0324, "DEX 24", 24_000, 550, true),
];

/// The largest `power_max_watt` of any remote-controllable model.
pub fn max_device_power_watt() -> u32 {
    CATALOGUE
        .iter()
        .filter(|m| m.remote_controllable)
        .map(|m| m.power_max_watt)
        .max()
        .unwrap_or(0)
}

/// Parse the type code embedded in a device id.
pub fn type_code(device_id: &str) -> Result<u16> {
    let prefix = device_id
        .get(..4)
        .ok_or_else(|| ElmError::InvalidDeviceId(device_id.to_string()))?;
    u16::from_str_radix(prefix, 16).map_err(|_| ElmError::InvalidDeviceId(device_id.to_string()))
}

/// Resolve the model of a device from its id.
///
/// Fails with [`ElmError::UnsupportedDeviceModel`] for unknown codes and for models that
/// cannot be remote controlled.
pub fn resolve(device_id: &str) -> Result<DeviceModel> {
    let type_code = type_code(device_id)?;
    CATALOGUE
        .iter()
        .find(|m| m.type_code == type_code && m.remote_controllable)
        .copied()
        .ok_or_else(|| ElmError::UnsupportedDeviceModel {
            device_id: device_id.to_string(),
            type_code,
        })
}
