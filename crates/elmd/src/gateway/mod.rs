//! Boundary to the physical gateways.
//!
//! The core only sees these traits. The network adapter (`http`, behind the `gateway_http`
//! feature) implements them against a gateway's REST interface; tests use an in-memory mock.

#[cfg(feature = "gateway_http")]
mod http;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use async_trait::async_trait;

use crate::telemetry::DeviceStatusBlock;
use crate::telemetry::DeviceTelemetry;
use crate::update::ElmStatus;

#[cfg(feature = "gateway_http")]
pub use http::HttpGateway;

/// Classification of a failed gateway call, which decides whether polling continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The call was cancelled; stop immediately.
    Interrupted,
    /// The gateway answered with data we cannot use. No recovery expected.
    ApplicationDataError,
    /// The call could not be carried out locally. No recovery expected.
    ExecutionError,
    /// The gateway answered with an error status. May recover.
    ApplicationFailureResponse,
    ApplicationTimeout,
    NetworkTimeout,
}

impl FailureKind {
    /// Later calls may succeed, so the poller keeps going.
    pub fn may_recover(self) -> bool {
        matches!(
            self,
            FailureKind::ApplicationFailureResponse
                | FailureKind::ApplicationTimeout
                | FailureKind::NetworkTimeout
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Interrupted => "interrupted",
            FailureKind::ApplicationDataError => "application data error",
            FailureKind::ExecutionError => "execution error",
            FailureKind::ApplicationFailureResponse => "application failure response",
            FailureKind::ApplicationTimeout => "application timeout",
            FailureKind::NetworkTimeout => "network timeout",
        };
        f.write_str(s)
    }
}

/// A failed gateway call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Gateway {kind}: {message}")]
pub struct GatewayError {
    pub kind: FailureKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Telemetry and command access to one gateway.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Fetch the full device listing. Detailed blocks may be missing.
    async fn list_devices(&self) -> GatewayResult<Vec<DeviceTelemetry>>;

    /// Fetch the detailed status block of one device.
    async fn device_status(&self, device_id: &str) -> GatewayResult<DeviceStatusBlock>;

    /// Impose a scald-protection ceiling; returns the setpoint the device actually applied.
    async fn set_scald_protection_temperature(
        &self,
        device_id: &str,
        temperature_units: i16,
    ) -> GatewayResult<i16>;

    /// Lift scald protection, restoring `previous_temperature_units` when given.
    async fn clear_scald_protection(
        &self,
        device_id: &str,
        previous_temperature_units: Option<i16>,
    ) -> GatewayResult<()>;
}

/// Delivery of status notices to device user interfaces.
#[async_trait]
pub trait FeedbackClient: Send + Sync {
    /// `device_id` is `None` for a notice to every device the gateway serves.
    async fn update_user_feedback(
        &self,
        device_id: Option<&str>,
        status: ElmStatus,
        expected_waiting_time_ms: u64,
    ) -> GatewayResult<()>;
}
