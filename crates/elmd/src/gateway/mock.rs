use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::FeedbackClient;
use super::GatewayClient;
use super::GatewayError;
use super::GatewayResult;
use crate::telemetry::DeviceStatusBlock;
use crate::telemetry::DeviceTelemetry;
use crate::update::ElmStatus;

/// A call the mock received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ListDevices,
    DeviceStatus(String),
    SetScaldProtection(String, i16),
    ClearScaldProtection(String, Option<i16>),
    Feedback(Option<String>, ElmStatus, u64),
}

/// In-memory gateway for tests.
///
/// `list_devices` returns `listing`, unless an error has been queued in `list_failures`.
#[derive(Debug, Default)]
pub struct MockGateway {
    pub listing: Mutex<Vec<DeviceTelemetry>>,
    pub statuses: Mutex<HashMap<String, DeviceStatusBlock>>,
    pub list_failures: Mutex<VecDeque<GatewayError>>,
    pub command_failures: Mutex<VecDeque<GatewayError>>,
    pub calls: Mutex<Vec<MockCall>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listing(&self, listing: Vec<DeviceTelemetry>) {
        *self.listing.lock().unwrap() = listing;
    }

    pub fn set_status(&self, device_id: &str, status: DeviceStatusBlock) {
        self.statuses
            .lock()
            .unwrap()
            .insert(device_id.to_string(), status);
    }

    pub fn fail_next_list(&self, error: GatewayError) {
        self.list_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_command(&self, error: GatewayError) {
        self.command_failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn command_result(&self) -> GatewayResult<()> {
        match self.command_failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn list_devices(&self) -> GatewayResult<Vec<DeviceTelemetry>> {
        self.record(MockCall::ListDevices);
        if let Some(e) = self.list_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(self.listing.lock().unwrap().clone())
    }

    async fn device_status(&self, device_id: &str) -> GatewayResult<DeviceStatusBlock> {
        self.record(MockCall::DeviceStatus(device_id.to_string()));
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_scald_protection_temperature(
        &self,
        device_id: &str,
        temperature_units: i16,
    ) -> GatewayResult<i16> {
        self.record(MockCall::SetScaldProtection(
            device_id.to_string(),
            temperature_units,
        ));
        self.command_result().map(|()| temperature_units)
    }

    async fn clear_scald_protection(
        &self,
        device_id: &str,
        previous_temperature_units: Option<i16>,
    ) -> GatewayResult<()> {
        self.record(MockCall::ClearScaldProtection(
            device_id.to_string(),
            previous_temperature_units,
        ));
        self.command_result()
    }
}

#[async_trait]
impl FeedbackClient for MockGateway {
    async fn update_user_feedback(
        &self,
        device_id: Option<&str>,
        status: ElmStatus,
        expected_waiting_time_ms: u64,
    ) -> GatewayResult<()> {
        self.record(MockCall::Feedback(
            device_id.map(str::to_string),
            status,
            expected_waiting_time_ms,
        ));
        Ok(())
    }
}
