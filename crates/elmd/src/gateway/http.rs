use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::FailureKind;
use super::FeedbackClient;
use super::GatewayClient;
use super::GatewayError;
use super::GatewayResult;
use crate::telemetry::DeviceStatusBlock;
use crate::telemetry::DeviceTelemetry;
use crate::update::ElmStatus;

const AUTH_USER: &str = "elm";

#[derive(Deserialize)]
struct DeviceListing {
    devices: Vec<DeviceTelemetry>,
}

#[derive(Serialize)]
struct ScaldProtectionRequest {
    temperature: i16,
}

#[derive(Deserialize)]
struct ScaldProtectionResponse {
    setpoint: i16,
}

#[derive(Serialize)]
struct ClearScaldProtectionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    restore: Option<i16>,
}

#[derive(Serialize)]
struct FeedbackRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
    status: ElmStatus,
    expected_waiting_time_ms: u64,
}

/// Gateway client speaking the JSON REST interface of a Home Server.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    password: String,
}

impl HttpGateway {
    pub fn new(uri: &str, password: &str, timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::new(FailureKind::ExecutionError, e.to_string()))?;
        Ok(Self {
            client,
            base_url: uri.trim_end_matches('/').to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> GatewayResult<reqwest::Response> {
        request
            .basic_auth(AUTH_USER, Some(&self.password))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(classify)
    }
}

/// Map a reqwest failure onto the poller's failure classes.
fn classify(e: reqwest::Error) -> GatewayError {
    let kind = if e.is_timeout() {
        FailureKind::NetworkTimeout
    } else if e.is_decode() {
        FailureKind::ApplicationDataError
    } else if let Some(status) = e.status() {
        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                FailureKind::ApplicationTimeout
            }
            _ => FailureKind::ApplicationFailureResponse,
        }
    } else if e.is_connect() || e.is_request() {
        FailureKind::NetworkTimeout
    } else {
        FailureKind::ExecutionError
    };
    GatewayError::new(kind, e.to_string())
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn list_devices(&self) -> GatewayResult<Vec<DeviceTelemetry>> {
        let response = self.send(self.client.get(self.url("devices"))).await?;
        let listing: DeviceListing = response.json().await.map_err(classify)?;
        debug!(
            "[{}] Listed {} devices",
            self.base_url,
            listing.devices.len()
        );
        Ok(listing.devices)
    }

    async fn device_status(&self, device_id: &str) -> GatewayResult<DeviceStatusBlock> {
        let url = self.url(&format!("devices/{}/status", device_id));
        let response = self.send(self.client.get(url)).await?;
        response.json().await.map_err(classify)
    }

    async fn set_scald_protection_temperature(
        &self,
        device_id: &str,
        temperature_units: i16,
    ) -> GatewayResult<i16> {
        let url = self.url(&format!("devices/{}/scald-protection", device_id));
        let request = self.client.put(url).json(&ScaldProtectionRequest {
            temperature: temperature_units,
        });
        let response: ScaldProtectionResponse =
            self.send(request).await?.json().await.map_err(classify)?;
        Ok(response.setpoint)
    }

    async fn clear_scald_protection(
        &self,
        device_id: &str,
        previous_temperature_units: Option<i16>,
    ) -> GatewayResult<()> {
        let url = self.url(&format!("devices/{}/scald-protection/clear", device_id));
        let request = self.client.post(url).json(&ClearScaldProtectionRequest {
            restore: previous_temperature_units,
        });
        self.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl FeedbackClient for HttpGateway {
    async fn update_user_feedback(
        &self,
        device_id: Option<&str>,
        status: ElmStatus,
        expected_waiting_time_ms: u64,
    ) -> GatewayResult<()> {
        let request = self.client.post(self.url("feedback")).json(&FeedbackRequest {
            device_id,
            status,
            expected_waiting_time_ms,
        });
        self.send(request).await?;
        Ok(())
    }
}
