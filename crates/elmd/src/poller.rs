//! Per-gateway polling loop.
//!
//! A [`HomeServerPoller`] owns all network traffic to one gateway: it reads the device
//! listing at a fixed cadence, feeds it into the [`HomeServer`] registry, and executes the
//! updates the scheduler queued in between polls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::feedback::FeedbackRouter;
use crate::gateway::GatewayClient;
use crate::gateway::GatewayError;
use crate::gateway::GatewayResult;
use crate::home_server::HomeServer;
use crate::update::AsyncUpdate;
use crate::update::TemperatureInstruction;

/// Listing rounds per poll while devices still need their detailed status.
const MAX_STATUS_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    /// Recoverable failures tolerated in a row before the poller gives up.
    pub max_consecutive_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_consecutive_failures: 5,
        }
    }
}

/// Why a poller exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    /// A failure that later calls will not fix.
    Failure(GatewayError),
    TooManyFailures(GatewayError),
}

#[derive(Debug)]
enum PollerState {
    PollHomeServer,
    Wait,
    ProcessDeviceUpdates,
    Stop(StopReason),
}

pub struct HomeServerPoller {
    home_server: Arc<HomeServer>,
    gateway: Arc<dyn GatewayClient>,
    feedback: Arc<FeedbackRouter>,
    config: PollerConfig,
    stop_rx: watch::Receiver<bool>,
    consecutive_failures: u32,
    next_poll: Instant,
}

impl HomeServerPoller {
    pub fn new(
        home_server: Arc<HomeServer>,
        gateway: Arc<dyn GatewayClient>,
        feedback: Arc<FeedbackRouter>,
        config: PollerConfig,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            home_server,
            gateway,
            feedback,
            config,
            stop_rx,
            consecutive_failures: 0,
            next_poll: Instant::now(),
        }
    }

    pub fn spawn(self) -> JoinHandle<StopReason> {
        tokio::spawn(self.run())
    }

    /// Drive the poll/wait/execute cycle until stopped or a fatal failure.
    pub async fn run(mut self) -> StopReason {
        info!("[{}] Poller started", self.home_server.uri());
        let mut state = PollerState::PollHomeServer;
        loop {
            state = match state {
                PollerState::PollHomeServer => self.poll().await,
                PollerState::Wait => self.wait().await,
                PollerState::ProcessDeviceUpdates => self.process_device_updates().await,
                PollerState::Stop(reason) => {
                    match &reason {
                        StopReason::Requested => {
                            self.flush_device_updates().await;
                            info!("[{}] Poller stopped", self.home_server.uri())
                        }
                        StopReason::Failure(e) | StopReason::TooManyFailures(e) => {
                            error!("[{}] Poller gave up: {}", self.home_server.uri(), e)
                        }
                    }
                    return reason;
                }
            };
        }
    }

    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn poll(&mut self) -> PollerState {
        self.next_poll = Instant::now() + self.config.poll_interval;

        let mut listing = match self.gateway.list_devices().await {
            Ok(listing) => listing,
            Err(e) => return self.on_failure(e),
        };

        for _ in 0..MAX_STATUS_ROUNDS {
            if self.stopped() {
                return PollerState::Stop(StopReason::Requested);
            }

            let required = match self
                .home_server
                .update_device_controllers(&listing, Instant::now())
            {
                Ok(required) => required,
                Err(e) => {
                    // The id is skipped from now on; apply the rest of the listing.
                    warn!("[{}] {}", self.home_server.uri(), e);
                    continue;
                }
            };

            if required.is_empty() {
                self.consecutive_failures = 0;
                return PollerState::ProcessDeviceUpdates;
            }

            debug!(
                "[{}] Fetching detailed status of {:?}",
                self.home_server.uri(),
                required
            );
            for device_id in required {
                let status = match self.gateway.device_status(&device_id).await {
                    Ok(status) => status,
                    Err(e) => return self.on_failure(e),
                };
                if let Some(telemetry) = listing.iter_mut().find(|t| t.id == device_id) {
                    telemetry.replace_status(status);
                }
            }
        }

        warn!(
            "[{}] Device listing not applied after {} rounds",
            self.home_server.uri(),
            MAX_STATUS_ROUNDS
        );
        PollerState::Wait
    }

    async fn wait(&mut self) -> PollerState {
        if self.stopped() {
            return PollerState::Stop(StopReason::Requested);
        }
        tokio::select! {
            biased;
            changed = self.stop_rx.changed() => match changed {
                Ok(()) if !*self.stop_rx.borrow() => PollerState::Wait,
                _ => PollerState::Stop(StopReason::Requested),
            },
            _ = self.home_server.updates_pending() => PollerState::ProcessDeviceUpdates,
            _ = tokio::time::sleep_until(self.next_poll) => PollerState::PollHomeServer,
        }
    }

    async fn process_device_updates(&mut self) -> PollerState {
        let updates = self.home_server.take_device_updates();
        if !updates.is_empty() {
            debug!(
                "[{}] Executing {} device updates",
                self.home_server.uri(),
                updates.len()
            );
        }

        let mut updates = updates.into_iter();
        while let Some(update) = updates.next() {
            if self.stopped() {
                // Left for the final flush.
                self.home_server
                    .put_device_updates(std::iter::once(update).chain(updates));
                return PollerState::Stop(StopReason::Requested);
            }
            match self.execute(&update).await {
                Ok(()) => self.consecutive_failures = 0,
                Err(e) => {
                    let next = self.on_failure(e);
                    if !matches!(next, PollerState::Stop(_)) {
                        // Retried in order after the next poll.
                        self.home_server
                            .requeue_device_updates(std::iter::once(update).chain(updates));
                    }
                    return next;
                }
            }
        }

        PollerState::Wait
    }

    /// Last-chance delivery on a requested stop, so the fail-safe grants reach the heaters.
    async fn flush_device_updates(&self) {
        for update in self.home_server.take_device_updates() {
            if let Err(e) = self.execute(&update).await {
                warn!(
                    "[{}] Dropping update for {}: {}",
                    self.home_server.uri(),
                    update.device_id.as_deref().unwrap_or("all devices"),
                    e
                );
            }
        }
    }

    async fn execute(&self, update: &AsyncUpdate) -> GatewayResult<()> {
        if let (Some(device_id), Some(temperature)) = (&update.device_id, update.temperature) {
            match temperature {
                TemperatureInstruction::SetScaldProtection(units) => {
                    let applied = self
                        .gateway
                        .set_scald_protection_temperature(device_id, units)
                        .await?;
                    if applied != units {
                        debug!(
                            "[{}] {} applied scald protection {} instead of {}",
                            self.home_server.uri(),
                            device_id,
                            applied,
                            units
                        );
                    }
                }
                TemperatureInstruction::ClearScaldProtection { restore } => {
                    self.gateway
                        .clear_scald_protection(device_id, restore)
                        .await?;
                }
            }
        }

        if let Some(feedback) = update.feedback {
            self.feedback
                .dispatch(update.device_id.as_deref(), feedback)
                .await?;
        }

        Ok(())
    }

    fn on_failure(&mut self, e: GatewayError) -> PollerState {
        if !e.kind.may_recover() {
            return PollerState::Stop(StopReason::Failure(e));
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures > self.config.max_consecutive_failures {
            return PollerState::Stop(StopReason::TooManyFailures(e));
        }

        warn!(
            "[{}] Gateway call failed ({}/{}): {}",
            self.home_server.uri(),
            self.consecutive_failures,
            self.config.max_consecutive_failures,
            e
        );
        PollerState::Wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockCall;
    use crate::gateway::mock::MockGateway;
    use crate::gateway::FailureKind;
    use crate::telemetry::DeviceInfo;
    use crate::telemetry::DeviceStatusBlock;
    use crate::telemetry::DeviceTelemetry;
    use crate::update::ElmStatus;

    struct Harness {
        home_server: Arc<HomeServer>,
        gateway: Arc<MockGateway>,
        stop_tx: watch::Sender<bool>,
        poller: HomeServerPoller,
    }

    fn harness(poll_interval: Duration) -> Harness {
        let home_server = Arc::new(HomeServer::new(
            "http://hs1",
            "secret",
            None,
            Duration::from_secs(5),
        ));
        let gateway = Arc::new(MockGateway::new());
        let feedback = Arc::new(FeedbackRouter::new(gateway.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = HomeServerPoller::new(
            home_server.clone(),
            gateway.clone(),
            feedback,
            PollerConfig {
                poll_interval,
                max_consecutive_failures: 5,
            },
            stop_rx,
        );
        Harness {
            home_server,
            gateway,
            stop_tx,
            poller,
        }
    }

    fn coarse(id: &str) -> DeviceTelemetry {
        DeviceTelemetry::new(id, true).with_info(DeviceInfo {
            on: false,
            error_code: 0,
        })
    }

    fn recoverable() -> GatewayError {
        GatewayError::new(FailureKind::NetworkTimeout, "no route to host")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_required_status_and_executes_updates() {
        let h = harness(Duration::from_secs(1));
        h.gateway.set_listing(vec![coarse("0127-1")]);
        h.gateway.set_status(
            "0127-1",
            DeviceStatusBlock {
                setpoint_units: 420,
                intake_temp_units: 120,
                power_max_units: 270,
                ..Default::default()
            },
        );

        let handle = h.poller.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.stop_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), StopReason::Requested);

        let calls = h.gateway.calls();
        assert_eq!(
            calls[..3],
            [
                MockCall::ListDevices,
                MockCall::DeviceStatus("0127-1".into()),
                MockCall::ClearScaldProtection("0127-1".into(), None),
            ]
        );
        assert!(h.home_server.device_controller("0127-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_failure_stops() {
        let h = harness(Duration::from_secs(1));
        let failure = GatewayError::new(FailureKind::ApplicationDataError, "bad json");
        h.gateway.fail_next_list(failure.clone());

        assert_eq!(h.poller.run().await, StopReason::Failure(failure));
        assert_eq!(h.gateway.calls(), vec![MockCall::ListDevices]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_failures() {
        let h = harness(Duration::from_secs(1));
        for _ in 0..6 {
            h.gateway.fail_next_list(recoverable());
        }

        assert_eq!(
            h.poller.run().await,
            StopReason::TooManyFailures(recoverable())
        );
        assert_eq!(h.gateway.calls().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let h = harness(Duration::from_secs(1));
        for _ in 0..5 {
            h.gateway.fail_next_list(recoverable());
        }

        let handle = h.poller.spawn();
        tokio::time::sleep(Duration::from_millis(6500)).await;
        for _ in 0..5 {
            h.gateway.fail_next_list(recoverable());
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        h.stop_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), StopReason::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_updates_are_executed_between_polls() {
        let h = harness(Duration::from_secs(60));
        let handle = h.poller.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.home_server.put_device_update(AsyncUpdate::broadcast(ElmStatus::Overload));
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.stop_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), StopReason::Requested);
        assert_eq!(
            h.gateway.calls(),
            vec![
                MockCall::ListDevices,
                MockCall::Feedback(None, ElmStatus::Overload, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_updates_flushed_on_stop() {
        let h = harness(Duration::from_secs(60));
        h.stop_tx.send_replace(true);
        h.home_server.put_device_update(AsyncUpdate::for_device(
            "0127-1",
            Some(TemperatureInstruction::SetScaldProtection(200)),
            None,
        ));

        assert_eq!(h.poller.run().await, StopReason::Requested);
        assert!(h
            .gateway
            .calls()
            .contains(&MockCall::SetScaldProtection("0127-1".into(), 200)));
        assert!(h.home_server.take_device_updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_failure_keeps_polling() {
        let h = harness(Duration::from_secs(60));
        h.gateway.fail_next_command(recoverable());
        h.home_server.put_device_update(AsyncUpdate::for_device(
            "0127-1",
            Some(TemperatureInstruction::SetScaldProtection(300)),
            None,
        ));

        let handle = h.poller.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        h.stop_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), StopReason::Requested);
        assert!(h
            .gateway
            .calls()
            .contains(&MockCall::SetScaldProtection("0127-1".into(), 300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_is_retried_after_next_poll() {
        let h = harness(Duration::from_secs(1));
        let set = MockCall::SetScaldProtection("0127-1".into(), 300);
        let handle = h.poller.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.gateway.fail_next_command(recoverable());
        h.home_server.put_device_update(AsyncUpdate::for_device(
            "0127-1",
            Some(TemperatureInstruction::SetScaldProtection(300)),
            None,
        ));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.gateway.calls().iter().filter(|c| **c == set).count(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            h.gateway.calls(),
            vec![
                MockCall::ListDevices,
                set.clone(),
                MockCall::ListDevices,
                set.clone(),
            ]
        );
        assert!(h.home_server.take_device_updates().is_empty());

        h.stop_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), StopReason::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_between_polls_keep_poll_cadence() {
        let h = harness(Duration::from_secs(1));
        let handle = h.poller.spawn();

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.home_server.put_device_update(AsyncUpdate::broadcast(ElmStatus::Saturation));
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(
            h.gateway.calls(),
            vec![
                MockCall::ListDevices,
                MockCall::Feedback(None, ElmStatus::Saturation, 0),
                MockCall::ListDevices,
            ]
        );

        h.stop_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), StopReason::Requested);
    }
}
