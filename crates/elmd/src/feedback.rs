//! Routing of user feedback to the gateway that owns each device's user interface.
//!
//! In multi-gateway installations the gateway managing a heater's power is not necessarily
//! the one driving its display, so feedback is looked up per device before falling back to
//! the managing gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use tracing::debug;

use crate::gateway::FeedbackClient;
use crate::gateway::GatewayResult;
use crate::update::UserFeedback;

pub struct FeedbackRouter {
    default: Arc<dyn FeedbackClient>,
    routes: RwLock<HashMap<String, Arc<dyn FeedbackClient>>>,
}

impl FeedbackRouter {
    pub fn new(default: Arc<dyn FeedbackClient>) -> Self {
        Self {
            default,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Send feedback for `device_id` through `client` instead of the default.
    pub fn route(&self, device_id: impl Into<String>, client: Arc<dyn FeedbackClient>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.into(), client);
    }

    pub fn unroute(&self, device_id: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id);
    }

    fn client_for(&self, device_id: Option<&str>) -> Arc<dyn FeedbackClient> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        device_id
            .and_then(|id| routes.get(id))
            .unwrap_or(&self.default)
            .clone()
    }

    pub async fn dispatch(
        &self,
        device_id: Option<&str>,
        feedback: UserFeedback,
    ) -> GatewayResult<()> {
        let client = self.client_for(device_id);
        debug!(
            "Feedback for {}: {} (wait {} ms)",
            device_id.unwrap_or("all devices"),
            feedback.status,
            feedback.expected_waiting_time_ms
        );
        client
            .update_user_feedback(
                device_id,
                feedback.status,
                feedback.expected_waiting_time_ms,
            )
            .await
    }
}
