pub mod api;
pub mod config;
pub mod device;
pub mod error;
pub mod feedback;
pub mod gateway;
pub mod home_server;
pub mod model;
pub mod poller;
pub mod scheduler;
pub mod telemetry;
pub mod update;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use device::ApprovedPower;
pub use device::DeviceController;
pub use device::DeviceStatus;
pub use error::ElmError;
pub use feedback::FeedbackRouter;
pub use gateway::FailureKind;
pub use gateway::FeedbackClient;
pub use gateway::GatewayClient;
pub use gateway::GatewayError;
pub use home_server::HomeServer;
pub use poller::HomeServerPoller;
pub use poller::PollerConfig;
pub use poller::StopReason;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerConfig;
pub use scheduler::SchedulerEvent;
pub use update::AsyncUpdate;
pub use update::ElmStatus;
