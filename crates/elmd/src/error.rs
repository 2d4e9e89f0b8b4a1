/// Errors raised by the load-management core.
#[derive(Debug, thiserror::Error)]
pub enum ElmError {
    /// The device id encodes a model that cannot be remote controlled, or no known model at all.
    #[error("Unsupported device model for device {device_id} (type code {type_code:#06x})")]
    UnsupportedDeviceModel { device_id: String, type_code: u16 },

    #[error("Invalid device id: {0:?}")]
    InvalidDeviceId(String),
}

pub type Result<T> = std::result::Result<T, ElmError>;
