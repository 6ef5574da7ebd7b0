use thiserror::Error;

/// Errors a device can report back to the host.
///
/// Kernel execution itself never fails; the only rejectable inputs are
/// host uploads addressed by name.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown constant area: {0}")]
    UnknownConstant(String),

    #[error("unknown texture: {0}")]
    UnknownTexture(String),
}
