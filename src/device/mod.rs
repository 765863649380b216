//! Discovery, the active session and everything attached to it.
pub mod backend;
pub mod manager;
pub mod models;
pub mod recovery;
pub mod session;
pub mod simulated;

pub use backend::{DeviceBackend, NativeBackend};
pub use manager::{DeviceManager, TickOutcome};
pub use models::*;
pub use recovery::RecoveryProbe;
pub use session::DeviceSession;
pub use simulated::{SimulatedBackend, SimulatedFirmware};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No such device in the device table")]
    NotFound,

    #[error("A controller is already connected")]
    AlreadyConnected,

    #[error("Device is not the connected controller")]
    NotConnected,

    #[error("Serial error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
