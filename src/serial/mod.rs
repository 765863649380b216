pub mod interface;
pub mod protocol;
pub mod frame;
pub mod loopback;
pub mod unified;

pub use interface::{SerialInterface, SerialPortIO, DeviceFilter};
pub use protocol::DeviceProtocol;
pub use frame::{FrameAccumulator, LineBuffer, extract_json_span, parse_json_payload};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Response parse failure: {0}")]
    ParseFailure(String),

    #[error("Request tag '{0}' already has a pending request")]
    TagBusy(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// True for failures that mean the session itself is gone.
    pub fn is_transport_lost(&self) -> bool {
        matches!(self, SerialError::TransportLost(_))
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
