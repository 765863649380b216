use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::serial::SerialDeviceInfo;

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// What the controller told us about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    pub uid: Option<String>,
    pub firmware_version: Option<String>,
    pub device_name: Option<String>,
}

/// Known device table entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub connection_state: ConnectionState,
    pub device_status: Option<DeviceStatus>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn from_serial_info(info: &SerialDeviceInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            port_name: info.port_name.clone(),
            vid: info.vid,
            pid: info.pid,
            serial_number: info.serial_number.clone(),
            manufacturer: info.manufacturer.clone(),
            product: info.product.clone(),
            connection_state: ConnectionState::Disconnected,
            device_status: None,
            last_seen: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    /// Refresh descriptor fields from a new enumeration, keeping state.
    pub fn refresh(&mut self, info: &SerialDeviceInfo) {
        self.vid = info.vid;
        self.pid = info.pid;
        self.serial_number = info.serial_number.clone();
        self.manufacturer = info.manufacturer.clone();
        self.product = info.product.clone();
        self.last_seen = Utc::now();
    }

    pub fn serial_info(&self) -> SerialDeviceInfo {
        SerialDeviceInfo {
            port_name: self.port_name.clone(),
            vid: self.vid,
            pid: self.pid,
            serial_number: self.serial_number.clone(),
            manufacturer: self.manufacturer.clone(),
            product: self.product.clone(),
        }
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }

    pub fn update_device_status(&mut self, status: DeviceStatus) {
        self.device_status = Some(status);
        self.last_seen = Utc::now();
    }
}
