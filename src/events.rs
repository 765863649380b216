//! Results pushed to the UI layer.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::calibration::CalibrationProgress;
use crate::transfer::TransferEvent;
use crate::update::UpdateStatus;

pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum UiEvent {
    DeviceConnected { device_id: Uuid, port_name: String },
    DeviceDisconnected { device_id: Uuid, reason: String },
    /// Identity read once the boot-time files are in.
    DeviceInfoRead {
        device_id: Uuid,
        uid: Option<String>,
        firmware_version: Option<String>,
        device_name: Option<String>,
    },
    ConfigLoaded { name: String, contents: Value },
    FileLoadFailed { name: String, reason: String },
    ConfigRestored { contents: Value },
    AllFilesLoaded { device_name: Option<String> },
    CalibrationProgress(CalibrationProgress),
    UpdateStateChanged(UpdateStatus),
    RecoveryModeDetected { volume: PathBuf, board_id: String },
}

impl From<TransferEvent> for UiEvent {
    fn from(evt: TransferEvent) -> Self {
        match evt {
            TransferEvent::Loaded { name, contents } => UiEvent::ConfigLoaded { name, contents },
            TransferEvent::Failed { name, reason } => UiEvent::FileLoadFailed { name, reason },
            TransferEvent::Restored { contents, .. } => UiEvent::ConfigRestored { contents },
            TransferEvent::AllLoaded { device_name } => UiEvent::AllFilesLoaded { device_name },
        }
    }
}

pub type EventSender = broadcast::Sender<UiEvent>;

pub fn event_channel() -> (EventSender, broadcast::Receiver<UiEvent>) {
    broadcast::channel(EVENT_CAPACITY)
}
