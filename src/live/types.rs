use serde::{Deserialize, Serialize};

/// State reported for one digital input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinState {
    Released,
    Pressed,
    /// Firmware could not read the pin (`PIN:<key>:ERR`), usually an unassigned key.
    Error,
}

/// A poll reply recognised by the reply classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiveEvent {
    Pin { key: String, state: PinState },
    /// Raw whammy ADC reading; `-1` means no axis is fitted.
    Whammy { value: i32 },
    Joystick { x: i32, y: i32 },
    DeviceName { name: String },
}

impl LiveEvent {
    pub fn channel(&self) -> PollChannel {
        match self {
            LiveEvent::Pin { .. } => PollChannel::Pins,
            LiveEvent::Whammy { .. } => PollChannel::AxisValue,
            LiveEvent::Joystick { .. } => PollChannel::Joystick,
            LiveEvent::DeviceName { .. } => PollChannel::DeviceNameRefresh,
        }
    }
}

/// What a poller asks the device for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollKind {
    /// `READPIN:<key>` for every key, written back to back each tick.
    Pins(Vec<String>),
    AxisValue,
    Joystick,
    DeviceNameRefresh,
}

impl PollKind {
    pub fn channel(&self) -> PollChannel {
        match self {
            PollKind::Pins(_) => PollChannel::Pins,
            PollKind::AxisValue => PollChannel::AxisValue,
            PollKind::Joystick => PollChannel::Joystick,
            PollKind::DeviceNameRefresh => PollChannel::DeviceNameRefresh,
        }
    }
}

/// Identity of a poller slot; at most one poller per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollChannel {
    Pins,
    AxisValue,
    Joystick,
    DeviceNameRefresh,
}

impl PollChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollChannel::Pins => "pins",
            PollChannel::AxisValue => "axis-value",
            PollChannel::Joystick => "joystick",
            PollChannel::DeviceNameRefresh => "device-name-refresh",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PollError {
    #[error("{} poller already running", .0.as_str())]
    AlreadyActive(PollChannel),
    #[error("{} poller is not running", .0.as_str())]
    NotActive(PollChannel),
    #[error("device session closed")]
    SessionClosed,
}
