//! Live diagnostics: periodic polls and the reply classifier that routes
//! their answers.
pub mod types;
pub mod parser;
pub mod poller;

pub use types::*;
pub use parser::{classify_reply, is_poll_reply};
pub use poller::LivePoller;

use std::time::Duration;

// Default cadences used by the diagnostics screen
pub const PIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const AXIS_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const JOYSTICK_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEVICE_NAME_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
