//! Boot-time file loading.
pub mod queue;

pub use queue::TransferQueue;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONFIG_FILE: &str = "config";
pub const FACTORY_CONFIG_FILE: &str = "factory_config";
pub const PRESETS_FILE: &str = "presets";
pub const USER_PRESETS_FILE: &str = "user_presets";

/// Files read on every connection, in this order.
pub const DEFAULT_FILES: [&str; 3] = [CONFIG_FILE, PRESETS_FILE, USER_PRESETS_FILE];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferEvent {
    Loaded { name: String, contents: Value },
    Failed { name: String, reason: String },
    /// `config` was unreadable and the factory copy stands in for it.
    Restored { name: String, contents: Value },
    AllLoaded { device_name: Option<String> },
}
