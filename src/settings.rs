//! Engine tunables, loadable from a TOML file.
//!
//! Every field has a default, so an empty or partial file is valid.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::recovery::DEFAULT_BOARD_ID;
use crate::serial::interface::{BGG_VID, DEFAULT_CLASS_MATCH};
use crate::serial::DeviceFilter;
use crate::transfer::DEFAULT_FILES;

pub const DEFAULT_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/BumbleGum-Guitars/bgg-firmware/main/manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub vendor_id: u16,
    /// Matched against product or manufacturer; empty accepts any.
    pub class_match: String,
    pub discovery_interval_ms: u64,
    pub boot_files: Vec<String>,
    pub recovery_probe: bool,
    pub recovery_board_id: String,
    pub poll_interval_ms: u64,
    pub calibration_sample_ms: u64,
    pub calibration_window_ms: u64,
    pub manifest_url: String,
    pub validation_budget_secs: u64,
    pub validation_recheck_secs: u64,
    pub deferral_hours: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            vendor_id: BGG_VID,
            class_match: DEFAULT_CLASS_MATCH.to_string(),
            discovery_interval_ms: 2000,
            boot_files: DEFAULT_FILES.iter().map(|s| s.to_string()).collect(),
            recovery_probe: true,
            recovery_board_id: DEFAULT_BOARD_ID.to_string(),
            poll_interval_ms: 100,
            calibration_sample_ms: 100,
            calibration_window_ms: 3000,
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            validation_budget_secs: 45,
            validation_recheck_secs: 2,
            deferral_hours: 24,
        }
    }
}

impl EngineSettings {
    /// Load settings from `path`, or defaults if it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::debug!("No settings at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter { vendor_id: self.vendor_id, class_match: self.class_match.clone() }
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn calibration_timing(&self) -> (Duration, Duration) {
        (Duration::from_millis(self.calibration_sample_ms), Duration::from_millis(self.calibration_window_ms))
    }

    pub fn validation_timing(&self) -> (Duration, Duration) {
        (Duration::from_secs(self.validation_budget_secs), Duration::from_secs(self.validation_recheck_secs))
    }

    pub fn deferral_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.deferral_hours)
    }
}
