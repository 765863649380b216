use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::serial::SerialError;

/// Remote description of the newest firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub firmware_version: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileRef>,
    #[serde(default)]
    pub release_notes: String,
}

/// Where a manifest file lives. Bare strings may be relative to the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileRef {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        sha256: Option<String>,
    },
}

impl FileRef {
    pub fn url(&self) -> &str {
        match self {
            FileRef::Url(url) => url,
            FileRef::Detailed { url, .. } => url,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        match self {
            FileRef::Url(_) => None,
            FileRef::Detailed { sha256, .. } => sha256.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePhase {
    Idle,
    Checking,
    UpdateAvailable,
    Preparing,
    Downloading,
    Installing,
    Rebooting,
    Validating,
    Succeeded,
    Mismatched,
    TimedOut,
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdatePhase::Succeeded | UpdatePhase::Mismatched | UpdatePhase::TimedOut | UpdatePhase::Failed)
    }
}

/// Snapshot pushed to the UI on every phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub phase: UpdatePhase,
    pub expected_version: Option<String>,
    pub reported_version: Option<String>,
    pub message: Option<String>,
    /// 0..=100 within the current phase, when it is measurable.
    pub progress: Option<f64>,
}

impl UpdateStatus {
    pub fn new(phase: UpdatePhase) -> Self {
        Self { phase, expected_version: None, reported_version: None, message: None, progress: None }
    }

    pub fn expecting(mut self, version: &str) -> Self {
        self.expected_version = Some(version.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Outcome of `check_for_update`. A deferred device is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateCheck {
    UpToDate { device_version: String, latest_version: String },
    Available { device_version: String, manifest: Manifest },
    Suppressed { until: chrono::DateTime<chrono::Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub file: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Update manifest unavailable: {0}")]
    ManifestUnavailable(String),

    #[error("Firmware version could not be determined: {0}")]
    VersionUnknown(String),

    #[error("No device connected")]
    NoDevice,

    #[error("An update is already running")]
    Busy,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{file} failed verification: expected sha256 {expected}, got {computed}")]
    Integrity { file: String, expected: String, computed: String },

    #[error("{file} cannot be sent over the serial link: {reason}")]
    UnsupportedFile { file: String, reason: String },

    #[error("Device name could not be preserved: {0}")]
    NamePreservation(String),

    #[error("Deployment failed: {0}")]
    Deploy(#[from] SerialError),

    #[error("Device came back with version {reported}, expected {expected}")]
    ValidationMismatch { expected: String, reported: String },

    #[error("Device did not come back with a readable version within {0} s")]
    ValidationTimedOut(u64),

    #[error("Update cancelled")]
    Cancelled,
}

impl UpdateError {
    /// The phase a run ends in when it fails with this error.
    pub fn terminal_phase(&self) -> UpdatePhase {
        match self {
            UpdateError::ValidationMismatch { .. } => UpdatePhase::Mismatched,
            UpdateError::ValidationTimedOut(_) => UpdatePhase::TimedOut,
            _ => UpdatePhase::Failed,
        }
    }
}

pub type UpdateResult<T> = Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_accepts_plain_and_detailed_refs() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "firmware_version": "2.3",
                "files": {
                    "code.py": "code.py",
                    "boot.py": {"url": "https://example.com/fw/boot.py", "sha256": "ab12"}
                },
                "release_notes": "Tilt fixes"
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.files["code.py"], FileRef::Url("code.py".into()));
        assert_eq!(manifest.files["boot.py"].url(), "https://example.com/fw/boot.py");
        assert_eq!(manifest.files["boot.py"].sha256(), Some("ab12"));
    }

    #[test]
    fn validation_failures_map_to_distinct_phases() {
        let mismatch = UpdateError::ValidationMismatch { expected: "2.3".into(), reported: "2.2".into() };
        assert_eq!(mismatch.terminal_phase(), UpdatePhase::Mismatched);
        assert_eq!(UpdateError::ValidationTimedOut(45).terminal_phase(), UpdatePhase::TimedOut);
        assert_eq!(UpdateError::Cancelled.terminal_phase(), UpdatePhase::Failed);
        assert!(UpdatePhase::TimedOut.is_terminal());
        assert!(!UpdatePhase::Validating.is_terminal());
    }
}
