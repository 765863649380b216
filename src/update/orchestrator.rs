//! Check, download, deploy and validate a firmware update.
//!
//! Each run walks `Preparing → Downloading → Installing → Rebooting →
//! Validating` and ends in exactly one of `Succeeded`, `Mismatched`,
//! `TimedOut` or `Failed`. Every transition goes out as `UpdateStateChanged`.
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep_until, timeout_at, Duration, Instant};

use super::deferral::DeferralStore;
use super::deploy::{Deployer, SerialDeployer};
use super::models::*;
use super::service::ManifestSource;
use super::version::{is_newer_version, versions_match};
use crate::cancellation::CancelToken;
use crate::device::{DeviceManager, DeviceSession};
use crate::events::{EventSender, UiEvent};
use crate::serial::protocol::{splice_boot_product, BOOT_FILE};

pub const VALIDATION_BUDGET: Duration = Duration::from_secs(45);
pub const VALIDATION_RECHECK: Duration = Duration::from_secs(2);

/// Whatever currently owns the active device session.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_session(&self) -> Option<Arc<DeviceSession>>;
}

#[async_trait]
impl SessionProvider for DeviceManager {
    async fn current_session(&self) -> Option<Arc<DeviceSession>> {
        self.active_session().await
    }
}

pub struct UpdateOrchestrator {
    source: Arc<dyn ManifestSource>,
    sessions: Arc<dyn SessionProvider>,
    events: EventSender,
    deployer: Option<Arc<dyn Deployer>>,
    deferrals: Mutex<DeferralStore>,
    manifest: Mutex<Option<Manifest>>,
    running: AtomicBool,
    attempt: Mutex<Option<CancelToken>>,
    validation_budget: Duration,
    recheck_interval: Duration,
}

/// Clears the running flag however the run ends.
struct RunGuard<'a>(&'a UpdateOrchestrator);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut attempt) = self.0.attempt.lock() {
            *attempt = None;
        }
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl UpdateOrchestrator {
    pub fn new(source: Arc<dyn ManifestSource>, sessions: Arc<dyn SessionProvider>, events: EventSender) -> Self {
        Self {
            source,
            sessions,
            events,
            deployer: None,
            deferrals: Mutex::new(DeferralStore::default()),
            manifest: Mutex::new(None),
            running: AtomicBool::new(false),
            attempt: Mutex::new(None),
            validation_budget: VALIDATION_BUDGET,
            recheck_interval: VALIDATION_RECHECK,
        }
    }

    /// Deploy through `deployer` instead of the session's serial link.
    pub fn with_deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn with_deferrals(mut self, deferrals: DeferralStore) -> Self {
        self.deferrals = Mutex::new(deferrals);
        self
    }

    pub fn with_validation_timing(mut self, budget: Duration, recheck: Duration) -> Self {
        self.validation_budget = budget;
        self.recheck_interval = recheck;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Manifest from the last successful check.
    pub fn cached_manifest(&self) -> Option<Manifest> {
        self.manifest.lock().ok().and_then(|m| m.clone())
    }

    /// Abort the running update, if any.
    pub fn cancel(&self) {
        if let Ok(attempt) = self.attempt.lock() {
            if let Some(token) = attempt.as_ref() {
                token.cancel();
            }
        }
    }

    fn emit(&self, status: UpdateStatus) {
        log::debug!("Update phase: {:?}", status.phase);
        let _ = self.events.send(UiEvent::UpdateStateChanged(status));
    }

    /// Compare the newest manifest against the connected device. A device that
    /// was deferred in the last 24 h is `Suppressed` unless `manual`.
    pub async fn check_for_update(&self, manual: bool) -> UpdateResult<UpdateCheck> {
        let session = self.sessions.current_session().await.ok_or(UpdateError::NoDevice)?;

        if !manual {
            if let Ok(uid) = session.uid().await {
                let until = self.deferrals.lock().ok().and_then(|d| d.suppressed_until(&uid, chrono::Utc::now()));
                if let Some(until) = until {
                    log::info!("Update check for {} suppressed until {}", uid, until);
                    return Ok(UpdateCheck::Suppressed { until });
                }
            }
        }

        self.emit(UpdateStatus::new(UpdatePhase::Checking));
        match self.compare(&session).await {
            Ok(check) => {
                match &check {
                    UpdateCheck::Available { manifest, .. } => self.emit(
                        UpdateStatus::new(UpdatePhase::UpdateAvailable)
                            .expecting(&manifest.firmware_version)
                            .with_message(manifest.release_notes.clone()),
                    ),
                    UpdateCheck::UpToDate { device_version, .. } => self.emit(
                        UpdateStatus::new(UpdatePhase::Idle).with_message(format!("Firmware {} is up to date", device_version)),
                    ),
                    UpdateCheck::Suppressed { .. } => {}
                }
                Ok(check)
            }
            Err(e) => {
                self.emit(UpdateStatus::new(UpdatePhase::Failed).with_message(e.to_string()));
                Err(e)
            }
        }
    }

    async fn compare(&self, session: &DeviceSession) -> UpdateResult<UpdateCheck> {
        let manifest = self.source.fetch_manifest().await?;
        if let Ok(mut cached) = self.manifest.lock() {
            *cached = Some(manifest.clone());
        }

        let device_version = session.firmware_version().await.map_err(|e| UpdateError::VersionUnknown(e.to_string()))?;
        log::info!(
            "Version check - device: {}, latest: {}",
            device_version,
            manifest.firmware_version
        );

        if is_newer_version(&manifest.firmware_version, &device_version) {
            Ok(UpdateCheck::Available { device_version, manifest })
        } else {
            Ok(UpdateCheck::UpToDate { device_version, latest_version: manifest.firmware_version })
        }
    }

    /// "Later": stop prompting for the connected device for a day.
    pub async fn defer_update(&self) -> UpdateResult<chrono::DateTime<chrono::Utc>> {
        let session = self.sessions.current_session().await.ok_or(UpdateError::NoDevice)?;
        let uid = session.uid().await.map_err(|e| UpdateError::VersionUnknown(format!("no uid: {}", e)))?;
        Ok(self.defer_device(&uid))
    }

    pub fn defer_device(&self, uid: &str) -> chrono::DateTime<chrono::Utc> {
        let now = chrono::Utc::now();
        match self.deferrals.lock() {
            Ok(mut deferrals) => deferrals.defer(uid, now),
            Err(_) => now,
        }
    }

    /// Install `manifest` on the connected device and confirm the version it
    /// reports after rebooting. Returns that version.
    pub async fn run_update(&self, manifest: &Manifest) -> UpdateResult<String> {
        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(UpdateError::Busy);
        }
        let attempt = CancelToken::new();
        if let Ok(mut slot) = self.attempt.lock() {
            *slot = Some(attempt.clone());
        }
        let _guard = RunGuard(self);

        let expected = manifest.firmware_version.as_str();
        log::info!("Starting firmware update to {}", expected);
        match self.run_phases(manifest, &attempt).await {
            Ok(reported) => {
                log::info!("Firmware update validated: device reports {}", reported);
                let mut status = UpdateStatus::new(UpdatePhase::Succeeded).expecting(expected);
                status.reported_version = Some(reported.clone());
                self.emit(status);
                Ok(reported)
            }
            Err(e) => {
                log::warn!("Firmware update to {} ended: {}", expected, e);
                let mut status = UpdateStatus::new(e.terminal_phase()).expecting(expected).with_message(e.to_string());
                if let UpdateError::ValidationMismatch { reported, .. } = &e {
                    status.reported_version = Some(reported.clone());
                }
                self.emit(status);
                Err(e)
            }
        }
    }

    async fn run_phases(&self, manifest: &Manifest, attempt: &CancelToken) -> UpdateResult<String> {
        let expected = manifest.firmware_version.as_str();
        let session = self.sessions.current_session().await.ok_or(UpdateError::NoDevice)?;

        self.emit(UpdateStatus::new(UpdatePhase::Preparing).expecting(expected));
        let device_name = if manifest.files.contains_key(BOOT_FILE) {
            let name = guarded(attempt, session.protocol().lookup_device_name())
                .await?
                .or_else(|e| session.cache().device_name.ok_or(e))
                .map_err(|e| UpdateError::NamePreservation(e.to_string()))?;
            log::info!("Preserving device name {:?}", name);
            Some(name)
        } else {
            None
        };

        self.emit(UpdateStatus::new(UpdatePhase::Downloading).expecting(expected).with_progress(0.0));
        let files = self.download(manifest, device_name.as_deref(), attempt).await?;

        self.emit(UpdateStatus::new(UpdatePhase::Installing).expecting(expected).with_progress(0.0));
        let deployer: Arc<dyn Deployer> = match &self.deployer {
            Some(d) => d.clone(),
            None => Arc::new(SerialDeployer::new(session.protocol().clone())),
        };
        let events = self.events.clone();
        let expected_owned = expected.to_string();
        let on_written = move |done: usize, total: usize| {
            let pct = done as f64 / total.max(1) as f64 * 100.0;
            let status = UpdateStatus::new(UpdatePhase::Installing).expecting(&expected_owned).with_progress(pct);
            let _ = events.send(UiEvent::UpdateStateChanged(status));
        };
        guarded(attempt, deployer.deploy(&files, &on_written)).await??;

        self.emit(UpdateStatus::new(UpdatePhase::Rebooting).expecting(expected));
        self.emit(UpdateStatus::new(UpdatePhase::Validating).expecting(expected));
        self.validate(&session, expected, attempt).await
    }

    async fn download(
        &self,
        manifest: &Manifest,
        device_name: Option<&str>,
        attempt: &CancelToken,
    ) -> UpdateResult<Vec<(String, String)>> {
        let total = manifest.files.len().max(1) as f64;
        let mut files = Vec::with_capacity(manifest.files.len());

        for (i, (name, file)) in manifest.files.iter().enumerate() {
            let events = self.events.clone();
            let expected = manifest.firmware_version.clone();
            let on_chunk = move |p: DownloadProgress| {
                let pct = (i as f64 + p.percentage / 100.0) / total * 100.0;
                let status = UpdateStatus::new(UpdatePhase::Downloading).expecting(&expected).with_progress(pct);
                let _ = events.send(UiEvent::UpdateStateChanged(status));
            };
            let bytes = guarded(attempt, self.source.fetch_file(name, file, &on_chunk)).await??;
            let mut text = String::from_utf8(bytes)
                .map_err(|e| UpdateError::UnsupportedFile { file: name.clone(), reason: e.to_string() })?;

            if name == BOOT_FILE {
                if let Some(device_name) = device_name {
                    text = splice_boot_product(&text, device_name).ok_or_else(|| {
                        UpdateError::NamePreservation(format!("downloaded {} has no product= line", BOOT_FILE))
                    })?;
                }
            }
            files.push((name.clone(), text));
        }
        Ok(files)
    }

    /// Wait for a session other than `previous` and compare its version.
    async fn validate(&self, previous: &Arc<DeviceSession>, expected: &str, attempt: &CancelToken) -> UpdateResult<String> {
        previous.clear_version_cache();
        let deadline = Instant::now() + self.validation_budget;
        let timed_out = || UpdateError::ValidationTimedOut(self.validation_budget.as_secs());

        loop {
            if let Some(session) = self.sessions.current_session().await {
                if !Arc::ptr_eq(&session, previous) && !session.is_closed() {
                    match timeout_at(deadline, guarded(attempt, session.firmware_version())).await {
                        Err(_) => return Err(timed_out()),
                        Ok(Err(e)) => return Err(e),
                        Ok(Ok(Ok(reported))) => {
                            return if versions_match(expected, &reported) {
                                Ok(reported)
                            } else {
                                Err(UpdateError::ValidationMismatch { expected: expected.to_string(), reported })
                            };
                        }
                        Ok(Ok(Err(e))) => log::debug!("Version read after reboot failed: {}", e),
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            tokio::select! {
                _ = attempt.cancelled() => return Err(UpdateError::Cancelled),
                _ = sleep_until((now + self.recheck_interval).min(deadline)) => {}
            }
        }
    }
}

async fn guarded<F: Future>(attempt: &CancelToken, fut: F) -> UpdateResult<F::Output> {
    attempt.run_until_cancelled(fut).await.ok_or(UpdateError::Cancelled)
}
