use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::calibration::{AutoCalibrator, PHASE_WINDOW, SAMPLE_INTERVAL};
use crate::cancellation::CancelToken;
use crate::live::LivePoller;
use crate::serial::unified::{UnifiedSerialBuilder, UnifiedSerialHandle};
use crate::serial::{DeviceProtocol, SerialDeviceInfo, SerialError, SerialInterface};
use crate::update::version::is_placeholder_version;

/// Identity values read from the device, reused until the session ends.
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    pub uid: Option<String>,
    pub firmware_version: Option<String>,
    pub device_name: Option<String>,
}

/// One open connection and everything that hangs off it.
///
/// Pollers, calibration and pending requests all watch the session token;
/// `close()` cancels it, so nothing attached to a dead session outlives it.
pub struct DeviceSession {
    pub id: Uuid,
    pub info: SerialDeviceInfo,
    pub connected_at: DateTime<Utc>,
    handle: UnifiedSerialHandle,
    protocol: DeviceProtocol,
    token: CancelToken,
    poller: Arc<LivePoller>,
    calibrator: Arc<AutoCalibrator>,
    cache: RwLock<SessionCache>,
}

impl DeviceSession {
    /// Spawn the reader task for `interface` and build the session around it.
    pub fn start(id: Uuid, info: SerialDeviceInfo, interface: SerialInterface) -> Arc<Self> {
        Self::start_with_timing(id, info, interface, (SAMPLE_INTERVAL, PHASE_WINDOW))
    }

    /// As `start`, with the calibrator's sample interval and phase window.
    pub fn start_with_timing(
        id: Uuid,
        info: SerialDeviceInfo,
        interface: SerialInterface,
        (sample_interval, window): (Duration, Duration),
    ) -> Arc<Self> {
        let handle = UnifiedSerialBuilder::new(interface).build();
        let token = CancelToken::new();
        let poller = Arc::new(LivePoller::new(handle.clone(), token.clone()));
        let calibrator =
            Arc::new(AutoCalibrator::new(poller.clone(), token.clone()).with_timing(sample_interval, window));
        log::info!("Session {} started on {}", id, info.port_name);
        Arc::new(Self {
            id,
            info,
            connected_at: Utc::now(),
            protocol: DeviceProtocol::new(handle.clone()),
            handle,
            token,
            poller,
            calibrator,
            cache: RwLock::new(SessionCache::default()),
        })
    }

    pub fn handle(&self) -> &UnifiedSerialHandle {
        &self.handle
    }

    pub fn protocol(&self) -> &DeviceProtocol {
        &self.protocol
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn poller(&self) -> &Arc<LivePoller> {
        &self.poller
    }

    pub fn calibrator(&self) -> &Arc<AutoCalibrator> {
        &self.calibrator
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.handle.is_closed()
    }

    /// Cancel everything attached to this session and stop the reader.
    pub async fn close(&self) {
        if !self.token.is_cancelled() {
            log::info!("Closing session {} on {}", self.id, self.info.port_name);
        }
        self.token.cancel();
        self.poller.stop_all().await;
        self.handle.shutdown().await;
    }

    pub fn cache(&self) -> SessionCache {
        self.cache.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn update_cache(&self, f: impl FnOnce(&mut SessionCache)) {
        if let Ok(mut cache) = self.cache.write() {
            f(&mut cache);
        }
    }

    pub fn set_device_name(&self, name: Option<String>) {
        self.update_cache(|c| c.device_name = name);
    }

    pub fn set_firmware_version(&self, version: Option<String>) {
        self.update_cache(|c| c.firmware_version = version);
    }

    pub fn clear_version_cache(&self) {
        self.set_firmware_version(None);
    }

    /// Cached uid, or `READUID` once.
    pub async fn uid(&self) -> Result<String, SerialError> {
        if let Some(uid) = self.cache().uid {
            return Ok(uid);
        }
        let uid = self.token.run_until_cancelled(self.protocol.read_uid()).await.ok_or(SerialError::Cancelled)??;
        self.update_cache(|c| c.uid = Some(uid.clone()));
        Ok(uid)
    }

    /// Firmware version: the cached value unless it is a placeholder, then
    /// `READVERSION`, then the `__version__` line of the handler source.
    pub async fn firmware_version(&self) -> Result<String, SerialError> {
        if let Some(v) = self.cache().firmware_version.filter(|v| !is_placeholder_version(v)) {
            return Ok(v);
        }
        let version = match self.token.run_until_cancelled(self.protocol.read_version()).await {
            None => return Err(SerialError::Cancelled),
            Some(Ok(v)) => v,
            Some(Err(e)) if e.is_transport_lost() => return Err(e),
            Some(Err(e)) => {
                log::debug!("READVERSION failed ({}); falling back to handler source", e);
                self.token
                    .run_until_cancelled(self.protocol.read_version_from_source())
                    .await
                    .ok_or(SerialError::Cancelled)??
            }
        };
        self.set_firmware_version(Some(version.clone()));
        Ok(version)
    }

    /// Cached device name, or a fresh lookup.
    pub async fn device_name(&self) -> Result<String, SerialError> {
        if let Some(name) = self.cache().device_name {
            return Ok(name);
        }
        let name = self
            .token
            .run_until_cancelled(self.protocol.lookup_device_name())
            .await
            .ok_or(SerialError::Cancelled)??;
        self.set_device_name(Some(name.clone()));
        Ok(name)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
