use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use uuid::Uuid;

use crate::calibration::{PHASE_WINDOW, SAMPLE_INTERVAL};
use crate::cancellation::CancelToken;
use crate::events::{EventSender, UiEvent};
use crate::serial::unified::ParsedEvent;
use crate::serial::{DeviceFilter, SerialDeviceInfo, SerialError};
use crate::transfer::{TransferEvent, TransferQueue, DEFAULT_FILES};
use super::backend::{select_data_ports, DeviceBackend};
use super::recovery::RecoveryProbe;
use super::{ConnectionState, Device, DeviceError, DeviceSession, DeviceStatus, Result};

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);

type ActiveSlot = Option<Arc<DeviceSession>>;

/// What one discovery tick changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    pub connected: Option<Uuid>,
    pub disconnected: Option<Uuid>,
    pub recovery_volumes: Vec<PathBuf>,
}

/// Central device management system
/// Owns the known-device table and the single active session.
#[derive(Clone)]
pub struct DeviceManager {
    backend: Arc<dyn DeviceBackend>,
    filter: DeviceFilter,
    boot_files: Arc<Vec<String>>,
    calibration_timing: (Duration, Duration),
    devices: Arc<RwLock<HashMap<Uuid, Device>>>,
    active: Arc<Mutex<ActiveSlot>>,
    session_tx: Arc<watch::Sender<ActiveSlot>>,
    probe: Option<Arc<std::sync::Mutex<RecoveryProbe>>>,
    events: EventSender,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn DeviceBackend>, filter: DeviceFilter, events: EventSender) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            backend,
            filter,
            boot_files: Arc::new(DEFAULT_FILES.iter().map(|s| s.to_string()).collect()),
            calibration_timing: (SAMPLE_INTERVAL, PHASE_WINDOW),
            devices: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(Mutex::new(None)),
            session_tx: Arc::new(session_tx),
            probe: None,
            events,
        }
    }

    pub fn with_boot_files(mut self, files: Vec<String>) -> Self {
        self.boot_files = Arc::new(files);
        self
    }

    /// Sample interval and per-phase window for every session's calibrator.
    pub fn with_calibration_timing(mut self, sample_interval: Duration, window: Duration) -> Self {
        self.calibration_timing = (sample_interval, window);
        self
    }

    pub fn with_recovery_probe(mut self, probe: RecoveryProbe) -> Self {
        self.probe = Some(Arc::new(std::sync::Mutex::new(probe)));
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Follows the active session; `None` between sessions.
    pub fn session_watch(&self) -> watch::Receiver<ActiveSlot> {
        self.session_tx.subscribe()
    }

    pub async fn active_session(&self) -> Option<Arc<DeviceSession>> {
        self.active.lock().await.clone()
    }

    /// Get all known devices
    pub async fn get_devices(&self) -> Vec<Device> {
        let devices_guard = self.devices.read().await;
        devices_guard.values().cloned().collect()
    }

    /// Get a specific device by ID
    pub async fn get_device(&self, device_id: &Uuid) -> Option<Device> {
        let devices_guard = self.devices.read().await;
        devices_guard.get(device_id).cloned()
    }

    /// One discovery pass. Re-running it with nothing changed is a no-op.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let ports = select_data_ports(self.backend.available_devices(&self.filter)?);
        self.record_ports(&ports).await;

        let mut outcome = TickOutcome::default();
        let mut slot = self.active.lock().await;

        if let Some(session) = slot.clone() {
            let present = ports.iter().any(|p| p.port_name == session.info.port_name);
            if present && !session.is_closed() {
                drop(slot);
                outcome.recovery_volumes = self.probe_recovery();
                return Ok(outcome);
            }
            let reason = if session.is_closed() { "transport lost" } else { "device removed" };
            outcome.disconnected = self.teardown_locked(&mut slot, reason).await;
        }

        if slot.is_none() {
            if let Some(info) = ports.first() {
                match self.connect_locked(&mut slot, info).await {
                    Ok(id) => outcome.connected = Some(id),
                    Err(e) => log::warn!("Could not open {}: {}", info.port_name, e),
                }
            }
        }
        drop(slot);

        outcome.recovery_volumes = self.probe_recovery();
        Ok(outcome)
    }

    /// Tick every `interval` until `shutdown` fires, then close the session.
    pub async fn run_discovery(&self, interval: Duration, shutdown: CancelToken) {
        log::info!("Device discovery running every {:?}", interval);
        loop {
            if let Err(e) = self.tick().await {
                log::warn!("Discovery tick failed: {}", e);
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        let mut slot = self.active.lock().await;
        self.teardown_locked(&mut slot, "shutting down").await;
        log::info!("Device discovery stopped");
    }

    /// Connect to a known device by ID
    pub async fn connect_device(&self, device_id: &Uuid) -> Result<()> {
        let mut slot = self.active.lock().await;
        if slot.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }
        let info = self
            .get_device(device_id)
            .await
            .map(|d| d.serial_info())
            .ok_or(DeviceError::NotFound)?;
        self.connect_locked(&mut slot, &info).await.map(|_| ())
    }

    /// Disconnect from the currently connected device
    pub async fn disconnect_device(&self, device_id: &Uuid) -> Result<()> {
        let mut slot = self.active.lock().await;
        match slot.as_ref() {
            Some(session) if session.id == *device_id => {
                self.teardown_locked(&mut slot, "disconnected by user").await;
                Ok(())
            }
            _ => Err(DeviceError::NotConnected),
        }
    }

    /// Tear down `session` if it is still the active one.
    pub async fn teardown_session(&self, session: &Arc<DeviceSession>, reason: &str) {
        let mut slot = self.active.lock().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            self.teardown_locked(&mut slot, reason).await;
        } else {
            session.close().await;
        }
    }

    /// Clean up devices that are no longer present (separate from discovery)
    pub async fn cleanup_disconnected_devices(&self) -> Result<Vec<Uuid>> {
        let ports = self.backend.available_devices(&self.filter)?;
        let found: HashSet<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();

        let mut devices_guard = self.devices.write().await;
        let stale: Vec<Uuid> = devices_guard
            .values()
            .filter(|d| !found.contains(d.port_name.as_str()))
            .filter(|d| matches!(d.connection_state, ConnectionState::Disconnected | ConnectionState::Error(_)))
            .map(|d| d.id)
            .collect();
        for id in &stale {
            devices_guard.remove(id);
            log::info!("Removed disconnected device: {}", id);
        }
        Ok(stale)
    }

    async fn record_ports(&self, ports: &[SerialDeviceInfo]) {
        let mut devices_guard = self.devices.write().await;
        for info in ports {
            match devices_guard.values_mut().find(|d| d.port_name == info.port_name) {
                Some(existing) => existing.refresh(info),
                None => {
                    let device = Device::from_serial_info(info);
                    log::info!("Discovered {} on {}", info.product.as_deref().unwrap_or("device"), info.port_name);
                    devices_guard.insert(device.id, device);
                }
            }
        }
    }

    async fn device_id_for(&self, info: &SerialDeviceInfo) -> Uuid {
        let mut devices_guard = self.devices.write().await;
        if let Some(d) = devices_guard.values().find(|d| d.port_name == info.port_name) {
            return d.id;
        }
        let device = Device::from_serial_info(info);
        let id = device.id;
        devices_guard.insert(id, device);
        id
    }

    async fn connect_locked(&self, slot: &mut ActiveSlot, info: &SerialDeviceInfo) -> Result<Uuid> {
        let device_id = self.device_id_for(info).await;
        self.update_device_connection_state(&device_id, ConnectionState::Connecting).await;
        log::info!("Attempting to connect to port: {}", info.port_name);

        let interface = match self.backend.open(info) {
            Ok(interface) => interface,
            Err(e) => {
                let error_msg = format!("Connection failed: {}", e);
                log::error!("{}", error_msg);
                self.update_device_connection_state(&device_id, ConnectionState::Error(error_msg)).await;
                return Err(DeviceError::SerialError(e));
            }
        };

        let session = DeviceSession::start_with_timing(device_id, info.clone(), interface, self.calibration_timing);
        // Subscribe before anything can fail on the wire.
        let transport_events = session.handle().subscribe_events();
        *slot = Some(session.clone());
        self.update_device_connection_state(&device_id, ConnectionState::Connected).await;
        self.session_tx.send_replace(Some(session.clone()));
        let _ = self.events.send(UiEvent::DeviceConnected { device_id, port_name: info.port_name.clone() });

        tokio::spawn(watch_transport(self.clone(), session.clone(), transport_events));
        tokio::spawn(boot_sequence(self.clone(), session));

        log::info!("Successfully connected to device: {}", info.port_name);
        Ok(device_id)
    }

    async fn teardown_locked(&self, slot: &mut ActiveSlot, reason: &str) -> Option<Uuid> {
        let session = slot.take()?;
        session.close().await;
        self.update_device_connection_state(&session.id, ConnectionState::Disconnected).await;
        self.session_tx.send_replace(None);
        let _ = self.events.send(UiEvent::DeviceDisconnected { device_id: session.id, reason: reason.to_string() });
        log::info!("Device {} on {} disconnected: {}", session.id, session.info.port_name, reason);
        Some(session.id)
    }

    fn probe_recovery(&self) -> Vec<PathBuf> {
        let Some(probe) = &self.probe else { return Vec::new() };
        let Ok(mut probe) = probe.lock() else { return Vec::new() };
        let found = probe.scan();
        for volume in &found {
            let _ = self.events.send(UiEvent::RecoveryModeDetected {
                volume: volume.clone(),
                board_id: probe.board_id().to_string(),
            });
        }
        found
    }

    /// Helper method to update device connection state
    async fn update_device_connection_state(&self, device_id: &Uuid, state: ConnectionState) {
        let mut devices_guard = self.devices.write().await;
        if let Some(device) = devices_guard.get_mut(device_id) {
            device.update_connection_state(state);
        }
    }

    /// Helper method to update device status
    async fn update_device_status(&self, device_id: &Uuid, status: DeviceStatus) {
        let mut devices_guard = self.devices.write().await;
        if let Some(device) = devices_guard.get_mut(device_id) {
            device.update_device_status(status);
        }
    }
}

/// Tear the session down as soon as its reader reports the transport gone.
async fn watch_transport(
    manager: DeviceManager,
    session: Arc<DeviceSession>,
    mut events: broadcast::Receiver<ParsedEvent>,
) {
    loop {
        tokio::select! {
            _ = session.token().cancelled() => return,
            evt = events.recv() => match evt {
                Ok(ParsedEvent::TransportLost { reason }) => {
                    manager.teardown_session(&session, &format!("transport lost: {}", reason)).await;
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Boot files, then name, uid and firmware version, all under the session token.
async fn boot_sequence(manager: DeviceManager, session: Arc<DeviceSession>) {
    let mut queue = TransferQueue::new(session.protocol().clone(), session.token().clone());
    queue.seed(manager.boot_files.iter().cloned());

    let events = manager.events.clone();
    let mut device_name = None;
    let loaded = queue
        .load_all(|evt| {
            if let TransferEvent::AllLoaded { device_name: name } = &evt {
                device_name = name.clone();
            }
            let _ = events.send(evt.into());
        })
        .await;
    if let Err(e) = loaded {
        log::info!("Boot transfer for {} stopped: {}", session.id, e);
        return;
    }
    session.set_device_name(device_name.clone());

    let uid = match session.uid().await {
        Ok(uid) => Some(uid),
        Err(e) if is_session_fatal(&e) => return,
        Err(e) => {
            log::warn!("Could not read uid: {}", e);
            None
        }
    };
    let firmware_version = match session.firmware_version().await {
        Ok(v) => Some(v),
        Err(e) if is_session_fatal(&e) => return,
        Err(e) => {
            log::warn!("Firmware version unknown: {}", e);
            None
        }
    };

    let status = DeviceStatus { uid: uid.clone(), firmware_version: firmware_version.clone(), device_name: device_name.clone() };
    manager.update_device_status(&session.id, status).await;
    let _ = manager.events.send(UiEvent::DeviceInfoRead { device_id: session.id, uid, firmware_version, device_name });
}

fn is_session_fatal(e: &SerialError) -> bool {
    e.is_transport_lost() || matches!(e, SerialError::Cancelled)
}
