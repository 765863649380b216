//! Intents the UI layer calls into. Errors come back as display strings.
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::calibration::CalibrationResult;
use crate::config::{DeviceConfig, InputId, InputMapping, LedTarget};
use crate::device::recovery::RecoveryProbe;
use crate::device::{Device, DeviceBackend, DeviceManager, DeviceSession};
use crate::events::{event_channel, UiEvent};
use crate::live::{PollChannel, PollKind};
use crate::settings::EngineSettings;
use crate::transfer::CONFIG_FILE;
use crate::update::{DeferralStore, UpdateCheck, UpdateOrchestrator, UpdateService};

/// Everything the intents need, built once at start-up.
pub struct AppState {
    pub settings: EngineSettings,
    pub manager: DeviceManager,
    pub updates: Arc<UpdateOrchestrator>,
}

impl AppState {
    pub fn new(settings: EngineSettings, backend: Arc<dyn DeviceBackend>) -> Self {
        let (events, _) = event_channel();
        let (sample_interval, window) = settings.calibration_timing();
        let mut manager = DeviceManager::new(backend, settings.device_filter(), events.clone())
            .with_boot_files(settings.boot_files.clone())
            .with_calibration_timing(sample_interval, window);
        if settings.recovery_probe {
            manager = manager.with_recovery_probe(RecoveryProbe::new(settings.recovery_board_id.clone()));
        }

        let (budget, recheck) = settings.validation_timing();
        let updates = UpdateOrchestrator::new(
            Arc::new(UpdateService::new(settings.manifest_url.clone())),
            Arc::new(manager.clone()),
            events,
        )
        .with_deferrals(DeferralStore::new(settings.deferral_window()))
        .with_validation_timing(budget, recheck);

        Self { settings, manager, updates: Arc::new(updates) }
    }

    async fn session(&self) -> Result<Arc<DeviceSession>, String> {
        self.manager.active_session().await.ok_or_else(|| "No device connected".to_string())
    }
}

/// Run one discovery pass and list known devices
pub async fn discover_devices(state: &AppState) -> Result<Vec<Device>, String> {
    state
        .manager
        .tick()
        .await
        .map_err(|e| format!("Failed to discover devices: {}", e))?;
    Ok(state.manager.get_devices().await)
}

/// Get all known devices
pub async fn get_devices(state: &AppState) -> Result<Vec<Device>, String> {
    Ok(state.manager.get_devices().await)
}

/// Clean up devices that are no longer present
pub async fn cleanup_disconnected_devices(state: &AppState) -> Result<Vec<String>, String> {
    state
        .manager
        .cleanup_disconnected_devices()
        .await
        .map(|uuids| uuids.into_iter().map(|uuid| uuid.to_string()).collect())
        .map_err(|e| format!("Failed to cleanup disconnected devices: {}", e))
}

/// Connect to a specific device
pub async fn connect_device(state: &AppState, device_id: String) -> Result<(), String> {
    let uuid = Uuid::parse_str(&device_id).map_err(|e| format!("Invalid device ID: {}", e))?;
    state
        .manager
        .connect_device(&uuid)
        .await
        .map_err(|e| format!("Failed to connect to device: {}", e))
}

/// Disconnect from the currently connected device
pub async fn disconnect_device(state: &AppState) -> Result<(), String> {
    let session = state.session().await?;
    state
        .manager
        .disconnect_device(&session.id)
        .await
        .map_err(|e| format!("Failed to disconnect device: {}", e))
}

/// Get the currently connected device
pub async fn get_connected_device(state: &AppState) -> Result<Option<Device>, String> {
    match state.manager.active_session().await {
        Some(session) => Ok(state.manager.get_device(&session.id).await),
        None => Ok(None),
    }
}

pub async fn read_device_file(state: &AppState, name: String) -> Result<Value, String> {
    let session = state.session().await?;
    session
        .protocol()
        .read_json_file(&name)
        .await
        .map_err(|e| format!("Failed to read {}: {}", name, e))
}

/// Validated read of `config.json`.
pub async fn load_device_config(state: &AppState) -> Result<DeviceConfig, String> {
    let value = read_device_file(state, CONFIG_FILE.to_string()).await?;
    DeviceConfig::from_json(&value).map_err(|e| format!("Device config is invalid: {}", e))
}

/// Write a whole config. The controller resets itself afterwards.
pub async fn save_device_config(state: &AppState, config: Value) -> Result<(), String> {
    let config = DeviceConfig::from_json(&config).map_err(|e| format!("Refusing to write config: {}", e))?;
    let session = state.session().await?;
    session
        .protocol()
        .write_json_file(CONFIG_FILE, &config.to_json())
        .await
        .map_err(|e| format!("Failed to write config: {}", e))
}

/// Assign `pin` to the input `key` and have the firmware store it.
pub async fn apply_pin_config(state: &AppState, key: String, pin: String) -> Result<(), String> {
    let input = InputId::from_key(&key).ok_or_else(|| format!("Unknown input: {}", key))?;
    let mapping = InputMapping::new(pin, None).map_err(|e| e.to_string())?;
    let session = state.session().await?;
    session
        .protocol()
        .save_pin(input.key(), &mapping.pin)
        .await
        .map_err(|e| format!("Failed to save pin for {}: {}", key, e))
}

/// Wait for a button press and report its GPIO, or `None` if nothing was pressed.
pub async fn detect_pin(state: &AppState, key: String) -> Result<Option<String>, String> {
    let input = InputId::from_key(&key).ok_or_else(|| format!("Unknown input: {}", key))?;
    let session = state.session().await?;
    session
        .protocol()
        .detect_pin(input.key(), session.token())
        .await
        .map_err(|e| format!("Pin detection failed: {}", e))
}

/// Two-phase whammy calibration. The bounds replace whatever `config.json`
/// held; with `save` they are written to the device straight away.
pub async fn start_calibration(state: &AppState, save: bool) -> Result<CalibrationResult, String> {
    let session = state.session().await?;
    let events = state.manager.events().clone();
    let result = session
        .calibrator()
        .run(|progress| {
            let _ = events.send(UiEvent::CalibrationProgress(progress));
        })
        .await
        .map_err(|e| format!("Calibration failed: {}", e))?;

    if save {
        let mut config = load_device_config(state).await?;
        result.apply_to(&mut config).map_err(|e| e.to_string())?;
        session
            .protocol()
            .write_json_file(CONFIG_FILE, &config.to_json())
            .await
            .map_err(|e| format!("Failed to save calibration: {}", e))?;
    }
    Ok(result)
}

pub async fn cancel_calibration(state: &AppState) -> Result<(), String> {
    state.session().await?.calibrator().cancel();
    Ok(())
}

pub async fn start_live_poll(state: &AppState, kind: PollKind) -> Result<(), String> {
    let session = state.session().await?;
    let interval = match kind {
        PollKind::DeviceNameRefresh => crate::live::DEVICE_NAME_REFRESH_INTERVAL,
        _ => state.settings.poll_interval(),
    };
    session
        .poller()
        .switch_mode(kind, interval)
        .await
        .map_err(|e| format!("Failed to start polling: {}", e))
}

pub async fn stop_live_poll(state: &AppState, channel: PollChannel) -> Result<(), String> {
    let session = state.session().await?;
    session
        .poller()
        .stop_polling(channel)
        .await
        .map_err(|e| format!("Failed to stop polling: {}", e))
}

/// Show `hex_color` on the LED behind a colour-editor name.
pub async fn preview_led(state: &AppState, led_name: String, hex_color: String) -> Result<(), String> {
    LedTarget::from_preview_name(&led_name).ok_or_else(|| format!("Unknown LED: {}", led_name))?;
    let session = state.session().await?;
    session
        .protocol()
        .preview_led(&led_name, &hex_color)
        .await
        .map_err(|e| format!("Failed to preview LED: {}", e))
}

pub async fn restore_leds(state: &AppState) -> Result<(), String> {
    let session = state.session().await?;
    session.protocol().led_restore().await.map_err(|e| format!("Failed to restore LEDs: {}", e))
}

pub async fn set_tilt_wave(state: &AppState, enabled: bool) -> Result<(), String> {
    let session = state.session().await?;
    session
        .protocol()
        .set_tilt_wave(enabled)
        .await
        .map_err(|e| format!("Failed to set tilt wave: {}", e))
}

pub async fn import_user_presets(state: &AppState, presets: Value) -> Result<(), String> {
    if !presets.is_object() {
        return Err("User presets must be a JSON object".to_string());
    }
    let session = state.session().await?;
    session
        .protocol()
        .import_user_presets(&presets)
        .await
        .map_err(|e| format!("Failed to import presets: {}", e))
}

pub async fn reboot_device(state: &AppState, bootloader: bool) -> Result<(), String> {
    let session = state.session().await?;
    let protocol = session.protocol();
    let sent = if bootloader { protocol.reboot_bootsel().await } else { protocol.reboot().await };
    sent.map_err(|e| format!("Failed to reboot device: {}", e))
}

pub async fn check_for_update(state: &AppState, manual: bool) -> Result<UpdateCheck, String> {
    state
        .updates
        .check_for_update(manual)
        .await
        .map_err(|e| format!("Update check failed: {}", e))
}

/// Install the manifest from the last check. Returns the validated version.
pub async fn install_update(state: &AppState) -> Result<String, String> {
    let manifest = state
        .updates
        .cached_manifest()
        .ok_or_else(|| "Check for updates before installing".to_string())?;
    state.updates.run_update(&manifest).await.map_err(|e| e.to_string())
}

/// "Later". Not an error; suppresses automatic prompts for this device.
pub async fn defer_update(state: &AppState) -> Result<String, String> {
    state
        .updates
        .defer_update()
        .await
        .map(|until| until.to_rfc3339())
        .map_err(|e| format!("Failed to defer update: {}", e))
}
