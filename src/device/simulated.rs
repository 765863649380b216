//! A scripted controller on a loopback link.
//!
//! `SimulatedFirmware` answers the serial protocol the way the guitar's
//! CircuitPython handler does; `SimulatedBackend` hands it to the device
//! manager as if a port had been plugged in. Drives the CLI's `--simulate`
//! mode and the integration tests.
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::DeviceBackend;
use crate::serial::interface::BGG_VID;
use crate::serial::loopback::{loopback_pair, ServedDevice};
use crate::serial::{DeviceFilter, SerialDeviceInfo, SerialError, SerialInterface};

pub const SIMULATED_PORT: &str = "/dev/ttySIM1";
pub const SIMULATED_UID: &str = "E6614103E7452D2F";

enum Mode {
    Idle,
    Writing { name: String, lines: Vec<String> },
    Importing { lines: Vec<String> },
}

/// Device-side state: the flash filesystem plus live input readings.
pub struct SimulatedFirmware {
    files: BTreeMap<String, String>,
    uid: String,
    version_command: Option<String>,
    whammy: Arc<Mutex<i32>>,
    mode: Mode,
}

fn default_config() -> Value {
    json!({
        "GREEN_FRET": "GP10",
        "GREEN_FRET_led": 6,
        "RED_FRET": "GP11",
        "RED_FRET_led": 5,
        "YELLOW_FRET": "GP12",
        "BLUE_FRET": "GP13",
        "ORANGE_FRET": "GP14",
        "STRUM_UP": "GP7",
        "STRUM_DOWN": "GP8",
        "WHAMMY": "GP27",
        "whammy_min": 500,
        "whammy_max": 60000,
        "tilt_wave_enabled": true
    })
}

impl Default for SimulatedFirmware {
    fn default() -> Self {
        Self::new("2.2")
    }
}

impl SimulatedFirmware {
    /// Firmware whose handler source declares `version`. Like the shipping
    /// firmware it has no `READVERSION` command until `with_version_command`.
    pub fn new(version: &str) -> Self {
        let mut files = BTreeMap::new();
        files.insert("config.json".to_string(), default_config().to_string());
        files.insert("factory_config.json".to_string(), default_config().to_string());
        files.insert("presets.json".to_string(), json!({"Default": {"GREEN_FRET": "#00FF00"}}).to_string());
        files.insert("user_presets.json".to_string(), json!({"NewUserPreset1": {}}).to_string());
        files.insert(
            "boot.py".to_string(),
            "import supervisor\nsupervisor.set_usb_identification(\n    manufacturer=\"BumbleGum\",\n    product=\"CH-Guitar\",\n)\n"
                .to_string(),
        );
        files.insert("serial_handler.py".to_string(), format!("# serial_handler.py\n__version__ = \"{}\"\n", version));
        Self {
            files,
            uid: SIMULATED_UID.to_string(),
            version_command: None,
            whammy: Arc::new(Mutex::new(-1)),
            mode: Mode::Idle,
        }
    }

    pub fn with_version_command(mut self, version: &str) -> Self {
        self.version_command = Some(version.to_string());
        self
    }

    pub fn with_file(mut self, name: &str, contents: &str) -> Self {
        self.files.insert(name.to_string(), contents.to_string());
        self
    }

    pub fn without_file(mut self, name: &str) -> Self {
        self.files.remove(name);
        self
    }

    /// Read the whammy from `value`, which the caller can move at will.
    pub fn with_whammy(mut self, value: Arc<Mutex<i32>>) -> Self {
        self.whammy = value;
        self
    }

    /// Shared handle on the whammy reading; `-1` means no whammy fitted.
    pub fn whammy(&self) -> Arc<Mutex<i32>> {
        self.whammy.clone()
    }

    pub fn file(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    /// Replies for one host line.
    pub fn handle(&mut self, line: &str) -> Vec<String> {
        match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Writing { name, mut lines } => {
                if line == "END" {
                    let text = lines.join("\n");
                    let ack = name.ends_with(".json").then(|| format!("File /{} written", name));
                    self.files.insert(name, text + "\n");
                    return ack.into_iter().collect();
                }
                lines.push(line.to_string());
                self.mode = Mode::Writing { name, lines };
                return Vec::new();
            }
            Mode::Importing { mut lines } => {
                if line == "END" {
                    return self.merge_user_presets(&lines.join("\n"));
                }
                lines.push(line.to_string());
                self.mode = Mode::Importing { lines };
                return Vec::new();
            }
            Mode::Idle => {}
        }

        if let Some(name) = line.strip_prefix("READFILE:") {
            return match self.files.get(name) {
                Some(text) => text.lines().map(str::to_string).chain(["END".to_string()]).collect(),
                None => vec![format!("ERROR: Could not read {}", name), "END".to_string()],
            };
        }
        if let Some(name) = line.strip_prefix("WRITEFILE:") {
            self.mode = Mode::Writing { name: name.to_string(), lines: Vec::new() };
            return Vec::new();
        }
        if let Some(key) = line.strip_prefix("READPIN:") {
            return vec![format!("PIN:{}:0", key)];
        }
        if let Some(rest) = line.strip_prefix("SAVEPIN:") {
            return match rest.split_once(':') {
                Some((key, pin)) => vec![format!("PINDETECT:SAVED:{}:{}", key, pin)],
                None => vec!["PINDETECT:ERROR:bad format".to_string()],
            };
        }
        if let Some(key) = line.strip_prefix("DETECTPIN:") {
            return vec!["PINDETECT:START".to_string(), format!("PINDETECT:NONE:{}", key)];
        }
        match line {
            "READUID" => vec![self.uid.clone(), "END".to_string()],
            "READVERSION" => match &self.version_command {
                Some(v) => vec![format!("VERSION:{}", v), "END".to_string()],
                None => vec!["ERROR: Unknown command".to_string()],
            },
            "READWHAMMY" => {
                let value = self.whammy.lock().map(|v| *v).unwrap_or(-1);
                vec![format!("WHAMMY:{}", value)]
            }
            "READJOYSTICK" => vec!["JOYSTICK:X:-1:Y:-1".to_string()],
            "IMPORTUSER" => {
                self.mode = Mode::Importing { lines: Vec::new() };
                Vec::new()
            }
            "LEDRESTORE" => vec!["LEDRESTORE:OK".to_string()],
            "REBOOT" | "REBOOTBOOTSEL" | "CANCELPINDETECT" => Vec::new(),
            other if other.starts_with("TILTWAVE_ENABLE:") || other.starts_with("PREVIEWLED:") => Vec::new(),
            other if other.starts_with("SETLED:") => {
                let index = other.split(':').nth(1).unwrap_or("0");
                vec![format!("SETLED:{}:OK", index)]
            }
            _ => vec!["ERROR: Unknown command".to_string()],
        }
    }

    fn merge_user_presets(&mut self, text: &str) -> Vec<String> {
        let incoming: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![format!("ERROR: Failed to import user presets: {}", e)],
        };
        let mut current: Value = self
            .files
            .get("user_presets.json")
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_else(|| json!({}));
        if let (Some(cur), Some(new)) = (current.as_object_mut(), incoming.as_object()) {
            for (k, v) in new {
                cur.insert(k.clone(), v.clone());
            }
        }
        self.files.insert("user_presets.json".to_string(), current.to_string());
        vec!["✅ User presets merged".to_string()]
    }
}

type FirmwareFactory = dyn Fn() -> SimulatedFirmware + Send + Sync;

/// One simulated port. Every `open` boots a fresh firmware from `factory`.
pub struct SimulatedBackend {
    info: SerialDeviceInfo,
    factory: Box<FirmwareFactory>,
    present: AtomicBool,
    opened: AtomicUsize,
    current: Mutex<Option<ServedDevice>>,
}

impl SimulatedBackend {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> SimulatedFirmware + Send + Sync + 'static,
    {
        Self {
            info: SerialDeviceInfo {
                port_name: SIMULATED_PORT.to_string(),
                vid: BGG_VID,
                pid: 0x2d2f,
                serial_number: Some(SIMULATED_UID.to_string()),
                manufacturer: Some("BumbleGum".to_string()),
                product: Some("CH-Guitar".to_string()),
            },
            factory: Box::new(factory),
            present: AtomicBool::new(true),
            opened: AtomicUsize::new(0),
            current: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &SerialDeviceInfo {
        &self.info
    }

    /// Plug in (`true`) or pull the cable (`false`).
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
        if !present {
            self.unplug();
        }
    }

    /// Kill the link without removing the port, like a firmware reset.
    pub fn unplug(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(device) = current.take() {
                device.unplug();
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Lines the host wrote on the current link.
    pub fn received(&self) -> Vec<String> {
        self.current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|d| d.received()))
            .unwrap_or_default()
    }
}

impl DeviceBackend for SimulatedBackend {
    fn available_devices(&self, filter: &DeviceFilter) -> Result<Vec<SerialDeviceInfo>, SerialError> {
        if self.present.load(Ordering::SeqCst) && filter.matches(&self.info) {
            Ok(vec![self.info.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    fn open(&self, info: &SerialDeviceInfo) -> Result<SerialInterface, SerialError> {
        if !self.present.load(Ordering::SeqCst) || info.port_name != self.info.port_name {
            return Err(SerialError::PortNotFound(info.port_name.clone()));
        }
        let (port, device) = loopback_pair();
        let mut firmware = (self.factory)();
        let served = device.serve(move |line| firmware.handle(line));
        if let Ok(mut current) = self.current.lock() {
            *current = Some(served);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(SerialInterface::from_io(Box::new(port)).with_info(info.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let mut fw = SimulatedFirmware::default();
        assert!(fw.handle("WRITEFILE:notes.txt").is_empty());
        assert!(fw.handle("line one").is_empty());
        assert!(fw.handle("END").is_empty());
        assert_eq!(fw.handle("READFILE:notes.txt"), vec!["line one", "END"]);
    }

    #[test]
    fn answers_like_shipping_firmware() {
        let mut fw = SimulatedFirmware::new("2.2");
        assert_eq!(fw.handle("READVERSION"), vec!["ERROR: Unknown command"]);
        assert_eq!(fw.handle("READUID"), vec![SIMULATED_UID, "END"]);
        assert_eq!(fw.handle("READWHAMMY"), vec!["WHAMMY:-1"]);
        assert_eq!(fw.handle("READFILE:missing.json"), vec!["ERROR: Could not read missing.json", "END"]);
        let mut fw = fw.with_version_command("2.3");
        assert_eq!(fw.handle("READVERSION"), vec!["VERSION:2.3", "END"]);
    }

    #[test]
    fn import_merges_presets() {
        let mut fw = SimulatedFirmware::default();
        fw.handle("IMPORTUSER");
        fw.handle(r##"{"Stage": {"GREEN_FRET": "#00FF00"}}"##);
        fw.handle("END");
        let merged: Value = serde_json::from_str(fw.file("user_presets.json").unwrap()).unwrap();
        assert!(merged.get("Stage").is_some());
        assert!(merged.get("NewUserPreset1").is_some());
    }
}
