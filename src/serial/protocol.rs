use serde_json::Value;
use std::time::Duration;

use super::frame::{parse_json_payload, END_MARKER};
use super::unified::{CommandSpec, ResponseMatcher, UnifiedSerialHandle};
use super::{Result, SerialError};
use crate::cancellation::CancelToken;

pub const VERSION_READ_TIMEOUT: Duration = Duration::from_secs(8);
/// The firmware listens for a press for 10s before answering.
pub const PIN_DETECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Source file whose `__version__` assignment is the fallback version.
pub const VERSION_SOURCE_FILE: &str = "serial_handler.py";
/// Source file carrying the USB product string, i.e. the device name.
pub const BOOT_FILE: &str = "boot.py";

const PIN_DETECT_REPLIES: &[&str] = &["PINDETECT:DETECTED:", "PINDETECT:NONE:"];
const PIN_SAVE_REPLIES: &[&str] = &["PINDETECT:SAVED:", "PINDETECT:ERROR:"];

/// Firmware without a handler answers `ERROR: Unknown command` and no `END`.
fn end_or_error(lines: &[String]) -> bool {
    lines.iter().any(|l| l.trim() == END_MARKER || l.starts_with("ERROR:"))
}

/// Typed commands for the guitar controller, issued through the session's
/// reader task.
#[derive(Clone)]
pub struct DeviceProtocol {
    handle: UnifiedSerialHandle,
}

impl DeviceProtocol {
    pub fn new(handle: UnifiedSerialHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &UnifiedSerialHandle {
        &self.handle
    }

    /// Logical file names are bare (`config`); the device stores `config.json`.
    pub fn wire_file_name(name: &str) -> String {
        if name.contains('.') {
            name.to_string()
        } else {
            format!("{}.json", name)
        }
    }

    pub fn version_spec() -> CommandSpec {
        CommandSpec::framed("READVERSION")
            .with_timeout(VERSION_READ_TIMEOUT)
            .with_matcher(ResponseMatcher::Custom(end_or_error))
    }

    pub fn device_name_spec() -> CommandSpec {
        CommandSpec::framed("READDEVICENAME").with_matcher(ResponseMatcher::Custom(end_or_error))
    }

    /// Read a device file and return its raw text.
    pub async fn read_file(&self, name: &str) -> Result<String> {
        self.read_file_with(name, None).await
    }

    pub async fn read_file_cancellable(&self, name: &str, token: &CancelToken) -> Result<String> {
        self.read_file_with(name, Some(token)).await
    }

    async fn read_file_with(&self, name: &str, token: Option<&CancelToken>) -> Result<String> {
        let wire = Self::wire_file_name(name);
        let tag = format!("file:{}", wire);
        let cmd = format!("READFILE:{}", wire);
        let spec = CommandSpec::framed("READFILE");
        let resp = match token {
            Some(token) => self.handle.request_cancellable(&tag, cmd, spec, token).await?,
            None => self.handle.request(&tag, cmd, spec).await?,
        };
        if let Some(err) = device_error(&resp.payload) {
            return Err(SerialError::ProtocolError(format!("READFILE {}: {}", wire, err)));
        }
        Ok(resp.payload)
    }

    /// Read a device file expected to hold a JSON object.
    pub async fn read_json_file(&self, name: &str) -> Result<Value> {
        let payload = self.read_file(name).await?;
        if payload.trim().is_empty() {
            return Err(SerialError::ParseFailure(format!("{} is empty", name)));
        }
        parse_json_payload(&payload)
    }

    /// `WRITEFILE:<name>`, the content lines, then `END`.
    pub async fn write_file(&self, name: &str, contents: &str) -> Result<()> {
        let wire = Self::wire_file_name(name);
        let mut lines = vec![format!("WRITEFILE:{}", wire)];
        lines.extend(body_lines(contents)?);
        lines.push(END_MARKER.to_string());
        log::info!("Writing {} ({} bytes)", wire, contents.len());
        self.handle.send_lines(lines).await
    }

    /// Writing `config` makes the firmware reset itself once the file is stored.
    pub async fn write_json_file(&self, name: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value).map_err(|e| SerialError::ParseFailure(e.to_string()))?;
        self.write_file(name, &text).await
    }

    /// Merge presets into `user_presets.json` on the device.
    pub async fn import_user_presets(&self, presets: &Value) -> Result<()> {
        let text = serde_json::to_string(presets).map_err(|e| SerialError::ParseFailure(e.to_string()))?;
        self.handle.send_lines(vec!["IMPORTUSER".to_string(), text, END_MARKER.to_string()]).await
    }

    /// 16 upper-case hex characters identifying the board.
    pub async fn read_uid(&self) -> Result<String> {
        let resp = self.handle.request("uid", "READUID", CommandSpec::framed("READUID")).await?;
        if let Some(err) = device_error(&resp.payload) {
            return Err(SerialError::ProtocolError(format!("READUID: {}", err)));
        }
        Self::parse_uid(&resp.payload)
            .ok_or_else(|| SerialError::ParseFailure(format!("invalid uid reply: {:?}", resp.payload)))
    }

    pub async fn read_version(&self) -> Result<String> {
        let resp = self.handle.request("version", "READVERSION", Self::version_spec()).await?;
        Self::parse_version(&resp.payload)
            .ok_or_else(|| SerialError::ProtocolError(format!("no VERSION in reply: {:?}", resp.payload)))
    }

    /// Fallback for firmware without `READVERSION`.
    pub async fn read_version_from_source(&self) -> Result<String> {
        let text = self.read_file(VERSION_SOURCE_FILE).await?;
        Self::parse_version_assignment(&text)
            .ok_or_else(|| SerialError::ParseFailure(format!("no __version__ in {}", VERSION_SOURCE_FILE)))
    }

    pub async fn read_device_name(&self) -> Result<String> {
        let resp = self.handle.request("device-name", "READDEVICENAME", Self::device_name_spec()).await?;
        Self::parse_device_name(&resp.payload)
            .ok_or_else(|| SerialError::ProtocolError(format!("no DEVICENAME in reply: {:?}", resp.payload)))
    }

    pub async fn read_boot_file(&self) -> Result<String> {
        self.read_file(BOOT_FILE).await
    }

    /// `READDEVICENAME`, falling back to the product string in `boot.py`.
    pub async fn lookup_device_name(&self) -> Result<String> {
        match self.read_device_name().await {
            Ok(name) => Ok(name),
            Err(e) if e.is_transport_lost() => Err(e),
            Err(e) => {
                log::debug!("READDEVICENAME failed ({}); reading {}", e, BOOT_FILE);
                let boot = self.read_boot_file().await?;
                Self::parse_boot_product(&boot)
                    .ok_or_else(|| SerialError::ParseFailure(format!("no product= in {}", BOOT_FILE)))
            }
        }
    }

    /// Learn which GPIO a button is wired to. `None` if nothing was pressed.
    pub async fn detect_pin(&self, key: &str, token: &CancelToken) -> Result<Option<String>> {
        let spec = CommandSpec::framed("DETECTPIN")
            .with_timeout(PIN_DETECT_TIMEOUT)
            .with_matcher(ResponseMatcher::AnyPrefix(PIN_DETECT_REPLIES));
        let resp = match self.handle.request_cancellable("detect-pin", format!("DETECTPIN:{}", key), spec, token).await {
            Err(SerialError::Cancelled) => {
                let _ = self.handle.send_line("CANCELPINDETECT").await;
                return Err(SerialError::Cancelled);
            }
            other => other?,
        };
        Self::parse_pin_detect(&resp.payload, key)
    }

    pub async fn save_pin(&self, key: &str, pin: &str) -> Result<()> {
        let spec = CommandSpec::framed("SAVEPIN").with_matcher(ResponseMatcher::AnyPrefix(PIN_SAVE_REPLIES));
        let resp = self.handle.request("save-pin", format!("SAVEPIN:{}:{}", key, pin), spec).await?;
        match resp.payload.lines().find(|l| l.starts_with("PINDETECT:")) {
            Some(line) if line.starts_with("PINDETECT:SAVED:") => Ok(()),
            Some(line) => Err(SerialError::ProtocolError(line.to_string())),
            None => Err(SerialError::ProtocolError("no SAVEPIN acknowledgement".into())),
        }
    }

    /// Live colour preview; the firmware sends no acknowledgement.
    pub async fn preview_led(&self, led_name: &str, hex_color: &str) -> Result<()> {
        let hex = hex_color.trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SerialError::ProtocolError(format!("invalid colour: {}", hex_color)));
        }
        self.handle.send_line(format!("PREVIEWLED:{}:{}", led_name, hex)).await
    }

    pub async fn set_led(&self, index: u8, r: u8, g: u8, b: u8) -> Result<()> {
        self.handle.send_line(format!("SETLED:{}:{}:{}:{}", index, r, g, b)).await
    }

    pub async fn led_restore(&self) -> Result<()> {
        self.handle.send_line("LEDRESTORE").await
    }

    pub async fn set_tilt_wave(&self, enabled: bool) -> Result<()> {
        self.handle.send_line(format!("TILTWAVE_ENABLE:{}", enabled)).await
    }

    pub async fn reboot(&self) -> Result<()> {
        log::info!("Requesting device reboot");
        self.handle.send_line("REBOOT").await
    }

    /// Reboot into the RP2040 mass-storage bootloader.
    pub async fn reboot_bootsel(&self) -> Result<()> {
        log::info!("Requesting reboot into BOOTSEL");
        self.handle.send_line("REBOOTBOOTSEL").await
    }

    pub async fn read_pin(&self, key: &str) -> Result<()> {
        self.handle.send_line(format!("READPIN:{}", key)).await
    }

    pub async fn read_whammy(&self) -> Result<()> {
        self.handle.send_line("READWHAMMY").await
    }

    pub async fn read_joystick(&self) -> Result<()> {
        self.handle.send_line("READJOYSTICK").await
    }

    pub fn parse_uid(payload: &str) -> Option<String> {
        payload
            .lines()
            .map(str::trim)
            .find(|l| l.len() == 16 && l.chars().all(|c| c.is_ascii_hexdigit()))
            .map(|l| l.to_ascii_uppercase())
    }

    pub fn parse_version(payload: &str) -> Option<String> {
        prefixed_value(payload, "VERSION:")
    }

    pub fn parse_device_name(payload: &str) -> Option<String> {
        prefixed_value(payload, "DEVICENAME:")
    }

    /// `__version__ = "2.2"` (either quote style).
    pub fn parse_version_assignment(source: &str) -> Option<String> {
        source.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("__version__")?.trim_start().strip_prefix('=')?;
            quoted(rest.trim())
        })
    }

    /// `product="CH-Guitar"` inside `supervisor.set_usb_identification(...)`.
    pub fn parse_boot_product(source: &str) -> Option<String> {
        source.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("product")?.trim_start().strip_prefix('=')?;
            quoted(rest.trim().trim_end_matches(','))
        })
    }

    fn parse_pin_detect(payload: &str, key: &str) -> Result<Option<String>> {
        for line in payload.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("PINDETECT:DETECTED:") {
                return match rest.rsplit_once(':') {
                    Some((_, pin)) if !pin.is_empty() => Ok(Some(pin.to_string())),
                    _ => Err(SerialError::ParseFailure(format!("bad detect reply: {}", line))),
                };
            }
            if line.starts_with("PINDETECT:NONE:") {
                log::info!("No pin detected for {}", key);
                return Ok(None);
            }
        }
        Err(SerialError::ProtocolError("no PINDETECT result".into()))
    }
}

fn prefixed_value(payload: &str, prefix: &str) -> Option<String> {
    payload
        .lines()
        .find_map(|l| l.trim().strip_prefix(prefix))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn quoted(text: &str) -> Option<String> {
    let quote = text.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = &text[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

/// The message of an `ERROR:` line, if the payload starts with one.
fn device_error(payload: &str) -> Option<&str> {
    payload.trim_start().strip_prefix("ERROR:").map(|e| e.lines().next().unwrap_or("").trim())
}

/// A body line equal to `END` would terminate the write early.
fn body_lines(contents: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for line in contents.lines() {
        if line.trim_end_matches('\r') == END_MARKER {
            return Err(SerialError::ProtocolError("file body contains a bare END line".into()));
        }
        out.push(line.trim_end_matches('\r').to_string());
    }
    Ok(out)
}

/// Replace the quoted value of the first `product=` assignment, keeping the
/// rest of the file byte for byte.
pub fn splice_boot_product(source: &str, name: &str) -> Option<String> {
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    let mut out = String::with_capacity(source.len() + name.len());
    let mut spliced = false;
    for line in source.split_inclusive('\n') {
        if !spliced {
            if let Some(new_line) = splice_line(line, &escaped) {
                out.push_str(&new_line);
                spliced = true;
                continue;
            }
        }
        out.push_str(line);
    }
    spliced.then_some(out)
}

fn splice_line(line: &str, escaped: &str) -> Option<String> {
    let start = line.find("product")?;
    let after_key = &line[start + "product".len()..];
    let eq = after_key.find('=')?;
    if !after_key[..eq].trim().is_empty() {
        return None;
    }
    let value_part = &after_key[eq + 1..];
    let lead = value_part.len() - value_part.trim_start().len();
    let quote = value_part.trim_start().chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let open = start + "product".len() + eq + 1 + lead;
    let close = open + 1 + line[open + 1..].find(quote)?;
    Some(format!("{}\"{}\"{}", &line[..open], escaped, &line[close + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT: &str = "supervisor.set_usb_identification(\n    manufacturer=\"BumbleGum\",\n    product=\"CH-Guitar\",\n    vid=0x6997,\n)\n";

    #[test]
    fn wire_names_get_json_extension() {
        assert_eq!(DeviceProtocol::wire_file_name("config"), "config.json");
        assert_eq!(DeviceProtocol::wire_file_name("factory_config"), "factory_config.json");
        assert_eq!(DeviceProtocol::wire_file_name("boot.py"), "boot.py");
    }

    #[test]
    fn parses_prefixed_replies() {
        assert_eq!(DeviceProtocol::parse_version("VERSION:2.3").as_deref(), Some("2.3"));
        assert_eq!(DeviceProtocol::parse_version("noise\nVERSION: v2.4 \nEND").as_deref(), Some("v2.4"));
        assert_eq!(DeviceProtocol::parse_version("ERROR: Unknown command"), None);
        assert_eq!(DeviceProtocol::parse_device_name("DEVICENAME:Stage Left").as_deref(), Some("Stage Left"));
    }

    #[test]
    fn uid_must_be_sixteen_hex_chars() {
        assert_eq!(DeviceProtocol::parse_uid("e6614c311b8d4e2a").as_deref(), Some("E6614C311B8D4E2A"));
        assert_eq!(DeviceProtocol::parse_uid("E6614C311B8D4E2"), None);
        assert_eq!(DeviceProtocol::parse_uid("ERROR: no uid"), None);
    }

    #[test]
    fn source_fallbacks() {
        let handler = "# serial_handler.py\n__version__ = \"2.2\"\n\ndef get_version():\n";
        assert_eq!(DeviceProtocol::parse_version_assignment(handler).as_deref(), Some("2.2"));
        assert_eq!(DeviceProtocol::parse_version_assignment("__version__='3.0.1'").as_deref(), Some("3.0.1"));
        assert_eq!(DeviceProtocol::parse_boot_product(BOOT).as_deref(), Some("CH-Guitar"));
    }

    #[test]
    fn splice_replaces_only_the_product_value() {
        let out = splice_boot_product(BOOT, "My \"Axe\"").unwrap();
        assert!(out.contains("    product=\"My \\\"Axe\\\"\",\n"));
        assert!(out.contains("manufacturer=\"BumbleGum\""));
        assert_eq!(out.len(), BOOT.len() + "My \\\"Axe\\\"".len() - "CH-Guitar".len());
        assert!(splice_boot_product("print('hi')\n", "x").is_none());
    }

    #[test]
    fn pin_detect_results() {
        let detected = "PINDETECT:START:GREEN_FRET\nPINDETECT:DETECTED:GREEN_FRET:GP10";
        assert_eq!(DeviceProtocol::parse_pin_detect(detected, "GREEN_FRET").unwrap().as_deref(), Some("GP10"));
        let none = "PINDETECT:START:GREEN_FRET\nPINDETECT:NONE:GREEN_FRET";
        assert_eq!(DeviceProtocol::parse_pin_detect(none, "GREEN_FRET").unwrap(), None);
    }

    #[test]
    fn body_with_bare_end_is_rejected() {
        assert!(body_lines("{\n}\n").is_ok());
        assert!(body_lines("a\nEND\nb").is_err());
    }
}
