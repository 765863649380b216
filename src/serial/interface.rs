use std::io::{Read, Write};
use std::time::Duration;
use serialport::{SerialPort, SerialPortType};
use tokio::time::timeout;

use super::{Result, SerialError, SerialDeviceInfo};

// BumbleGum Guitars controllers (RP2040 running CircuitPython)
pub const BGG_VID: u16 = 0x6997;
pub const DEFAULT_CLASS_MATCH: &str = "Guitar";
pub const BAUD_RATE: u32 = 115200;

/// Byte-level access to an open serial endpoint.
///
/// The unified reader task is the only caller once a session is running, so
/// implementations never see concurrent calls.
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;
    /// Read whatever is available, waiting at most `timeout_ms`.
    /// Returns `Err(SerialError::Timeout)` when nothing arrived.
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;
    async fn flush(&mut self) -> Result<()>;
}

/// Which enumerated ports count as our device.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    /// Case-insensitive sub-string matched against product or manufacturer.
    /// Empty disables the check.
    pub class_match: String,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self { vendor_id: BGG_VID, class_match: DEFAULT_CLASS_MATCH.to_string() }
    }
}

impl DeviceFilter {
    pub fn matches(&self, info: &SerialDeviceInfo) -> bool {
        if info.vid != self.vendor_id {
            return false;
        }
        if self.class_match.is_empty() {
            return true;
        }
        let needle = self.class_match.to_lowercase();
        [info.product.as_deref(), info.manufacturer.as_deref()]
            .into_iter()
            .flatten()
            .any(|s| s.to_lowercase().contains(&needle))
    }
}

/// `SerialPortIO` over a native serial port.
struct NativePort {
    port: Box<dyn SerialPort>,
}

#[async_trait::async_trait]
impl SerialPortIO for NativePort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        // A write failing on an open port means the cable is gone.
        self.port.write_all(data).map_err(|e| SerialError::TransportLost(e.to_string()))?;
        self.port.flush().map_err(SerialError::IoError)?;
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port = &mut self.port;
        let read_operation = async {
            loop {
                match port.bytes_to_read() {
                    Ok(0) => tokio::time::sleep(Duration::from_millis(5)).await,
                    Ok(_) => match port.read(buf) {
                        Ok(0) => return Err(SerialError::TransportLost("port returned EOF".into())),
                        Ok(n) => return Ok(n),
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => return Err(SerialError::TransportLost(e.to_string())),
                    },
                    Err(e) => return Err(SerialError::TransportLost(e.to_string())),
                }
            }
        };

        timeout(Duration::from_millis(timeout_ms), read_operation)
            .await
            .map_err(|_| SerialError::Timeout)?
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(SerialError::IoError)
    }
}

pub struct SerialInterface {
    io: Option<Box<dyn SerialPortIO>>,
    device_info: Option<SerialDeviceInfo>,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self { io: None, device_info: None }
    }

    /// Wrap an already-open endpoint (loopback ports, tests).
    pub fn from_io(io: Box<dyn SerialPortIO>) -> Self {
        Self { io: Some(io), device_info: None }
    }

    pub fn with_info(mut self, info: SerialDeviceInfo) -> Self {
        self.device_info = Some(info);
        self
    }

    /// Enumerate serial ports belonging to our controllers
    pub fn discover_devices(filter: &DeviceFilter) -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => Some(SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                }),
                _ => None,
            })
            .filter(|info| filter.matches(info))
            .collect();

        Ok(devices)
    }

    /// Open the port described by `info`
    pub fn connect(&mut self, info: &SerialDeviceInfo) -> Result<()> {
        let port = serialport::new(&info.port_name, BAUD_RATE)
            .timeout(Duration::from_millis(1000))
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", info.port_name, e)))?;

        self.io = Some(Box::new(NativePort { port }));
        self.device_info = Some(info.clone());

        log::info!("Opened serial port {} ({:04X}:{:04X})", info.port_name, info.vid, info.pid);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(device) = &self.device_info {
            log::info!("Closing serial port {}", device.port_name);
        }
        self.io = None;
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn device_info(&self) -> Option<&SerialDeviceInfo> {
        self.device_info.as_ref()
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let io = self.io.as_mut()
            .ok_or_else(|| SerialError::TransportLost("not connected".to_string()))?;
        io.send_data(data).await
    }

    pub async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let io = self.io.as_mut()
            .ok_or_else(|| SerialError::TransportLost("not connected".to_string()))?;
        io.read_data(buffer, timeout_ms).await
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vid: u16, product: Option<&str>) -> SerialDeviceInfo {
        SerialDeviceInfo {
            port_name: "/dev/ttyACM0".into(),
            vid,
            pid: 0x1234,
            serial_number: None,
            manufacturer: Some("BumbleGum".into()),
            product: product.map(str::to_string),
        }
    }

    #[test]
    fn filter_requires_vendor_and_class() {
        let filter = DeviceFilter::default();
        assert!(filter.matches(&info(BGG_VID, Some("CH-Guitar"))));
        assert!(!filter.matches(&info(0x2E8A, Some("CH-Guitar"))));
        assert!(!filter.matches(&info(BGG_VID, Some("Keypad"))));
    }

    #[test]
    fn empty_class_match_accepts_any_product() {
        let filter = DeviceFilter { vendor_id: BGG_VID, class_match: String::new() };
        assert!(filter.matches(&info(BGG_VID, None)));
    }

    #[tokio::test]
    async fn disconnected_interface_reports_transport_lost() {
        let mut iface = SerialInterface::new();
        let err = iface.send_data(b"READUID\n").await.unwrap_err();
        assert!(err.is_transport_lost());
    }
}
