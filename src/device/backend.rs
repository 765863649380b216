use crate::serial::{DeviceFilter, SerialDeviceInfo, SerialError, SerialInterface};

/// Where sessions come from: real serial ports, or in-memory pairs in tests.
pub trait DeviceBackend: Send + Sync {
    fn available_devices(&self, filter: &DeviceFilter) -> Result<Vec<SerialDeviceInfo>, SerialError>;
    fn open(&self, info: &SerialDeviceInfo) -> Result<SerialInterface, SerialError>;
}

/// `serialport` enumeration and native ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl DeviceBackend for NativeBackend {
    fn available_devices(&self, filter: &DeviceFilter) -> Result<Vec<SerialDeviceInfo>, SerialError> {
        SerialInterface::discover_devices(filter)
    }

    fn open(&self, info: &SerialDeviceInfo) -> Result<SerialInterface, SerialError> {
        let mut interface = SerialInterface::new();
        interface.connect(info)?;
        Ok(interface)
    }
}

/// CircuitPython exposes a console and a data CDC port with the same serial
/// number; the data port enumerates second. Pick one port per board, the
/// data port where both are present.
pub fn select_data_ports(mut ports: Vec<SerialDeviceInfo>) -> Vec<SerialDeviceInfo> {
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    let mut out: Vec<SerialDeviceInfo> = Vec::new();
    for port in ports {
        let same_board = out.iter().position(|p| {
            p.serial_number.is_some() && p.serial_number == port.serial_number && p.vid == port.vid && p.pid == port.pid
        });
        match same_board {
            Some(idx) => out[idx] = port,
            None => out.push(port),
        }
    }
    out
}
