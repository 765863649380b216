//! In-memory serial endpoint pair.
//!
//! `LoopbackPort` is the host side and plugs into `SerialInterface::from_io`;
//! `DeviceEnd` plays the controller. Used by the integration tests and by the
//! CLI's `--simulate` mode.
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use super::{Result, SerialError, SerialPortIO};

pub struct LoopbackPort {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    carry: Vec<u8>,
}

pub struct DeviceEnd {
    to_host: mpsc::UnboundedSender<Vec<u8>>,
    from_host: mpsc::UnboundedReceiver<Vec<u8>>,
    line_buf: String,
}

pub fn loopback_pair() -> (LoopbackPort, DeviceEnd) {
    let (to_host, inbound) = mpsc::unbounded_channel();
    let (outbound, from_host) = mpsc::unbounded_channel();
    (
        LoopbackPort { inbound, outbound, carry: Vec::new() },
        DeviceEnd { to_host, from_host, line_buf: String::new() },
    )
}

#[async_trait::async_trait]
impl SerialPortIO for LoopbackPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.outbound
            .send(data.to_vec())
            .map_err(|_| SerialError::TransportLost("loopback device closed".into()))
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        if self.carry.is_empty() {
            match timeout(Duration::from_millis(timeout_ms), self.inbound.recv()).await {
                Ok(Some(bytes)) => self.carry = bytes,
                Ok(None) => return Err(SerialError::TransportLost("loopback device closed".into())),
                Err(_) => return Err(SerialError::Timeout),
            }
        }
        let n = self.carry.len().min(buf.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        self.carry.drain(..n);
        Ok(n)
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl DeviceEnd {
    /// Write raw text towards the host. Returns false once the host side is gone.
    pub fn reply(&self, text: &str) -> bool {
        self.to_host.send(text.as_bytes().to_vec()).is_ok()
    }

    /// Next newline-terminated line written by the host, without the newline.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.line_buf.find('\n') {
                let line = self.line_buf[..pos].trim_end_matches('\r').to_string();
                self.line_buf.drain(..=pos);
                return Some(line);
            }
            let chunk = self.from_host.recv().await?;
            self.line_buf.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Answer every host line with `handler`'s replies on a background task.
    pub fn serve<F>(mut self, mut handler: F) -> ServedDevice
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let task = tokio::spawn(async move {
            while let Some(line) = self.next_line().await {
                if let Ok(mut guard) = log.lock() {
                    guard.push(line.clone());
                }
                for reply in handler(&line) {
                    if !self.reply(&format!("{}\n", reply)) {
                        return;
                    }
                }
            }
        });
        ServedDevice { received, task }
    }
}

/// Handle on a `DeviceEnd` running under `serve`.
pub struct ServedDevice {
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl ServedDevice {
    /// Lines the host has written so far.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Simulate unplugging: the host's next read fails with `TransportLost`.
    pub fn unplug(&self) {
        self.task.abort();
    }
}

impl Drop for ServedDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}
