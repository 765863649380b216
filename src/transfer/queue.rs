use serde_json::Value;
use std::collections::VecDeque;

use super::{TransferEvent, CONFIG_FILE, DEFAULT_FILES, FACTORY_CONFIG_FILE};
use crate::cancellation::CancelToken;
use crate::serial::{parse_json_payload, DeviceProtocol, SerialError};

/// Reads named device files strictly one after another.
///
/// Re-created for every connection, so the order is the same each cycle.
pub struct TransferQueue {
    protocol: DeviceProtocol,
    token: CancelToken,
    pending: VecDeque<String>,
}

impl TransferQueue {
    pub fn new(protocol: DeviceProtocol, token: CancelToken) -> Self {
        Self { protocol, token, pending: VecDeque::new() }
    }

    /// Queue seeded with `config`, `presets`, `user_presets`.
    pub fn with_defaults(protocol: DeviceProtocol, token: CancelToken) -> Self {
        let mut queue = Self::new(protocol, token);
        queue.seed(DEFAULT_FILES);
        queue
    }

    /// Replace whatever is queued.
    pub fn seed<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending = names.into_iter().map(Into::into).collect();
    }

    pub fn pending(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Drain the queue front to back, then look up the device name.
    ///
    /// Per-file failures are reported through `emit` and do not stop the
    /// queue. Only a lost transport or cancelled session ends it early.
    pub async fn load_all<F>(&mut self, mut emit: F) -> Result<(), SerialError>
    where
        F: FnMut(TransferEvent),
    {
        while let Some(name) = self.pending.pop_front() {
            match self.read_json(&name).await {
                Ok(contents) => {
                    log::info!("Loaded {}", name);
                    emit(TransferEvent::Loaded { name, contents });
                }
                Err(e) if is_fatal(&e) => {
                    self.pending.clear();
                    return Err(e);
                }
                Err(e) if name == CONFIG_FILE => {
                    log::warn!("{} unreadable ({}); restoring from {}", CONFIG_FILE, e, FACTORY_CONFIG_FILE);
                    self.restore_config(&mut emit).await?;
                }
                Err(e) => {
                    log::warn!("Failed to load {}: {}", name, e);
                    emit(TransferEvent::Failed { name, reason: e.to_string() });
                }
            }
        }

        let device_name = match self.token.run_until_cancelled(self.protocol.lookup_device_name()).await {
            None => return Err(SerialError::Cancelled),
            Some(Ok(name)) => Some(name),
            Some(Err(e)) if is_fatal(&e) => return Err(e),
            Some(Err(e)) => {
                log::warn!("Device name lookup failed: {}", e);
                None
            }
        };
        emit(TransferEvent::AllLoaded { device_name });
        Ok(())
    }

    /// One factory read, one write-back. Never retried.
    async fn restore_config<F>(&mut self, emit: &mut F) -> Result<(), SerialError>
    where
        F: FnMut(TransferEvent),
    {
        let contents = match self.read_json(FACTORY_CONFIG_FILE).await {
            Ok(contents) => contents,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                log::error!("Factory config unreadable: {}", e);
                emit(TransferEvent::Failed {
                    name: CONFIG_FILE.to_string(),
                    reason: format!("config and factory_config both unreadable: {}", e),
                });
                return Ok(());
            }
        };

        emit(TransferEvent::Restored { name: CONFIG_FILE.to_string(), contents: contents.clone() });
        // The firmware resets after storing config.json.
        self.protocol.write_json_file(CONFIG_FILE, &contents).await?;
        log::info!("Re-persisted {} from {}", CONFIG_FILE, FACTORY_CONFIG_FILE);
        Ok(())
    }

    async fn read_json(&self, name: &str) -> Result<Value, SerialError> {
        let payload = self.protocol.read_file_cancellable(name, &self.token).await?;
        if payload.trim().is_empty() {
            return Err(SerialError::ParseFailure(format!("{} returned no data", name)));
        }
        parse_json_payload(&payload)
    }
}

fn is_fatal(e: &SerialError) -> bool {
    e.is_transport_lost() || matches!(e, SerialError::Cancelled)
}
