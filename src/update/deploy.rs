use async_trait::async_trait;

use crate::serial::{DeviceProtocol, SerialError};

/// Writes a prepared file set to the device and reboots it.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        files: &[(String, String)],
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<(), SerialError>;
}

/// Deploys over the session's own link: one `WRITEFILE` per file, then `REBOOT`.
pub struct SerialDeployer {
    protocol: DeviceProtocol,
}

impl SerialDeployer {
    pub fn new(protocol: DeviceProtocol) -> Self {
        Self { protocol }
    }
}

#[async_trait]
impl Deployer for SerialDeployer {
    async fn deploy(
        &self,
        files: &[(String, String)],
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<(), SerialError> {
        for (i, (name, contents)) in files.iter().enumerate() {
            self.protocol.write_file(name, contents).await?;
            progress(i + 1, files.len());
        }
        self.protocol.reboot().await
    }
}
