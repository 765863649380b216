use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use bgg_config_lib::cancellation::CancelToken;
use bgg_config_lib::device::{DeviceManager, SimulatedBackend, SimulatedFirmware};
use bgg_config_lib::events::{event_channel, UiEvent};
use bgg_config_lib::serial::{DeviceFilter, SerialError};
use bgg_config_lib::update::{
    Deployer, FileRef, Manifest, ManifestSource, SerialDeployer, UpdateCheck, UpdateError, UpdateOrchestrator,
    UpdatePhase, UpdateResult,
};

const NEW_BOOT: &str = "import supervisor\nsupervisor.set_usb_identification(\n    manufacturer=\"BumbleGum\",\n    product=\"BumbleGum Guitar\",\n)\n";

struct FakeSource {
    manifest: Manifest,
    files: BTreeMap<String, Vec<u8>>,
}

#[async_trait]
impl ManifestSource for FakeSource {
    async fn fetch_manifest(&self) -> UpdateResult<Manifest> {
        Ok(self.manifest.clone())
    }

    async fn fetch_file(
        &self,
        name: &str,
        _file: &FileRef,
        _progress: &(dyn Fn(bgg_config_lib::update::DownloadProgress) + Send + Sync),
    ) -> UpdateResult<Vec<u8>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| UpdateError::ManifestUnavailable(format!("no {}", name)))
    }
}

fn source(version: &str) -> Arc<FakeSource> {
    let mut manifest_files = BTreeMap::new();
    let mut files = BTreeMap::new();
    for (name, body) in [
        ("boot.py", NEW_BOOT.to_string()),
        ("serial_handler.py", format!("__version__ = \"{}\"\n", version)),
    ] {
        manifest_files.insert(name.to_string(), FileRef::Url(name.to_string()));
        files.insert(name.to_string(), body.into_bytes());
    }
    Arc::new(FakeSource {
        manifest: Manifest {
            firmware_version: version.to_string(),
            files: manifest_files,
            release_notes: "Faster strum debounce".to_string(),
        },
        files,
    })
}

/// Writes over the live link like the real deployer, then stands in for the
/// firmware reset: the next boot reports `after`, or never comes back.
struct RebootingDeployer {
    manager: DeviceManager,
    backend: Arc<SimulatedBackend>,
    installed: Arc<Mutex<String>>,
    after: Option<String>,
    written: Mutex<Vec<String>>,
}

#[async_trait]
impl Deployer for RebootingDeployer {
    async fn deploy(
        &self,
        files: &[(String, String)],
        progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<(), SerialError> {
        let session = self.manager.active_session().await.ok_or(SerialError::Cancelled)?;
        SerialDeployer::new(session.protocol().clone()).deploy(files, progress).await?;
        for _ in 0..200 {
            if self.backend.received().iter().any(|l| l == "REBOOT") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        *self.written.lock().unwrap() = self.backend.received();

        match &self.after {
            Some(version) => *self.installed.lock().unwrap() = version.clone(),
            None => self.backend.set_present(false),
        }
        self.backend.unplug();
        Ok(())
    }
}

struct Rig {
    manager: DeviceManager,
    backend: Arc<SimulatedBackend>,
    installed: Arc<Mutex<String>>,
    events: broadcast::Receiver<UiEvent>,
    shutdown: CancelToken,
}

impl Rig {
    async fn new() -> Self {
        let installed = Arc::new(Mutex::new("2.2".to_string()));
        let version = installed.clone();
        let backend = Arc::new(SimulatedBackend::new(move || SimulatedFirmware::new(&version.lock().unwrap())));
        let (events_tx, mut events) = event_channel();
        let manager = DeviceManager::new(backend.clone(), DeviceFilter::default(), events_tx);

        let shutdown = CancelToken::new();
        let discovery = manager.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move { discovery.run_discovery(Duration::from_millis(50), stop).await });

        // Identity is cached once the boot sequence finishes.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches!(events.recv().await, Ok(UiEvent::DeviceInfoRead { .. })) {}
        })
        .await
        .unwrap();
        Self { manager, backend, installed, events, shutdown }
    }

    fn orchestrator(&self, source: Arc<FakeSource>, after: Option<&str>) -> (UpdateOrchestrator, Arc<RebootingDeployer>) {
        let deployer = Arc::new(RebootingDeployer {
            manager: self.manager.clone(),
            backend: self.backend.clone(),
            installed: self.installed.clone(),
            after: after.map(str::to_string),
            written: Mutex::new(Vec::new()),
        });
        let orchestrator = UpdateOrchestrator::new(source, Arc::new(self.manager.clone()), self.manager.events().clone())
            .with_deployer(deployer.clone())
            .with_validation_timing(Duration::from_secs(5), Duration::from_millis(100));
        (orchestrator, deployer)
    }

    fn phases(&mut self) -> Vec<UpdatePhase> {
        let mut phases = Vec::new();
        while let Ok(evt) = self.events.try_recv() {
            if let UiEvent::UpdateStateChanged(status) = evt {
                if phases.last() != Some(&status.phase) {
                    phases.push(status.phase);
                }
            }
        }
        phases
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn update_succeeds_when_new_session_reports_the_version() {
    let mut rig = Rig::new().await;
    let (orchestrator, deployer) = rig.orchestrator(source("2.3"), Some("v2.3"));

    let manifest = match orchestrator.check_for_update(false).await.unwrap() {
        UpdateCheck::Available { device_version, manifest } => {
            assert_eq!(device_version, "2.2");
            manifest
        }
        other => panic!("expected an update, got {:?}", other),
    };

    let reported = orchestrator.run_update(&manifest).await.unwrap();
    assert_eq!(reported, "v2.3");
    assert!(!orchestrator.is_running());

    assert_eq!(
        rig.phases(),
        vec![
            UpdatePhase::Checking,
            UpdatePhase::UpdateAvailable,
            UpdatePhase::Preparing,
            UpdatePhase::Downloading,
            UpdatePhase::Installing,
            UpdatePhase::Rebooting,
            UpdatePhase::Validating,
            UpdatePhase::Succeeded,
        ]
    );

    // The device kept its name through the boot.py replacement.
    let written = deployer.written.lock().unwrap().clone();
    assert!(written.contains(&"WRITEFILE:boot.py".to_string()));
    assert!(written.iter().any(|l| l.trim() == "product=\"CH-Guitar\","));
    assert!(!written.iter().any(|l| l.contains("BumbleGum Guitar")));
    assert!(written.contains(&"REBOOT".to_string()));
}

#[tokio::test]
async fn update_reports_mismatch() {
    let mut rig = Rig::new().await;
    let (orchestrator, _) = rig.orchestrator(source("2.3"), Some("2.2"));
    let manifest = orchestrator.check_for_update(true).await.map(|_| orchestrator.cached_manifest()).unwrap().unwrap();

    let err = orchestrator.run_update(&manifest).await.unwrap_err();
    assert!(matches!(&err, UpdateError::ValidationMismatch { expected, reported } if expected == "2.3" && reported == "2.2"));
    assert_eq!(rig.phases().last(), Some(&UpdatePhase::Mismatched));
}

#[tokio::test]
async fn update_times_out_when_device_never_returns() {
    let mut rig = Rig::new().await;
    let (orchestrator, _) = rig.orchestrator(source("2.3"), None);
    let orchestrator = orchestrator.with_validation_timing(Duration::from_millis(600), Duration::from_millis(100));
    orchestrator.check_for_update(true).await.unwrap();
    let manifest = orchestrator.cached_manifest().unwrap();

    let err = orchestrator.run_update(&manifest).await.unwrap_err();
    assert!(matches!(err, UpdateError::ValidationTimedOut(_)));
    assert_eq!(rig.phases().last(), Some(&UpdatePhase::TimedOut));
}

#[tokio::test]
async fn deferral_suppresses_automatic_checks_only() {
    let rig = Rig::new().await;
    let (orchestrator, _) = rig.orchestrator(source("2.3"), Some("2.3"));

    orchestrator.defer_update().await.unwrap();

    assert!(matches!(orchestrator.check_for_update(false).await.unwrap(), UpdateCheck::Suppressed { .. }));
    assert!(matches!(orchestrator.check_for_update(true).await.unwrap(), UpdateCheck::Available { .. }));
}

#[tokio::test]
async fn same_version_is_up_to_date() {
    let rig = Rig::new().await;
    let (orchestrator, _) = rig.orchestrator(source("v2.2"), None);

    match orchestrator.check_for_update(false).await.unwrap() {
        UpdateCheck::UpToDate { device_version, latest_version } => {
            assert_eq!(device_version, "2.2");
            assert_eq!(latest_version, "v2.2");
        }
        other => panic!("unexpected {:?}", other),
    }
}
