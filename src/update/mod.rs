pub mod deferral;
pub mod deploy;
pub mod models;
pub mod orchestrator;
pub mod service;
pub mod version;

pub use deferral::DeferralStore;
pub use deploy::{Deployer, SerialDeployer};
pub use models::*;
pub use orchestrator::{SessionProvider, UpdateOrchestrator, VALIDATION_BUDGET, VALIDATION_RECHECK};
pub use service::{ManifestSource, UpdateService};
pub use version::{compare_versions, is_newer_version, versions_match};
