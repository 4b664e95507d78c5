//! Deployment pipeline
//!
//! - `orchestrator`: the six ordered phases and history trail
//! - `report`: run outcome, first failure and artifacts
//! - `status`: read-only inventory of certificates, profiles and runs

mod orchestrator;
mod report;
mod status;

pub use orchestrator::{DeploymentOrchestrator, RunMode, package_digest};
pub use report::{DeploymentArtifacts, DeploymentReport, PhaseFailure};
pub use status::{STATUS_KEYCHAIN, StatusReport, latest_history};
