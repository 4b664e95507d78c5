//! Release automation for iOS apps: signing credentials, provisioning
//! profiles, versioning, archive, upload and processing checks.

#[macro_use]
pub mod output;

pub mod apple_api;
pub mod build;
pub mod certificates;
pub mod config;
pub mod context;
pub mod deploy;
pub mod error;
pub mod keychain;
pub mod model;
pub mod process;
pub mod profiles;
pub mod repository;
pub mod retry;
pub mod team_info;

pub use config::{CertificateType, ReleaseConfig};
pub use context::ReleaseContext;
pub use deploy::{DeploymentOrchestrator, DeploymentReport, RunMode, StatusReport};
pub use error::{ReleaseError, Result};

/// Remove a file or directory left by an earlier run.
///
/// Best effort: a missing path is fine, any other failure is reported as a
/// warning and the caller carries on.
pub async fn cleanup_path<P: AsRef<std::path::Path>>(path: P, description: &str) {
    let path = path.as_ref();
    let Ok(metadata) = tokio::fs::symlink_metadata(path).await else {
        return;
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    if let Err(e) = result
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to clean up {description} at {}: {e}", path.display());
        tracing::warn!(path = %path.display(), error = %e, "cleanup failed");
    }
}
