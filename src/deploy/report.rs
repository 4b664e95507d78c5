//! Outcome of one deployment run

use crate::error::ReleaseError;
use crate::model::{DeploymentHistory, DeploymentStatus, Phase, VersionInfo};
use crate::repository::BuildStatus;
use std::path::PathBuf;
use std::time::Duration;

/// The first blocking error, with enough context to act on it.
#[derive(Debug, Clone)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub team_id: String,
    pub app_identifier: String,
    /// Error taxonomy name, e.g. "CertificateError"
    pub category: String,
    pub message: String,
    pub suggestions: Vec<String>,
}

impl PhaseFailure {
    pub fn from_error(phase: Phase, team_id: &str, app_identifier: &str, error: &ReleaseError) -> Self {
        let mut message = error.to_string();
        let mut suggestions = Vec::new();

        // Per-type reasons are more useful than the aggregate line
        if let ReleaseError::CertificatesUnavailable { report, .. } = error {
            for (cert_type, availability) in report.iter() {
                if let crate::certificates::Availability::Unavailable {
                    reason,
                    suggestions: hints,
                } = availability
                {
                    message.push_str(&format!("\n  {cert_type}: {reason}"));
                    suggestions.extend(hints.iter().cloned());
                }
            }
        }
        for hint in error.suggestions() {
            if !suggestions.contains(&hint) {
                suggestions.push(hint);
            }
        }

        Self {
            phase,
            team_id: team_id.to_string(),
            app_identifier: app_identifier.to_string(),
            category: error.category().to_string(),
            message,
            suggestions,
        }
    }
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "phase {} ({}) failed for {} (team {}): [{}] {}",
            self.phase.number(),
            self.phase,
            self.app_identifier,
            self.team_id,
            self.category,
            self.message
        )
    }
}

/// Files produced by the run.
#[derive(Debug, Clone, Default)]
pub struct DeploymentArtifacts {
    pub version: Option<VersionInfo>,
    pub previous_version: Option<VersionInfo>,
    pub archive_path: Option<PathBuf>,
    pub package_path: Option<PathBuf>,
    /// Hex SHA-256 of the exported package
    pub package_sha256: Option<String>,
    pub delivery_id: Option<String>,
    pub processing: Option<BuildStatus>,
}

#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub history: DeploymentHistory,
    pub failure: Option<PhaseFailure>,
    pub artifacts: DeploymentArtifacts,
    pub elapsed: Duration,
    /// Partial output kept on disk for inspection or a manual resume
    pub left_in_place: Vec<PathBuf>,
    pub history_path: Option<PathBuf>,
}

impl DeploymentReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.history.status() == DeploymentStatus::Completed
    }

    /// Human-readable summary on the console.
    pub fn print_summary(&self) {
        println!();
        for entry in self.history.entries() {
            let line = format!(
                "{}. {} ({:.1}s): {}",
                entry.phase.number(),
                entry.phase,
                entry.duration_ms as f64 / 1000.0,
                entry.message
            );
            match entry.outcome {
                crate::model::PhaseOutcome::Succeeded => success!("{line}"),
                crate::model::PhaseOutcome::Degraded => warn!("{line}"),
                crate::model::PhaseOutcome::Failed => error!("{line}"),
            }
        }

        if let Some(version) = &self.artifacts.version {
            println!("   Version: {} ({})", version.marketing, version.build);
        }
        if let Some(package) = &self.artifacts.package_path {
            println!("   Package: {}", package.display());
        }
        if let Some(digest) = &self.artifacts.package_sha256 {
            println!("   SHA-256: {digest}");
        }

        if let Some(failure) = &self.failure {
            println!();
            error!("{failure}");
            for hint in &failure.suggestions {
                println!("   Suggestion: {hint}");
            }
        }
        for path in &self.left_in_place {
            warn!("Left in place: {}", path.display());
        }
        if let Some(path) = &self.history_path {
            println!("   History: {}", path.display());
        }
        println!("   Elapsed: {:.1}s", self.elapsed.as_secs_f64());
    }
}
