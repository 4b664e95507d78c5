//! Append-only audit trail of one deployment attempt

use crate::error::{ReleaseError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
}

impl DeploymentStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The six pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    CertificateValidation,
    ProfileValidation,
    VersionManagement,
    BuildArchive,
    Upload,
    ProcessingMonitor,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Self::CertificateValidation,
        Self::ProfileValidation,
        Self::VersionManagement,
        Self::BuildArchive,
        Self::Upload,
        Self::ProcessingMonitor,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CertificateValidation => "certificate_validation",
            Self::ProfileValidation => "profile_validation",
            Self::VersionManagement => "version_management",
            Self::BuildArchive => "build_archive",
            Self::Upload => "upload",
            Self::ProcessingMonitor => "processing_monitor",
        }
    }

    /// 1-based position in the pipeline
    #[must_use]
    pub fn number(&self) -> usize {
        *self as usize + 1
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Succeeded,
    Failed,
    /// Completed without confirmation (e.g. processing wait timed out)
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistory {
    deployment_id: Uuid,
    team_id: String,
    app_identifier: String,
    status: DeploymentStatus,
    entries: Vec<HistoryEntry>,
    metadata: BTreeMap<String, String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl DeploymentHistory {
    pub fn new(team_id: impl Into<String>, app_identifier: impl Into<String>) -> Self {
        Self {
            deployment_id: Uuid::new_v4(),
            team_id: team_id.into(),
            app_identifier: app_identifier.into(),
            status: DeploymentStatus::Initiated,
            entries: Vec::new(),
            metadata: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ReleaseError::Validation(format!(
                "Deployment {} is already {:?}; history is closed",
                self.deployment_id, self.status
            )));
        }
        Ok(())
    }

    /// Initiated → InProgress. Resets the start timestamp.
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.status == DeploymentStatus::Initiated {
            self.status = DeploymentStatus::InProgress;
            self.started_at = Utc::now();
        }
        Ok(())
    }

    /// Append one phase entry. Entries keep insertion order.
    pub fn record(
        &mut self,
        phase: Phase,
        outcome: PhaseOutcome,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.status == DeploymentStatus::Initiated {
            self.status = DeploymentStatus::InProgress;
        }
        self.entries.push(HistoryEntry {
            phase,
            outcome,
            message: message.into(),
            recorded_at: Utc::now(),
            duration_ms,
        });
        Ok(())
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.metadata.insert(key.into(), value.into());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.status = DeploymentStatus::Completed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.metadata.insert("failure_reason".to_string(), reason.into());
        self.status = DeploymentStatus::Failed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    #[must_use]
    pub fn deployment_id(&self) -> Uuid {
        self.deployment_id
    }

    #[must_use]
    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    #[must_use]
    pub fn app_identifier(&self) -> &str {
        &self.app_identifier
    }

    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    #[must_use]
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Write as pretty JSON to `<dir>/<deployment-id>.json`.
    pub async fn persist(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", self.deployment_id));
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_closes_history() {
        let mut history = DeploymentHistory::new("ABCDE12345", "com.company.widget");
        history.begin().unwrap();
        history
            .record(Phase::CertificateValidation, PhaseOutcome::Succeeded, "ok", 5)
            .unwrap();
        history.complete().unwrap();

        assert!(history.record(Phase::ProfileValidation, PhaseOutcome::Succeeded, "late", 1).is_err());
        assert!(history.fail("late").is_err());
        assert!(history.set_metadata("k", "v").is_err());
        assert_eq!(history.status(), DeploymentStatus::Completed);
        assert_eq!(history.entries().len(), 1);
    }

    #[test]
    fn failure_records_reason() {
        let mut history = DeploymentHistory::new("ABCDE12345", "com.company.widget");
        history.fail("no certificate").unwrap();
        assert_eq!(history.status(), DeploymentStatus::Failed);
        assert_eq!(
            history.metadata().get("failure_reason").map(String::as_str),
            Some("no certificate")
        );
        assert!(history.finished_at().is_some());
        assert!(history.complete().is_err());
    }

    #[test]
    fn phases_are_numbered_in_order() {
        let numbers: Vec<usize> = Phase::ALL.iter().map(Phase::number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut history = DeploymentHistory::new("ABCDE12345", "com.company.widget");
        history
            .record(Phase::CertificateValidation, PhaseOutcome::Failed, "missing", 3)
            .unwrap();
        history.fail("missing").unwrap();

        let path = history.persist(dir.path()).await.unwrap();
        let loaded = DeploymentHistory::load(&path).await.unwrap();
        assert_eq!(loaded.deployment_id(), history.deployment_id());
        assert_eq!(loaded.entries(), history.entries());
        assert_eq!(loaded.status(), DeploymentStatus::Failed);
    }
}
