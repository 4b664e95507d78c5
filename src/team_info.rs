//! `team_info.toml`: shared import password and created-certificate log
//!
//! Lives in the credentials directory next to the P12 exports so another
//! machine (or teammate) can import them.

use crate::config::CertificateType;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TEAM_INFO_FILE: &str = "team_info.toml";

const PASSWORD_LENGTH: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedCertificateRecord {
    pub cert_type: CertificateType,
    pub authority_id: String,
    pub file_name: String,
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamInfo {
    pub team_id: String,
    /// Password protecting every P12 this tool writes for the team
    pub import_password: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub certificates: Vec<CreatedCertificateRecord>,
}

impl TeamInfo {
    #[must_use]
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            import_password: Alphanumeric.sample_string(&mut rand::rng(), PASSWORD_LENGTH),
            created_at: Utc::now(),
            certificates: Vec::new(),
        }
    }

    #[must_use]
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(TEAM_INFO_FILE)
    }

    /// Read the descriptor, `None` if the directory has none yet.
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(Some(toml::from_str(&content)?))
    }

    pub async fn load_or_create(dir: &Path, team_id: &str) -> Result<Self> {
        match Self::load(dir).await? {
            Some(info) => Ok(info),
            None => {
                let info = Self::new(team_id);
                info.save(dir).await?;
                tracing::info!(team = team_id, "team info descriptor created");
                Ok(info)
            }
        }
    }

    /// Write the descriptor, owner-readable only.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = Self::path_in(dir);
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    pub fn record(&mut self, record: CreatedCertificateRecord) {
        self.certificates
            .retain(|existing| existing.authority_id != record.authority_id);
        self.certificates.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_or_create_keeps_the_first_password() {
        let dir = tempfile::tempdir().unwrap();
        let first = TeamInfo::load_or_create(dir.path(), "ABCDE12345").await.unwrap();
        let second = TeamInfo::load_or_create(dir.path(), "ABCDE12345").await.unwrap();
        assert_eq!(first.import_password, second.import_password);
        assert_eq!(first.import_password.len(), PASSWORD_LENGTH);
    }

    #[tokio::test]
    async fn records_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = TeamInfo::new("ABCDE12345");
        info.record(CreatedCertificateRecord {
            cert_type: CertificateType::Distribution,
            authority_id: "CERT1".into(),
            file_name: "distribution_CERT1.p12".into(),
            fingerprint: "AB".into(),
            expires_at: Utc::now(),
        });
        info.save(dir.path()).await.unwrap();

        let loaded = TeamInfo::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.certificates, info.certificates);
    }
}
