//! Read-only status query

use crate::certificates::{CertificateManager, InventoryEntry};
use crate::context::ReleaseContext;
use crate::error::Result;
use crate::keychain::KeychainScope;
use crate::model::{ApiCredentials, CertificateHealth, DeploymentHistory, ProvisioningProfile};
use crate::profiles::load_profiles;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Keychain the status query reads from. Listing only, never modified.
pub const STATUS_KEYCHAIN: &str = "login.keychain-db";

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub team_id: String,
    pub app_identifier: String,
    pub certificates: Vec<InventoryEntry>,
    pub profiles: Vec<ProvisioningProfile>,
    pub api_credentials: Option<ApiCredentials>,
    pub last_deployment: Option<DeploymentHistory>,
    pub generated_at: DateTime<Utc>,
}

impl StatusReport {
    pub async fn collect(ctx: &ReleaseContext) -> Result<Self> {
        let config = ctx.config();
        let manager = CertificateManager::new(ctx, KeychainScope::new(STATUS_KEYCHAIN, "")).await?;
        let certificates = manager.inventory().await;

        let mut profiles: Vec<ProvisioningProfile> =
            load_profiles(&config.resolved_credentials_dir())
                .await?
                .into_iter()
                .filter(|p| p.team_id() == config.team_id)
                .filter(|p| p.matches_app_identifier(&config.app_identifier))
                .collect();
        profiles.sort_by_key(ProvisioningProfile::expires_at);

        let api_credentials = match &config.api_key {
            Some(key) => match ApiCredentials::api_key(
                &config.team_id,
                &key.key_id,
                &key.issuer_id,
                &key.private_key_path,
            )
            .await
            {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!("API key configured but invalid: {}", e);
                    None
                }
            },
            None => None,
        };

        let last_deployment = latest_history(&config.resolved_output_dir().join("history")).await;

        Ok(Self {
            team_id: config.team_id.clone(),
            app_identifier: config.app_identifier.clone(),
            certificates,
            profiles,
            api_credentials,
            last_deployment,
            generated_at: Utc::now(),
        })
    }

    pub fn print(&self) {
        let now = self.generated_at;
        println!("Team {} / {}", self.team_id, self.app_identifier);

        println!("\nCertificates:");
        if self.certificates.is_empty() {
            println!("   (none)");
        }
        for entry in &self.certificates {
            let line = format!(
                "{} [{}] {} days left ({})",
                entry.certificate.name(),
                entry.certificate.cert_type(),
                entry.certificate.days_until_expiration(now),
                entry.source.as_str()
            );
            match entry.health {
                CertificateHealth::Healthy => success!("{line}"),
                CertificateHealth::ExpiringSoon => warn!("{line}"),
                CertificateHealth::Expired => error!("{line}"),
            }
        }

        println!("\nProvisioning profiles:");
        if self.profiles.is_empty() {
            println!("   (none)");
        }
        for profile in &self.profiles {
            let line = format!(
                "{} ({}) {} expires {}",
                profile.name(),
                profile.identifier_pattern(),
                profile.profile_type().export_method(),
                profile.expires_at().format("%Y-%m-%d")
            );
            if profile.is_expired_at(now) {
                error!("{line}");
            } else {
                success!("{line}");
            }
        }

        println!("\nAPI key:");
        match &self.api_credentials {
            Some(credentials) if credentials.needs_rotation_at(now) => warn!(
                "{} due for rotation since {}",
                credentials.credential_id(),
                credentials.rotation_due_at().format("%Y-%m-%d")
            ),
            Some(credentials) => success!(
                "{} ({} days until rotation)",
                credentials.credential_id(),
                credentials.days_until_rotation(now)
            ),
            None => println!("   not configured"),
        }

        if let Some(history) = &self.last_deployment {
            println!(
                "\nLast deployment: {} {:?} at {} ({} phases)",
                history.deployment_id(),
                history.status(),
                history.started_at().format("%Y-%m-%d %H:%M"),
                history.entries().len()
            );
        }
    }
}

/// Most recently started deployment in `dir`. Unreadable files are skipped.
pub async fn latest_history(dir: &Path) -> Option<DeploymentHistory> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut latest: Option<DeploymentHistory> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "json") {
            continue;
        }
        let Ok(history) = DeploymentHistory::load(&path).await else {
            tracing::debug!(path = %path.display(), "skipping unreadable history file");
            continue;
        };
        if latest
            .as_ref()
            .is_none_or(|l| history.started_at() > l.started_at())
        {
            latest = Some(history);
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn picks_most_recent_history() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeploymentHistory::new("ABCDE12345", "com.acme.app");
        first.persist(dir.path()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = DeploymentHistory::new("ABCDE12345", "com.acme.app");
        second.persist(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("junk.json"), "{").await.unwrap();

        let latest = latest_history(dir.path()).await.unwrap();
        assert_eq!(latest.deployment_id(), second.deployment_id());
    }

    #[tokio::test]
    async fn missing_directory_has_no_history() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_history(&dir.path().join("absent")).await.is_none());
    }
}
