//! Per-type certificate availability: detect, validate, import, create,
//! clean up.

use super::cleanup::{in_use_fingerprints, select_cleanup_strategy};
use super::detector::{Candidate, CandidateSource, CertificateDetector};
use super::importer::CertificateImporter;
use super::passwords::PasswordResolver;
use super::validator::{CertificateValidator, CheckKind, ValidationLevel};
use super::x509::build_pkcs12;
use crate::config::CertificateType;
use crate::context::ReleaseContext;
use crate::error::{CertificateErrorKind, ReleaseError, Result};
use crate::keychain::KeychainScope;
use crate::model::{Certificate, CertificateHealth};
use crate::profiles::load_profiles;
use crate::repository::{CertificateRepository, CreatedCertificate};
use crate::team_info::{CreatedCertificateRecord, TeamInfo};
use chrono::Utc;
use fs4::tokio::AsyncFileExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use zeroize::Zeroizing;

const CREDENTIALS_LOCK_FILE: &str = ".kodegen-release.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilitySource {
    /// Already in the run keychain
    Keychain,
    /// Imported from a P12 export in the credentials directory
    FileImport,
    /// Created through the authority during this run
    RemoteCreated,
}

#[derive(Debug, Clone)]
pub enum Availability {
    Available {
        certificate: Certificate,
        source: AvailabilitySource,
    },
    Unavailable {
        reason: String,
        suggestions: Vec<String>,
    },
}

impl Availability {
    fn unavailable(reason: impl Into<String>, suggestions: &[&str]) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn from_error(error: &ReleaseError) -> Self {
        Self::Unavailable {
            reason: error.to_string(),
            suggestions: error.suggestions(),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

/// Outcome of an availability check, one entry per requested type.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityReport {
    entries: BTreeMap<CertificateType, Availability>,
}

impl AvailabilityReport {
    pub fn insert(&mut self, cert_type: CertificateType, availability: Availability) {
        self.entries.insert(cert_type, availability);
    }

    #[must_use]
    pub fn get(&self, cert_type: CertificateType) -> Option<&Availability> {
        self.entries.get(&cert_type)
    }

    #[must_use]
    pub fn certificate(&self, cert_type: CertificateType) -> Option<&Certificate> {
        match self.entries.get(&cert_type)? {
            Availability::Available { certificate, .. } => Some(certificate),
            Availability::Unavailable { .. } => None,
        }
    }

    #[must_use]
    pub fn source(&self, cert_type: CertificateType) -> Option<AvailabilitySource> {
        match self.entries.get(&cert_type)? {
            Availability::Available { source, .. } => Some(*source),
            Availability::Unavailable { .. } => None,
        }
    }

    #[must_use]
    pub fn missing(&self) -> Vec<CertificateType> {
        self.entries
            .iter()
            .filter(|(_, a)| !a.is_available())
            .map(|(t, _)| *t)
            .collect()
    }

    #[must_use]
    pub fn all_available(&self) -> bool {
        self.entries.values().all(Availability::is_available)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CertificateType, &Availability)> {
        self.entries.iter()
    }
}

/// One row of the status inventory.
#[derive(Debug, Clone)]
pub struct InventoryEntry {
    pub certificate: Certificate,
    pub source: CandidateSource,
    pub health: CertificateHealth,
}

pub struct CertificateManager {
    ctx: ReleaseContext,
    keychain: KeychainScope,
    detector: CertificateDetector,
    validator: CertificateValidator,
    importer: CertificateImporter,
    recovery_attempted: Mutex<HashSet<CertificateType>>,
}

impl CertificateManager {
    /// Wire detector, validator and importer for `keychain`. The team
    /// descriptor's shared password, if one exists, joins the password
    /// candidates.
    pub async fn new(ctx: &ReleaseContext, keychain: KeychainScope) -> Result<Self> {
        let config = ctx.config();
        let credentials_dir = config.resolved_credentials_dir();

        let mut passwords = PasswordResolver::new(config.passwords.clone());
        if let Some(info) = TeamInfo::load(&credentials_dir).await? {
            passwords = passwords.with_team_password(info.import_password);
        }

        let mut detector = CertificateDetector::new(
            ctx.store(),
            keychain.clone(),
            credentials_dir,
            passwords.clone(),
            config.team_id.clone(),
        );
        if let Some(remote) = ctx.certificate_repository() {
            detector = detector.with_remote(remote);
        }

        Ok(Self {
            validator: CertificateValidator::new(ctx.store(), keychain.clone(), config.team_id.clone()),
            importer: CertificateImporter::new(ctx.store(), keychain.clone(), passwords),
            detector,
            keychain,
            ctx: ctx.clone(),
            recovery_attempted: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn detector(&self) -> &CertificateDetector {
        &self.detector
    }

    #[must_use]
    pub fn importer(&self) -> &CertificateImporter {
        &self.importer
    }

    #[must_use]
    pub fn validator(&self) -> &CertificateValidator {
        &self.validator
    }

    /// Availability per requested type. Never fails; failures become
    /// `Unavailable` entries with their recovery suggestions.
    pub async fn check_availability(&self, types: &[CertificateType]) -> AvailabilityReport {
        let mut report = AvailabilityReport::default();
        for &cert_type in types {
            let availability = match self.resolve_type(cert_type).await {
                Ok(availability) => availability,
                Err(e) => Availability::from_error(&e),
            };
            match &availability {
                Availability::Available { certificate, source } => tracing::info!(
                    team = %self.ctx.config().team_id,
                    cert_type = %cert_type,
                    certificate = certificate.name(),
                    source = ?source,
                    status = "available",
                    "certificate availability"
                ),
                Availability::Unavailable { reason, .. } => tracing::warn!(
                    team = %self.ctx.config().team_id,
                    cert_type = %cert_type,
                    reason = %reason,
                    status = "unavailable",
                    "certificate availability"
                ),
            }
            report.insert(cert_type, availability);
        }
        report
    }

    /// Like [`Self::check_availability`], but any missing type is an error
    /// carrying the full report.
    pub async fn ensure_available(&self, types: &[CertificateType]) -> Result<AvailabilityReport> {
        let report = self.check_availability(types).await;
        let missing = report.missing();
        if missing.is_empty() {
            Ok(report)
        } else {
            Err(ReleaseError::CertificatesUnavailable {
                missing,
                report: Box::new(report),
            })
        }
    }

    /// Every known certificate across all sources, with health.
    pub async fn inventory(&self) -> Vec<InventoryEntry> {
        let now = Utc::now();
        let mut entries = Vec::new();
        for cert_type in CertificateType::ALL {
            for candidate in self.detector.detect(cert_type).await {
                entries.push(InventoryEntry {
                    health: candidate.certificate.health_at(now),
                    certificate: candidate.certificate,
                    source: candidate.source,
                });
            }
        }
        entries
    }

    async fn resolve_type(&self, cert_type: CertificateType) -> Result<Availability> {
        let Some(best) = self.detector.get_best_certificate(cert_type).await else {
            return self.create(cert_type, "not found").await;
        };

        let report = self.validator.validate(&best, ValidationLevel::Standard).await;
        for warning in report.warnings() {
            warn!("{}", warning.message);
        }

        if report.is_valid() {
            return match best.source {
                CandidateSource::Store => Ok(Availability::Available {
                    certificate: best.certificate,
                    source: AvailabilitySource::Keychain,
                }),
                CandidateSource::File => self.import_file_candidate(&best).await,
                CandidateSource::Remote => {
                    let reason = format!(
                        "{} exists remotely but its private key is not available locally",
                        best.certificate.name()
                    );
                    self.create(cert_type, &reason).await
                }
            };
        }

        if report.failed(CheckKind::TeamOwnership) {
            tracing::error!(
                team = %self.ctx.config().team_id,
                cert_type = %cert_type,
                certificate = best.certificate.name(),
                "certificate belongs to another team"
            );
            return Ok(Availability::unavailable(
                report.failure_summary(),
                &[
                    "Check that the certificate belongs to the expected team",
                    "Remove the other team's export from the credentials directory",
                ],
            ));
        }

        if report.failed(CheckKind::Expiration) {
            return self.create(cert_type, &report.failure_summary()).await;
        }

        Ok(Availability::unavailable(
            report.failure_summary(),
            &["Re-export the P12 with the current password"],
        ))
    }

    /// Import, then confirm at comprehensive level. A keychain access
    /// failure gets one re-import.
    async fn import_file_candidate(&self, candidate: &Candidate) -> Result<Availability> {
        let cert_type = candidate.certificate.cert_type();
        self.import_candidate(candidate).await?;

        let report = self
            .validator
            .validate(candidate, ValidationLevel::Comprehensive)
            .await;
        if report.is_valid() {
            return Ok(Availability::Available {
                certificate: candidate.certificate.clone(),
                source: AvailabilitySource::FileImport,
            });
        }

        let access_failed =
            report.failed(CheckKind::StoreAccessibility) || report.failed(CheckKind::SigningCapability);
        if access_failed && self.begin_recovery(cert_type) {
            tracing::warn!(
                cert_type = %cert_type,
                reason = %report.failure_summary(),
                "keychain access failed after import, re-importing"
            );
            self.import_candidate(candidate).await?;
            let retry = self
                .validator
                .validate(candidate, ValidationLevel::Comprehensive)
                .await;
            if retry.is_valid() {
                return Ok(Availability::Available {
                    certificate: candidate.certificate.clone(),
                    source: AvailabilitySource::FileImport,
                });
            }
            return Ok(Availability::unavailable(
                retry.failure_summary(),
                &["Grant codesign access to the key (set-key-partition-list)"],
            ));
        }

        Ok(Availability::unavailable(
            report.failure_summary(),
            &["Re-export the P12 with the current password"],
        ))
    }

    async fn import_candidate(&self, candidate: &Candidate) -> Result<()> {
        let path = candidate.path.as_deref().ok_or_else(|| {
            ReleaseError::certificate(CertificateErrorKind::NotFound, "File candidate has no path")
        })?;
        let password = candidate.password.as_deref().map(String::as_str);
        let result = self
            .importer
            .import(path, password, Some(candidate.certificate.cert_type()))
            .await;
        self.detector.invalidate();
        result.map(|_| ())
    }

    /// Recovery for one type runs at most once per run.
    fn begin_recovery(&self, cert_type: CertificateType) -> bool {
        match self.recovery_attempted.lock() {
            Ok(mut attempted) => attempted.insert(cert_type),
            Err(poisoned) => poisoned.into_inner().insert(cert_type),
        }
    }

    /// Creation path: quota check, cleanup if at quota, create, export,
    /// import.
    async fn create(&self, cert_type: CertificateType, reason: &str) -> Result<Availability> {
        let Some(remote) = self.ctx.certificates() else {
            return Ok(Availability::unavailable(
                format!("{reason}, no creation path without remote credentials"),
                &[
                    "Place an exported .p12 for this certificate type in the credentials directory",
                    "Configure App Store Connect API credentials so a certificate can be created",
                ],
            ));
        };
        if !self.begin_recovery(cert_type) {
            return Ok(Availability::unavailable(
                format!("{reason}; recovery was already attempted for {cert_type} in this run"),
                &["Rerun after resolving the earlier certificate error"],
            ));
        }

        let team_id = self.ctx.config().team_id.clone();
        self.free_quota(remote, &team_id, cert_type).await?;

        let created = remote.create_certificate(&team_id, cert_type).await?;
        tracing::info!(
            team = %team_id,
            cert_type = %cert_type,
            certificate = created.certificate.id(),
            expires_at = %created.certificate.expires_at(),
            status = "created",
            "certificate created"
        );
        success!("Created {} certificate {}", cert_type, created.certificate.name());

        let (path, password) = self.write_export(&team_id, &created).await?;
        self.detector.invalidate();

        let imported = self
            .importer
            .import(&path, Some(password.as_str()), Some(cert_type))
            .await;
        self.detector.invalidate();
        let imported = imported?;

        Ok(Availability::Available {
            certificate: imported.certificate.with_id(created.certificate.id()),
            source: AvailabilitySource::RemoteCreated,
        })
    }

    async fn free_quota(
        &self,
        remote: &dyn CertificateRepository,
        team_id: &str,
        cert_type: CertificateType,
    ) -> Result<()> {
        let existing = remote.list_certificates(team_id, cert_type).await?;
        if existing.len() < cert_type.quota() {
            return Ok(());
        }

        let protected = if self.ctx.config().protect_in_use_certificates {
            self.in_use().await
        } else {
            HashSet::new()
        };
        let strategy = select_cleanup_strategy(&existing, &protected, Utc::now())?;

        for target in strategy.targets() {
            remote.revoke_certificate(target.id()).await?;
            tracing::info!(
                team = team_id,
                cert_type = %cert_type,
                strategy = strategy.name(),
                certificate = target.id(),
                expires_at = %target.expires_at(),
                status = "revoked",
                "certificate cleanup"
            );
            warn!("Revoked {} ({})", target.name(), strategy.name());

            if let Err(e) = self
                .ctx
                .store()
                .delete(target.thumbprint(), &self.keychain.name)
                .await
            {
                tracing::debug!(certificate = target.id(), error = %e, "revoked certificate not in keychain");
            }
        }
        self.detector.invalidate();
        Ok(())
    }

    /// Fingerprints embedded in still-valid profiles known locally or
    /// remotely.
    async fn in_use(&self) -> HashSet<String> {
        let config = self.ctx.config();
        let mut profiles = load_profiles(&config.resolved_credentials_dir())
            .await
            .unwrap_or_default();
        if let Some(remote) = self.ctx.profiles() {
            match remote
                .list_profiles(&config.app_identifier, &config.team_id)
                .await
            {
                Ok(listed) => profiles.extend(listed.into_iter().map(|p| p.profile)),
                Err(e) => tracing::warn!(error = %e, "profile listing failed during cleanup"),
            }
        }
        in_use_fingerprints(&profiles, Utc::now())
    }

    /// Pack the created certificate with the team password and write it
    /// into the credentials directory under an exclusive lock.
    async fn write_export(
        &self,
        team_id: &str,
        created: &CreatedCertificate,
    ) -> Result<(PathBuf, Zeroizing<String>)> {
        let dir = self.ctx.config().resolved_credentials_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let lock_file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(CREDENTIALS_LOCK_FILE))
            .await?;
        lock_file.lock_exclusive().map_err(|e| {
            ReleaseError::store(
                crate::error::StoreErrorKind::Locked,
                format!("Failed to lock credentials directory: {e}"),
            )
        })?;

        let mut info = TeamInfo::load_or_create(&dir, team_id).await?;
        let password = Zeroizing::new(info.import_password.clone());
        let p12 = build_pkcs12(
            &created.certificate_der,
            &created.private_key_der,
            &password,
            created.certificate.name(),
        )?;

        let cert_type = created.certificate.cert_type();
        let file_name = format!("{}_{}.p12", cert_type.as_str(), created.certificate.id());
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &p12).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info.record(CreatedCertificateRecord {
            cert_type,
            authority_id: created.certificate.id().to_string(),
            file_name,
            fingerprint: created.certificate.thumbprint().to_string(),
            expires_at: created.certificate.expires_at(),
        });
        info.save(&dir).await?;

        // Lock released when lock_file drops
        Ok((path, password))
    }
}
