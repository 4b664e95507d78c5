//! Six-phase deployment pipeline
//!
//! Phases run strictly in order; the first failure stops the run. Every
//! phase that starts appends exactly one history entry. The per-run
//! keychain is torn down on every exit path.

use super::report::{DeploymentArtifacts, DeploymentReport, PhaseFailure};
use crate::certificates::{AvailabilityReport, CertificateManager};
use crate::cleanup_path;
use crate::config::CertificateType;
use crate::context::ReleaseContext;
use crate::error::{ReleaseError, Result, UploadErrorKind};
use crate::keychain::EphemeralKeychain;
use crate::model::{
    Certificate, DeploymentHistory, Phase, PhaseOutcome, ProvisioningProfile, VersionInfo,
};
use crate::profiles::ProfileMatcher;
use crate::repository::{BuildStatus, ExportOptions, SigningConfig, UploadOptions};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// All six phases
    #[default]
    Full,
    /// Certificate and profile validation only
    ValidateOnly,
}

const VALIDATION_PHASES: [Phase; 2] = [Phase::CertificateValidation, Phase::ProfileValidation];

/// Read size when hashing exported packages
const DIGEST_CHUNK: usize = 8 * 1024;

impl RunMode {
    fn phases(self) -> &'static [Phase] {
        match self {
            Self::Full => &Phase::ALL,
            Self::ValidateOnly => &VALIDATION_PHASES,
        }
    }
}

/// Result of a phase body: a value plus the history message.
struct Completed<T> {
    value: T,
    message: String,
    outcome: PhaseOutcome,
}

impl<T> Completed<T> {
    fn ok(value: T, message: impl Into<String>) -> Self {
        Self {
            value,
            message: message.into(),
            outcome: PhaseOutcome::Succeeded,
        }
    }

    fn degraded(value: T, message: impl Into<String>) -> Self {
        Self {
            value,
            message: message.into(),
            outcome: PhaseOutcome::Degraded,
        }
    }

    fn into_parts(self) -> (String, PhaseOutcome, T) {
        (self.message, self.outcome, self.value)
    }
}

/// Signing material chosen in phases 1 and 2.
#[derive(Debug, Clone)]
struct Signing {
    certificate: Certificate,
    profile: ProvisioningProfile,
}

/// Mutable state of one run. Never shared across runs.
struct Run {
    history: DeploymentHistory,
    artifacts: DeploymentArtifacts,
    left_in_place: Vec<PathBuf>,
    failure: Option<PhaseFailure>,
    certificates: Option<AvailabilityReport>,
    signing: BTreeMap<CertificateType, Signing>,
}

pub struct DeploymentOrchestrator {
    ctx: ReleaseContext,
}

impl DeploymentOrchestrator {
    #[must_use]
    pub fn new(ctx: ReleaseContext) -> Self {
        Self { ctx }
    }

    /// Run the pipeline. Phase failures are reported in the returned
    /// [`DeploymentReport`], not as `Err`.
    pub async fn run(&self, mode: RunMode) -> DeploymentReport {
        let config = self.ctx.config();
        let started = Instant::now();
        let mut run = Run {
            history: DeploymentHistory::new(&config.team_id, &config.app_identifier),
            artifacts: DeploymentArtifacts::default(),
            left_in_place: Vec::new(),
            failure: None,
            certificates: None,
            signing: BTreeMap::new(),
        };
        if let Err(e) = run.history.begin() {
            tracing::error!(error = %e, "history could not be opened");
        }

        tracing::info!(
            deployment = %run.history.deployment_id(),
            team = %config.team_id,
            app = %config.app_identifier,
            mode = ?mode,
            "deployment started"
        );

        // The keychain is part of phase 1: a failure to create it fails
        // certificate validation.
        let created = EphemeralKeychain::create(self.ctx.store(), self.ctx.intermediates()).await;
        let keychain = match created {
            Ok(keychain) => Some(keychain),
            Err(e) => {
                self.record_failure(&mut run, Phase::CertificateValidation, &e, started);
                None
            }
        };

        if let Some(keychain) = &keychain {
            for &phase in mode.phases() {
                step!("Phase {}/{}: {}", phase.number(), Phase::ALL.len(), phase);
                let phase_started = Instant::now();
                let result = self.run_phase(phase, keychain, &mut run).await;
                match result {
                    Ok((message, outcome)) => {
                        self.record(&mut run, phase, outcome, &message, phase_started);
                    }
                    Err(e) => {
                        self.record_failure(&mut run, phase, &e, phase_started);
                        break;
                    }
                }
            }
        }

        if let Some(keychain) = keychain {
            keychain.teardown().await;
        }

        let closed = match &run.failure {
            None => run.history.complete(),
            Some(failure) => run
                .history
                .fail(format!("{}: {}", failure.phase, failure.message)),
        };
        if let Err(e) = closed {
            tracing::error!(error = %e, "history could not be closed");
        }

        let history_dir = config.resolved_output_dir().join("history");
        let history_path = match run.history.persist(&history_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Failed to write deployment history: {}", e);
                tracing::warn!(dir = %history_dir.display(), error = %e, "history not persisted");
                None
            }
        };

        tracing::info!(
            deployment = %run.history.deployment_id(),
            status = ?run.history.status(),
            phases = run.history.entries().len(),
            "deployment finished"
        );

        DeploymentReport {
            history: run.history,
            failure: run.failure,
            artifacts: run.artifacts,
            elapsed: started.elapsed(),
            left_in_place: run.left_in_place,
            history_path,
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        keychain: &EphemeralKeychain,
        run: &mut Run,
    ) -> Result<(String, PhaseOutcome)> {
        match phase {
            Phase::CertificateValidation => {
                let (message, outcome, report) = self.validate_certificates(keychain).await?.into_parts();
                run.certificates = Some(report);
                Ok((message, outcome))
            }
            Phase::ProfileValidation => {
                let report = run.certificates.as_ref().ok_or_else(|| {
                    ReleaseError::Validation("Certificate validation has not run".to_string())
                })?;
                let (message, outcome, signing) = self.validate_profiles(report).await?.into_parts();
                run.signing = signing;
                Ok((message, outcome))
            }
            Phase::VersionManagement => {
                let (message, outcome, (previous, next)) = self.manage_version().await?.into_parts();
                run.artifacts.previous_version = Some(previous);
                run.artifacts.version = Some(next);
                // Bumped version is kept even if a later phase fails
                let _ = run.history.set_metadata("marketing_version", next.marketing.to_string());
                let _ = run.history.set_metadata("build_number", next.build.to_string());
                Ok((message, outcome))
            }
            Phase::BuildArchive => self.build(keychain, run).await,
            Phase::Upload => {
                let (message, outcome, delivery_id) = self.upload(run).await?.into_parts();
                if let Some(id) = &delivery_id {
                    let _ = run.history.set_metadata("delivery_id", id.clone());
                }
                run.artifacts.delivery_id = delivery_id;
                Ok((message, outcome))
            }
            Phase::ProcessingMonitor => {
                let (message, outcome, status) = self.monitor_processing(run).await?.into_parts();
                run.artifacts.processing = status;
                Ok((message, outcome))
            }
        }
    }

    async fn validate_certificates(
        &self,
        keychain: &EphemeralKeychain,
    ) -> Result<Completed<AvailabilityReport>> {
        let config = self.ctx.config();
        let manager = CertificateManager::new(&self.ctx, keychain.scope()).await?;
        let report = manager.ensure_available(&config.required_types).await?;
        keychain.refresh_access().await?;

        let summary = report
            .iter()
            .filter_map(|(cert_type, _)| {
                let certificate = report.certificate(*cert_type)?;
                let source = report.source(*cert_type)?;
                Some(format!("{cert_type}: {} ({source:?})", certificate.name()))
            })
            .collect::<Vec<_>>()
            .join("; ");
        Ok(Completed::ok(report, summary))
    }

    async fn validate_profiles(
        &self,
        report: &AvailabilityReport,
    ) -> Result<Completed<BTreeMap<CertificateType, Signing>>> {
        let config = self.ctx.config();
        let matcher = ProfileMatcher::new(self.ctx.clone());

        let mut signing = BTreeMap::new();
        for &cert_type in &config.required_types {
            let certificate = report.certificate(cert_type).cloned().ok_or_else(|| {
                ReleaseError::Validation(format!("No {cert_type} certificate from phase 1"))
            })?;
            let profile = matcher
                .ensure_profile(&config.app_identifier, &certificate, &config.team_id)
                .await?;
            signing.insert(cert_type, Signing { certificate, profile });
        }

        let summary = signing
            .iter()
            .map(|(t, s)| format!("{t}: {} ({})", s.profile.name(), s.profile.uuid()))
            .collect::<Vec<_>>()
            .join("; ");
        Ok(Completed::ok(signing, summary))
    }

    async fn manage_version(&self) -> Result<Completed<(VersionInfo, VersionInfo)>> {
        let config = self.ctx.config();
        let project = &config.project_path;
        let builds = self.ctx.builds();

        let current = builds.read_version(project).await?;
        let next = current.next(config.bump)?;
        builds.write_version(project, &next).await?;

        let persisted = builds.read_version(project).await?;
        if persisted != next {
            return Err(ReleaseError::Validation(format!(
                "Version did not persist: wrote {} ({}), read back {} ({})",
                next.marketing, next.build, persisted.marketing, persisted.build
            )));
        }

        let message = format!(
            "{} ({}) -> {} ({})",
            current.marketing, current.build, next.marketing, next.build
        );
        Ok(Completed::ok((current, next), message))
    }

    /// Distribution signing when required, development otherwise.
    fn release_signing(run: &Run) -> Result<&Signing> {
        run.signing
            .get(&CertificateType::Distribution)
            .or_else(|| run.signing.get(&CertificateType::Development))
            .ok_or_else(|| {
                ReleaseError::Validation("No signing material from profile validation".to_string())
            })
    }

    async fn build(
        &self,
        keychain: &EphemeralKeychain,
        run: &mut Run,
    ) -> Result<(String, PhaseOutcome)> {
        let config = self.ctx.config();
        let signing = Self::release_signing(run)?.clone();
        let output_dir = config.resolved_output_dir();
        let archive_path = output_dir.join(format!("{}.xcarchive", config.scheme));
        let export_dir = output_dir.join("export");

        cleanup_path(&archive_path, "previous archive").await;
        cleanup_path(&export_dir, "previous export").await;

        let signing_config = SigningConfig {
            team_id: config.team_id.clone(),
            identity: signing.certificate.name().to_string(),
            profile_name: signing.profile.name().to_string(),
            profile_uuid: signing.profile.uuid().to_string(),
            profile_path: signing.profile.path().map(Path::to_path_buf),
            keychain: Some(keychain.name().to_string()),
        };

        let archive = self
            .ctx
            .builds()
            .archive(
                &config.project_path,
                &config.scheme,
                &config.configuration,
                &archive_path,
                &signing_config,
            )
            .await;
        let archive = match archive {
            Ok(archive) => archive,
            Err(e) => {
                Self::keep_if_present(run, &archive_path);
                return Err(e);
            }
        };
        if !archive.success {
            Self::keep_if_present(run, &archive.archive_path);
            Self::keep_if_present(run, &archive.archive_path.with_extension("log"));
            return Err(ReleaseError::Build(format!(
                "archive of scheme '{}' failed:\n{}",
                config.scheme,
                tail(&archive.logs, 20)
            )));
        }
        run.artifacts.archive_path = Some(archive.archive_path.clone());

        let options = ExportOptions {
            method: signing.profile.profile_type().export_method().to_string(),
            team_id: config.team_id.clone(),
            signing_certificate: signing.certificate.name().to_string(),
            provisioning_profiles: BTreeMap::from([(
                config.app_identifier.clone(),
                signing.profile.name().to_string(),
            )]),
            upload_symbols: true,
        };
        let export = self
            .ctx
            .builds()
            .export_package(&archive.archive_path, &options, &export_dir)
            .await;
        let export = match export {
            Ok(export) => export,
            Err(e) => {
                Self::keep_if_present(run, &archive.archive_path);
                return Err(e);
            }
        };
        let Some(package_path) = export.package_path.filter(|_| export.success) else {
            Self::keep_if_present(run, &archive.archive_path);
            Self::keep_if_present(run, &export_dir);
            return Err(ReleaseError::Build(format!(
                "export failed:\n{}",
                tail(&export.logs, 20)
            )));
        };

        let digest = package_digest(&package_path).await?;
        let _ = run.history.set_metadata("package_sha256", digest.clone());
        let _ = run
            .history
            .set_metadata("package_path", package_path.display().to_string());
        tracing::info!(
            package = %package_path.display(),
            sha256 = %digest,
            "package exported"
        );

        let message = format!("{} signed with {}", package_path.display(), signing.certificate.name());
        run.artifacts.package_path = Some(package_path);
        run.artifacts.package_sha256 = Some(digest);
        Ok((message, PhaseOutcome::Succeeded))
    }

    async fn upload(&self, run: &mut Run) -> Result<Completed<Option<String>>> {
        let config = self.ctx.config();
        let uploads = self.ctx.uploads().ok_or_else(|| {
            ReleaseError::Validation(
                "Uploading requires App Store Connect API credentials".to_string(),
            )
        })?;
        let package = run.artifacts.package_path.clone().ok_or_else(|| {
            ReleaseError::Validation("No exported package to upload".to_string())
        })?;
        let version = run.artifacts.version.ok_or_else(|| {
            ReleaseError::Validation("No version recorded for upload".to_string())
        })?;

        let options = UploadOptions {
            app_identifier: config.app_identifier.clone(),
            marketing_version: version.marketing.to_string(),
            build_number: version.build.to_string(),
        };
        let receipt = match uploads.upload_build(&package, &options).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // The package can be uploaded by hand
                Self::keep_if_present(run, &package);
                return Err(e);
            }
        };

        let message = match &receipt.delivery_id {
            Some(id) => format!("build {} accepted (delivery {id})", version.build),
            None => format!("build {} accepted", version.build),
        };
        Ok(Completed::ok(receipt.delivery_id, message))
    }

    /// Poll until ready. Running out of time degrades the phase instead of
    /// failing it; the upload itself already succeeded.
    async fn monitor_processing(&self, run: &Run) -> Result<Completed<Option<BuildStatus>>> {
        let config = self.ctx.config();
        if !config.monitor_processing {
            return Ok(Completed::ok(None, "skipped (monitoring disabled)"));
        }
        let uploads = self.ctx.uploads().ok_or_else(|| {
            ReleaseError::Validation("Monitoring requires App Store Connect API credentials".to_string())
        })?;
        let build_number = run
            .artifacts
            .version
            .map(|v| v.build.to_string())
            .ok_or_else(|| ReleaseError::Validation("No build number to monitor".to_string()))?;

        let deadline = Instant::now() + config.timeouts.processing();
        let mut last = BuildStatus::NotFound;
        loop {
            match uploads
                .get_build_status(&config.app_identifier, &build_number)
                .await
            {
                Ok(BuildStatus::Ready) => {
                    return Ok(Completed::ok(
                        Some(BuildStatus::Ready),
                        format!("build {build_number} ready for testing"),
                    ));
                }
                Ok(BuildStatus::Invalid(state)) => {
                    return Err(ReleaseError::upload(
                        UploadErrorKind::Rejected,
                        format!("build {build_number} failed processing ({state})"),
                    ));
                }
                Ok(status) => last = status,
                Err(e) => {
                    tracing::warn!(build = %build_number, error = %e, "processing status query failed");
                }
            }

            if Instant::now() + config.timeouts.processing_poll() > deadline {
                break;
            }
            tokio::time::sleep(config.timeouts.processing_poll()).await;
        }

        Ok(Completed::degraded(
            Some(last),
            format!(
                "build {build_number} uploaded but unconfirmed after {}s",
                config.timeouts.processing().as_secs()
            ),
        ))
    }

    fn record(
        &self,
        run: &mut Run,
        phase: Phase,
        outcome: PhaseOutcome,
        message: &str,
        started: Instant,
    ) {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = run.history.record(phase, outcome, message, duration_ms) {
            tracing::error!(phase = %phase, error = %e, "history entry dropped");
        }
        tracing::info!(
            deployment = %run.history.deployment_id(),
            phase = %phase,
            outcome = ?outcome,
            duration_ms,
            "{message}"
        );
        match outcome {
            PhaseOutcome::Succeeded => success!("{}: {}", phase, message),
            PhaseOutcome::Degraded => warn!("{}: {}", phase, message),
            PhaseOutcome::Failed => error!("{}: {}", phase, message),
        }
    }

    fn record_failure(&self, run: &mut Run, phase: Phase, error: &ReleaseError, started: Instant) {
        let config = self.ctx.config();
        let failure = PhaseFailure::from_error(phase, &config.team_id, &config.app_identifier, error);
        self.record(run, phase, PhaseOutcome::Failed, &failure.message, started);
        tracing::error!(
            team = %config.team_id,
            app = %config.app_identifier,
            phase = %phase,
            category = %failure.category,
            "deployment phase failed"
        );
        run.failure = Some(failure);
    }

    fn keep_if_present(run: &mut Run, path: &Path) {
        if path.exists() && !run.left_in_place.iter().any(|p| p == path) {
            run.left_in_place.push(path.to_path_buf());
        }
    }
}

/// Hex SHA-256 of a file.
pub async fn package_digest(path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_only_runs_two_phases() {
        assert_eq!(
            RunMode::ValidateOnly.phases(),
            &[Phase::CertificateValidation, Phase::ProfileValidation]
        );
        assert_eq!(RunMode::Full.phases().len(), 6);
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }

    #[tokio::test]
    async fn digest_spans_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("App.ipa");
        let data: Vec<u8> = (0..DIGEST_CHUNK * 3 + 17).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(
            package_digest(&path).await.unwrap(),
            hex::encode(Sha256::digest(&data))
        );
    }

    #[tokio::test]
    async fn digests_package() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("App.ipa");
        tokio::fs::write(&path, b"abc").await.unwrap();
        assert_eq!(
            package_digest(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
