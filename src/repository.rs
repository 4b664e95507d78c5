//! Contracts for the external systems the pipeline drives.
//!
//! Each trait is implemented by a concrete adapter (`AppleApiClient`,
//! `Xcodebuild`) and by in-memory fakes in the integration tests.

use crate::config::CertificateType;
use crate::error::Result;
use crate::model::{Certificate, ProfileType, ProvisioningProfile, VersionInfo};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Certificate issued by the authority, with the private key generated
/// locally for its signing request.
pub struct CreatedCertificate {
    pub certificate: Certificate,
    pub certificate_der: Vec<u8>,
    /// PKCS#8 DER
    pub private_key_der: Zeroizing<Vec<u8>>,
}

/// Profile as known to the authority, plus the signed file content.
#[derive(Debug, Clone)]
pub struct RemoteProfile {
    pub profile: ProvisioningProfile,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait CertificateRepository: Send + Sync {
    async fn list_certificates(
        &self,
        team_id: &str,
        cert_type: CertificateType,
    ) -> Result<Vec<Certificate>>;

    async fn create_certificate(
        &self,
        team_id: &str,
        cert_type: CertificateType,
    ) -> Result<CreatedCertificate>;

    async fn revoke_certificate(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn list_profiles(&self, app_identifier: &str, team_id: &str)
    -> Result<Vec<RemoteProfile>>;

    async fn create_profile(
        &self,
        app_identifier: &str,
        certificates: &[Certificate],
        team_id: &str,
        profile_type: ProfileType,
    ) -> Result<RemoteProfile>;
}

/// Manual signing settings handed to the archive step.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub team_id: String,
    /// Certificate common name, e.g. "Apple Distribution: Acme (ABCDE12345)"
    pub identity: String,
    pub profile_name: String,
    pub profile_uuid: String,
    /// Installed for Xcode before archiving
    pub profile_path: Option<PathBuf>,
    pub keychain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub success: bool,
    pub archive_path: PathBuf,
    pub logs: String,
}

/// Contents of the `-exportOptionsPlist` file.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub method: String,
    pub team_id: String,
    pub signing_certificate: String,
    /// bundle identifier → profile name
    pub provisioning_profiles: BTreeMap<String, String>,
    pub upload_symbols: bool,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub success: bool,
    pub package_path: Option<PathBuf>,
    pub logs: String,
}

#[async_trait]
pub trait BuildRepository: Send + Sync {
    async fn archive(
        &self,
        project_path: &Path,
        scheme: &str,
        configuration: &str,
        output_path: &Path,
        signing: &SigningConfig,
    ) -> Result<ArchiveOutcome>;

    async fn export_package(
        &self,
        archive_path: &Path,
        options: &ExportOptions,
        output_dir: &Path,
    ) -> Result<ExportOutcome>;

    async fn list_schemes(&self, project_path: &Path) -> Result<Vec<String>>;

    async fn read_build_settings(
        &self,
        project_path: &Path,
        scheme: &str,
        configuration: &str,
    ) -> Result<BTreeMap<String, String>>;

    async fn read_version(&self, project_path: &Path) -> Result<VersionInfo>;

    async fn write_version(&self, project_path: &Path, version: &VersionInfo) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub app_identifier: String,
    pub marketing_version: String,
    pub build_number: String,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub delivery_id: Option<String>,
    pub message: String,
}

/// Processing state of an uploaded build as reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    /// Not visible yet (upload still being ingested)
    NotFound,
    Processing,
    /// Ready for beta testing
    Ready,
    Invalid(String),
}

#[async_trait]
pub trait UploadRepository: Send + Sync {
    async fn upload_build(&self, package_path: &Path, options: &UploadOptions)
    -> Result<UploadReceipt>;

    async fn get_build_status(&self, app_identifier: &str, build_number: &str)
    -> Result<BuildStatus>;
}
