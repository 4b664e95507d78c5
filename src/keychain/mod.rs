//! Credential store (keychain) operations
//!
//! - `CredentialStore`: the narrow contract the pipeline needs
//! - `SecurityCli`: implementation over the macOS `security` tool
//! - `EphemeralKeychain`: per-run, uniquely named, password-scoped keychain
//! - `IntermediateSource`: Apple WWDR intermediates installed into it

mod intermediates;
mod security;
mod temp;

pub use intermediates::{
    APPLE_WWDR_INTERMEDIATES, AppleIntermediates, IntermediateCertificate, IntermediateSource,
};
pub use security::{
    SecurityCli, keychain_path, parse_find_certificate_output, parse_identity_hashes,
};
pub use temp::EphemeralKeychain;

use crate::certificates::CertificateDetails;
use crate::config::CertificateType;
use crate::error::Result;
use crate::model::Certificate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use zeroize::Zeroizing;

/// Name and password of the keychain a component operates on.
#[derive(Clone)]
pub struct KeychainScope {
    pub name: String,
    pub password: Zeroizing<String>,
}

impl KeychainScope {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl std::fmt::Debug for KeychainScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeychainScope")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One certificate as enumerated from a keychain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreItem {
    pub subject: String,
    pub issuer: String,
    pub organizational_unit: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub fingerprint: String,
    pub serial_number: String,
    /// A matching private key is present (valid codesigning identity)
    pub signing_capable: bool,
}

impl StoreItem {
    #[must_use]
    pub fn from_details(details: CertificateDetails, signing_capable: bool) -> Self {
        Self {
            subject: details.common_name,
            issuer: details.issuer,
            organizational_unit: details.organizational_unit,
            expires_at: details.not_after,
            fingerprint: details.fingerprint,
            serial_number: details.serial_number,
            signing_capable,
        }
    }

    #[must_use]
    pub fn cert_type(&self) -> Option<CertificateType> {
        CertificateType::from_common_name(&self.subject)
    }

    /// Value object for this item, or `None` for non-signing certificates.
    #[must_use]
    pub fn to_certificate(&self) -> Option<Certificate> {
        let cert = Certificate::new(
            &self.fingerprint,
            &self.subject,
            self.cert_type()?,
            self.expires_at,
            &self.serial_number,
            &self.fingerprint,
        );
        match self.organizational_unit.as_deref() {
            Some(team) => Some(cert.clone().with_team_id(team).unwrap_or(cert)),
            None => Some(cert),
        }
    }
}

/// Secure credential container operations, addressed by keychain name.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn create(&self, name: &str, password: &str) -> Result<()>;

    async fn unlock(&self, name: &str, password: &str) -> Result<()>;

    async fn import(&self, path: &Path, password: &str, name: &str) -> Result<()>;

    /// Import a certificate without a private key, e.g. an intermediate CA.
    async fn import_certificate(&self, path: &Path, name: &str) -> Result<()>;

    /// Grant codesign/productbuild access to imported keys without prompts.
    async fn set_access_control(&self, name: &str, password: &str) -> Result<()>;

    /// Enumerate signing certificates, optionally of one type only.
    async fn list(&self, name: &str, type_filter: Option<CertificateType>)
    -> Result<Vec<StoreItem>>;

    async fn delete(&self, fingerprint: &str, name: &str) -> Result<()>;

    async fn destroy(&self, name: &str) -> Result<()>;
}
