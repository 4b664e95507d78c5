//! Apple WWDR intermediate certificates for the run keychain
//!
//! A fresh keychain on a clean CI host does not chain Apple Development and
//! Apple Distribution certificates to a trusted root until the issuing WWDR
//! intermediate is present; `find-identity -v` then omits the identity.

use crate::certificates::CertificateDetails;
use crate::error::{ReleaseError, Result, StoreErrorKind};
use async_trait::async_trait;
use std::time::Duration;

/// Issuers of current iOS development and distribution certificates.
pub const APPLE_WWDR_INTERMEDIATES: &[(&str, &str)] = &[
    (
        "AppleWWDRCAG3",
        "https://www.apple.com/certificateauthority/AppleWWDRCAG3.cer",
    ),
    (
        "AppleWWDRCAG6",
        "https://www.apple.com/certificateauthority/AppleWWDRCAG6.cer",
    ),
];

/// One DER intermediate, checked to parse as X.509.
#[derive(Debug, Clone)]
pub struct IntermediateCertificate {
    pub name: String,
    pub der: Vec<u8>,
}

impl IntermediateCertificate {
    pub fn from_der(name: impl Into<String>, der: Vec<u8>) -> Result<Self> {
        let name = name.into();
        if der.is_empty() {
            return Err(ReleaseError::store(
                StoreErrorKind::TrustChain,
                format!("{name} download returned empty data"),
            ));
        }
        CertificateDetails::from_der(&der).map_err(|e| {
            ReleaseError::store(
                StoreErrorKind::TrustChain,
                format!("{name} is not a DER certificate: {e}"),
            )
        })?;
        Ok(Self { name, der })
    }
}

/// Where the intermediates installed into each run keychain come from.
#[async_trait]
pub trait IntermediateSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IntermediateCertificate>>;
}

/// Downloads [`APPLE_WWDR_INTERMEDIATES`] from apple.com.
pub struct AppleIntermediates {
    client: reqwest::Client,
    timeout: Duration,
}

impl AppleIntermediates {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                ReleaseError::store(
                    StoreErrorKind::TrustChain,
                    format!("Failed to create HTTP client: {e}"),
                )
            })?;
        Ok(Self { client, timeout })
    }

    async fn download(&self, name: &str, url: &str) -> Result<IntermediateCertificate> {
        let response = self.client.get(url).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!(
                    "{name} download timed out after {} seconds. Check network connection.",
                    self.timeout.as_secs()
                )
            } else if e.is_connect() {
                "Could not connect to Apple servers. Check network/firewall.".to_string()
            } else {
                format!("{name} download failed: {e}")
            };
            ReleaseError::store(StoreErrorKind::TrustChain, message)
        })?;

        let bytes = response
            .error_for_status()
            .map_err(|e| {
                ReleaseError::store(
                    StoreErrorKind::TrustChain,
                    format!(
                        "{name} HTTP {}: {e}",
                        e.status()
                            .map(|s| s.as_u16().to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    ),
                )
            })?
            .bytes()
            .await
            .map_err(|e| {
                ReleaseError::store(
                    StoreErrorKind::TrustChain,
                    format!("Failed to read {name} bytes: {e}"),
                )
            })?;

        IntermediateCertificate::from_der(name, bytes.to_vec())
    }
}

#[async_trait]
impl IntermediateSource for AppleIntermediates {
    async fn fetch(&self) -> Result<Vec<IntermediateCertificate>> {
        let mut certificates = Vec::with_capacity(APPLE_WWDR_INTERMEDIATES.len());
        for (name, url) in APPLE_WWDR_INTERMEDIATES {
            certificates.push(self.download(name, url).await?);
            tracing::debug!(intermediate = name, "intermediate downloaded");
        }
        Ok(certificates)
    }
}
