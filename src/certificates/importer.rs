//! P12 import into the run keychain with post-import verification

use super::detector::{MAX_EXPORT_SIZE, has_export_extension, scan_exports};
use super::passwords::{PasswordResolver, infer_type_from_filename};
use super::x509::{Pkcs12Contents, read_pkcs12};
use crate::config::CertificateType;
use crate::error::{CertificateErrorKind, ReleaseError, Result};
use crate::keychain::{CredentialStore, KeychainScope};
use crate::model::Certificate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub struct ImportResult {
    pub path: PathBuf,
    pub certificate: Certificate,
    /// Same fingerprint was already in the keychain; nothing was imported
    pub already_present: bool,
}

/// Aggregate of a directory import. Individual failures do not stop the
/// batch.
#[derive(Debug, Default)]
pub struct BatchImportSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<(PathBuf, Result<ImportResult>)>,
}

pub struct CertificateImporter {
    store: Arc<dyn CredentialStore>,
    keychain: KeychainScope,
    passwords: PasswordResolver,
}

impl CertificateImporter {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keychain: KeychainScope,
        passwords: PasswordResolver,
    ) -> Self {
        Self {
            store,
            keychain,
            passwords,
        }
    }

    /// Import one export.
    ///
    /// `password` is tried first, then the resolver's candidates for the
    /// file name. When `cert_type` is given, an export of the other type is
    /// rejected. Importing an export whose fingerprint is already present
    /// is a no-op.
    pub async fn import(
        &self,
        path: &Path,
        password: Option<&str>,
        cert_type: Option<CertificateType>,
    ) -> Result<ImportResult> {
        let data = read_export(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let (contents, password) = self.open(&data, &file_name, password)?;
        let certificate = contents
            .details
            .to_certificate(None, cert_type.or_else(|| infer_type_from_filename(&file_name)))
            .ok_or_else(|| {
                ReleaseError::certificate(
                    CertificateErrorKind::Invalid,
                    format!(
                        "{file_name} is not an Apple signing certificate ({})",
                        contents.details.common_name
                    ),
                )
            })?;

        if let Some(expected) = cert_type
            && certificate.cert_type() != expected
        {
            return Err(ReleaseError::certificate(
                CertificateErrorKind::Invalid,
                format!(
                    "{file_name} holds a {} certificate, expected {expected}",
                    certificate.cert_type()
                ),
            ));
        }
        if !contents.has_private_key {
            return Err(ReleaseError::certificate(
                CertificateErrorKind::Invalid,
                format!("{file_name} contains no private key"),
            ));
        }
        if certificate.is_expired() {
            return Err(ReleaseError::certificate(
                CertificateErrorKind::Invalid,
                format!("{} in {file_name} has expired", certificate.name()),
            ));
        }

        if self.is_present(&certificate, None).await? {
            tracing::info!(
                file = %path.display(),
                fingerprint = certificate.thumbprint(),
                "certificate already in keychain, skipping import"
            );
            return Ok(ImportResult {
                path: path.to_path_buf(),
                certificate,
                already_present: true,
            });
        }

        self.store
            .unlock(&self.keychain.name, &self.keychain.password)
            .await?;
        self.store
            .import(path, &password, &self.keychain.name)
            .await
            .map_err(|e| {
                ReleaseError::certificate(
                    CertificateErrorKind::ImportFailed,
                    format!("Keychain import of {file_name} failed: {e}"),
                )
            })?;
        self.store
            .set_access_control(&self.keychain.name, &self.keychain.password)
            .await?;

        if !self
            .is_present(&certificate, Some(certificate.cert_type()))
            .await?
        {
            return Err(ReleaseError::certificate(
                CertificateErrorKind::ImportFailed,
                format!(
                    "{} was not found in the keychain after importing {file_name}",
                    certificate.name()
                ),
            ));
        }

        tracing::info!(
            file = %path.display(),
            cert_type = %certificate.cert_type(),
            fingerprint = certificate.thumbprint(),
            "certificate imported"
        );
        Ok(ImportResult {
            path: path.to_path_buf(),
            certificate,
            already_present: false,
        })
    }

    /// Import every export in `scan_dir`, each with its resolved password.
    pub async fn auto_import(&self, scan_dir: &Path) -> Result<BatchImportSummary> {
        let mut summary = BatchImportSummary::default();
        for path in scan_exports(scan_dir).await? {
            let result = self.import(&path, None, None).await;
            summary.total += 1;
            match &result {
                Ok(_) => summary.successful += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(file = %path.display(), error = %e, "batch import entry failed");
                }
            }
            summary.outcomes.push((path, result));
        }
        Ok(summary)
    }

    fn open(
        &self,
        data: &[u8],
        file_name: &str,
        password: Option<&str>,
    ) -> Result<(Pkcs12Contents, Zeroizing<String>)> {
        let mut candidates: Vec<Zeroizing<String>> = password
            .map(|p| Zeroizing::new(p.to_string()))
            .into_iter()
            .collect();
        candidates.extend(self.passwords.candidates(file_name));

        let mut last_error = None;
        for candidate in candidates {
            match read_pkcs12(data, &candidate) {
                Ok(contents) => return Ok((contents, candidate)),
                Err(e @ ReleaseError::Certificate {
                    kind: CertificateErrorKind::Invalid,
                    ..
                }) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(ReleaseError::certificate(
            CertificateErrorKind::ImportFailed,
            format!(
                "No configured password opens {file_name}{}",
                last_error.map(|e| format!(" ({e})")).unwrap_or_default()
            ),
        ))
    }

    /// Present, unexpired and backed by a private key.
    async fn is_present(
        &self,
        certificate: &Certificate,
        type_filter: Option<CertificateType>,
    ) -> Result<bool> {
        let items = self.store.list(&self.keychain.name, type_filter).await?;
        Ok(items.iter().any(|item| {
            certificate.matches_identity(&item.fingerprint)
                && item.signing_capable
                && item.expires_at > chrono::Utc::now()
        }))
    }
}

/// Existence, extension and size checks, then the bytes.
async fn read_export(path: &Path) -> Result<Vec<u8>> {
    if !tokio::fs::try_exists(path).await? {
        return Err(ReleaseError::certificate(
            CertificateErrorKind::NotFound,
            format!("Certificate file not found: {}", path.display()),
        ));
    }
    if !has_export_extension(path) {
        return Err(ReleaseError::certificate(
            CertificateErrorKind::Invalid,
            format!("{} is not a .p12 or .pfx file", path.display()),
        ));
    }

    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(ReleaseError::certificate(
            CertificateErrorKind::Invalid,
            format!("{} is empty or not a regular file", path.display()),
        ));
    }
    if metadata.len() > MAX_EXPORT_SIZE {
        return Err(ReleaseError::certificate(
            CertificateErrorKind::Invalid,
            format!(
                "{} is {} bytes; certificate exports are at most {MAX_EXPORT_SIZE}",
                path.display(),
                metadata.len()
            ),
        ));
    }

    Ok(tokio::fs::read(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_missing_and_wrong_extension() {
        let dir = tempfile::tempdir().unwrap();

        let missing = read_export(&dir.path().join("nope.p12")).await;
        assert!(matches!(
            missing,
            Err(ReleaseError::Certificate {
                kind: CertificateErrorKind::NotFound,
                ..
            })
        ));

        let txt = dir.path().join("cert.txt");
        tokio::fs::write(&txt, b"data").await.unwrap();
        assert!(read_export(&txt).await.is_err());

        let empty = dir.path().join("empty.p12");
        tokio::fs::write(&empty, b"").await.unwrap();
        assert!(read_export(&empty).await.is_err());
    }
}
