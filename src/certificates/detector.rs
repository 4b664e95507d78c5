//! Candidate discovery across keychain, P12 exports and the authority

use super::passwords::{PasswordResolver, infer_type_from_filename};
use super::x509::read_pkcs12;
use crate::config::CertificateType;
use crate::error::Result;
use crate::keychain::{CredentialStore, KeychainScope};
use crate::model::Certificate;
use crate::repository::CertificateRepository;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// P12 / PFX exports larger than this are not certificate exports
pub const MAX_EXPORT_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    Store,
    File,
    Remote,
}

impl CandidateSource {
    /// Higher wins when ranking.
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::Store => 3,
            Self::File => 2,
            Self::Remote => 1,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "keychain",
            Self::File => "file",
            Self::Remote => "remote",
        }
    }
}

/// One certificate found by one source.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub certificate: Certificate,
    pub source: CandidateSource,
    /// Export file for file-sourced candidates
    pub path: Option<PathBuf>,
    /// Password that opened the export
    pub password: Option<Zeroizing<String>>,
    /// Private key present (store identity or key bag in the export)
    pub has_private_key: bool,
}

/// Order candidates by source priority, then by expiration, both
/// descending. Stable, so equal candidates keep discovery order.
#[must_use]
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by_key(|c| {
        (
            Reverse(c.source.priority()),
            Reverse(c.certificate.expires_at()),
        )
    });
    candidates
}

pub struct CertificateDetector {
    store: Arc<dyn CredentialStore>,
    keychain: KeychainScope,
    credentials_dir: PathBuf,
    passwords: PasswordResolver,
    team_id: String,
    remote: Option<Arc<dyn CertificateRepository>>,
    cache: Mutex<HashMap<CertificateType, Vec<Candidate>>>,
}

impl CertificateDetector {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keychain: KeychainScope,
        credentials_dir: impl Into<PathBuf>,
        passwords: PasswordResolver,
        team_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            keychain,
            credentials_dir: credentials_dir.into(),
            passwords,
            team_id: team_id.into(),
            remote: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn CertificateRepository>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// All candidates for `cert_type`, ranked. A failing source is logged
    /// and contributes nothing.
    pub async fn detect(&self, cert_type: CertificateType) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        match self.from_store(cert_type).await {
            Ok(found) => candidates.extend(found),
            Err(e) => tracing::warn!(source = "keychain", cert_type = %cert_type, error = %e, "certificate source failed"),
        }
        match self.from_files(cert_type).await {
            Ok(found) => candidates.extend(found),
            Err(e) => tracing::warn!(source = "file", cert_type = %cert_type, error = %e, "certificate source failed"),
        }
        match self.from_remote(cert_type).await {
            Ok(found) => candidates.extend(found),
            Err(e) => tracing::warn!(source = "remote", cert_type = %cert_type, error = %e, "certificate source failed"),
        }

        let ranked = rank(candidates);
        tracing::debug!(cert_type = %cert_type, count = ranked.len(), "certificate candidates detected");
        ranked
    }

    /// Head of the ranked list, cached per type until [`Self::invalidate`].
    pub async fn get_best_certificate(&self, cert_type: CertificateType) -> Option<Candidate> {
        if let Some(cached) = self.cached(cert_type) {
            return cached.into_iter().next();
        }

        let ranked = self.detect(cert_type).await;
        let best = ranked.first().cloned();
        match self.cache.lock() {
            Ok(mut cache) => {
                cache.insert(cert_type, ranked);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(cert_type, ranked);
            }
        }
        best
    }

    /// Drop cached rankings; call after any import, creation or cleanup.
    pub fn invalidate(&self) {
        match self.cache.lock() {
            Ok(mut cache) => cache.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn cached(&self, cert_type: CertificateType) -> Option<Vec<Candidate>> {
        let cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(&cert_type).cloned()
    }

    async fn from_store(&self, cert_type: CertificateType) -> Result<Vec<Candidate>> {
        let items = self.store.list(&self.keychain.name, Some(cert_type)).await?;
        Ok(items
            .iter()
            .filter(|item| item.signing_capable)
            .filter_map(|item| item.to_certificate())
            .map(|certificate| Candidate {
                certificate,
                source: CandidateSource::Store,
                path: None,
                password: None,
                has_private_key: true,
            })
            .collect())
    }

    async fn from_files(&self, cert_type: CertificateType) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for path in scan_exports(&self.credentials_dir).await? {
            if let Some(candidate) = self.open_export(&path).await
                && candidate.certificate.cert_type() == cert_type
            {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    /// Open one export with each password candidate in turn.
    pub async fn open_export(&self, path: &Path) -> Option<Candidate> {
        let file_name = path.file_name()?.to_string_lossy().to_string();
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "unreadable certificate export");
                return None;
            }
        };

        for password in self.passwords.candidates(&file_name) {
            if let Ok(contents) = read_pkcs12(&data, &password) {
                let certificate = contents
                    .details
                    .to_certificate(None, infer_type_from_filename(&file_name))?;
                return Some(Candidate {
                    certificate,
                    source: CandidateSource::File,
                    path: Some(path.to_path_buf()),
                    password: Some(password),
                    has_private_key: contents.has_private_key,
                });
            }
        }

        tracing::warn!(file = %path.display(), "no configured password opens certificate export");
        None
    }

    async fn from_remote(&self, cert_type: CertificateType) -> Result<Vec<Candidate>> {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(Vec::new());
        };
        let certificates = remote.list_certificates(&self.team_id, cert_type).await?;
        Ok(certificates
            .into_iter()
            .map(|certificate| Candidate {
                certificate,
                source: CandidateSource::Remote,
                path: None,
                password: None,
                has_private_key: false,
            })
            .collect())
    }
}

/// `.p12` / `.pfx` files directly inside `dir`, sorted by name.
pub async fn scan_exports(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() && has_export_extension(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[must_use]
pub fn has_export_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("p12") || e.eq_ignore_ascii_case("pfx"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candidate(source: CandidateSource, id: &str, days: i64) -> Candidate {
        Candidate {
            certificate: Certificate::new(
                id,
                "Apple Distribution: Acme",
                CertificateType::Distribution,
                Utc::now() + Duration::days(days),
                "01",
                "AA",
            ),
            source,
            path: None,
            password: None,
            has_private_key: true,
        }
    }

    #[test]
    fn source_priority_beats_expiration() {
        let ranked = rank(vec![
            candidate(CandidateSource::Remote, "remote", 900),
            candidate(CandidateSource::File, "file", 300),
            candidate(CandidateSource::Store, "store", 10),
        ]);
        let ids: Vec<&str> = ranked.iter().map(|c| c.certificate.id()).collect();
        assert_eq!(ids, vec!["store", "file", "remote"]);
    }

    #[test]
    fn longer_lived_wins_within_a_source() {
        let ranked = rank(vec![
            candidate(CandidateSource::File, "short", 30),
            candidate(CandidateSource::File, "long", 300),
        ]);
        assert_eq!(ranked[0].certificate.id(), "long");
    }

    #[test]
    fn recognizes_export_extensions() {
        assert!(has_export_extension(Path::new("a/dist.P12")));
        assert!(has_export_extension(Path::new("dev.pfx")));
        assert!(!has_export_extension(Path::new("key.p8")));
    }
}
