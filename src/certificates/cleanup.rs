//! Quota cleanup strategy selection

use crate::error::{CertificateErrorKind, ReleaseError, Result};
use crate::model::{Certificate, ProvisioningProfile};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStrategy {
    /// Revoke every expired certificate of the type
    RemoveExpired(Vec<Certificate>),
    /// Revoke the single earliest-expiring, unprotected certificate
    RemoveOldest(Certificate),
}

impl CleanupStrategy {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RemoveExpired(_) => "remove_expired",
            Self::RemoveOldest(_) => "remove_oldest",
        }
    }

    #[must_use]
    pub fn targets(&self) -> Vec<&Certificate> {
        match self {
            Self::RemoveExpired(certs) => certs.iter().collect(),
            Self::RemoveOldest(cert) => vec![cert],
        }
    }
}

/// Certificates embedded in still-valid profiles, by fingerprint.
#[must_use]
pub fn in_use_fingerprints(profiles: &[ProvisioningProfile], now: DateTime<Utc>) -> HashSet<String> {
    profiles
        .iter()
        .filter(|p| !p.is_expired_at(now))
        .flat_map(|p| p.certificate_fingerprints().iter().cloned())
        .collect()
}

/// Pick what to revoke for a team at quota.
///
/// Any expired certificate means remove-expired. Otherwise the
/// earliest-expiring certificate that no valid profile embeds is removed;
/// if every certificate is protected, quota is exhausted.
pub fn select_cleanup_strategy(
    existing: &[Certificate],
    protected: &HashSet<String>,
    now: DateTime<Utc>,
) -> Result<CleanupStrategy> {
    let expired: Vec<Certificate> = existing
        .iter()
        .filter(|c| c.is_expired_at(now))
        .cloned()
        .collect();
    if !expired.is_empty() {
        return Ok(CleanupStrategy::RemoveExpired(expired));
    }

    existing
        .iter()
        .filter(|c| !protected.iter().any(|fp| c.matches_identity(fp)))
        .min_by_key(|c| c.expires_at())
        .cloned()
        .map(CleanupStrategy::RemoveOldest)
        .ok_or_else(|| {
            ReleaseError::certificate(
                CertificateErrorKind::QuotaExhausted,
                format!(
                    "All {} certificates at quota are embedded in valid provisioning profiles",
                    existing.len()
                ),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertificateType;
    use chrono::Duration;

    fn cert(id: &str, fingerprint: &str, days: i64, now: DateTime<Utc>) -> Certificate {
        Certificate::new(
            id,
            format!("Apple Distribution: {id}"),
            CertificateType::Distribution,
            now + Duration::days(days),
            "01",
            fingerprint,
        )
    }

    #[test]
    fn expired_certificates_take_precedence() {
        let now = Utc::now();
        let existing = vec![
            cert("A", "0A", 100, now),
            cert("B", "0B", -5, now),
            cert("C", "0C", 10, now),
        ];
        let strategy = select_cleanup_strategy(&existing, &HashSet::new(), now).unwrap();
        assert_eq!(strategy.name(), "remove_expired");
        assert_eq!(strategy.targets().len(), 1);
        assert_eq!(strategy.targets()[0].id(), "B");
    }

    #[test]
    fn oldest_is_strictly_the_earliest_expiring() {
        let now = Utc::now();
        let existing = vec![
            cert("A", "0A", 100, now),
            cert("B", "0B", 20, now),
            cert("C", "0C", 300, now),
        ];
        let strategy = select_cleanup_strategy(&existing, &HashSet::new(), now).unwrap();
        assert_eq!(strategy, CleanupStrategy::RemoveOldest(existing[1].clone()));
    }

    #[test]
    fn protected_certificates_are_skipped() {
        let now = Utc::now();
        let existing = vec![cert("A", "0A", 100, now), cert("B", "0B", 20, now)];
        let protected: HashSet<String> = ["0B".to_string()].into();
        let strategy = select_cleanup_strategy(&existing, &protected, now).unwrap();
        assert_eq!(strategy.targets()[0].id(), "A");
    }

    #[test]
    fn all_protected_is_quota_exhaustion() {
        let now = Utc::now();
        let existing = vec![cert("A", "0A", 100, now)];
        let protected: HashSet<String> = ["0A".to_string()].into();
        let err = select_cleanup_strategy(&existing, &protected, now).unwrap_err();
        assert!(matches!(
            err,
            ReleaseError::Certificate {
                kind: CertificateErrorKind::QuotaExhausted,
                ..
            }
        ));
    }
}
