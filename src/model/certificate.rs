//! Signing certificate identity

use crate::config::CertificateType;
use crate::error::{ReleaseError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Remaining lifetime at or below which a certificate is "expiring soon"
pub const EXPIRING_SOON_DAYS: i64 = 30;

static TEAM_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Z0-9]{10}$").unwrap()
});

/// Apple team identifiers are exactly 10 uppercase alphanumerics.
#[must_use]
pub fn is_valid_team_id(team_id: &str) -> bool {
    TEAM_ID_PATTERN.is_match(team_id)
}

/// Uppercase hex without separators, the form `security` prints.
#[must_use]
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateHealth {
    Healthy,
    ExpiringSoon,
    Expired,
}

/// Identity of one signing certificate.
///
/// Built from an authority response, a P12 export or a keychain listing and
/// never mutated afterwards. The team id is optional because it is extracted
/// from the subject's organizational unit, which may be missing; when
/// present it always has the 10-character team format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    id: String,
    name: String,
    cert_type: CertificateType,
    team_id: Option<String>,
    expires_at: DateTime<Utc>,
    serial_number: String,
    thumbprint: String,
}

impl Certificate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        cert_type: CertificateType,
        expires_at: DateTime<Utc>,
        serial_number: impl Into<String>,
        thumbprint: &str,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cert_type,
            team_id: None,
            expires_at,
            serial_number: serial_number.into(),
            thumbprint: normalize_fingerprint(thumbprint),
        }
    }

    /// Attach the owning team, rejecting malformed identifiers.
    pub fn with_team_id(self, team_id: impl Into<String>) -> Result<Self> {
        let team_id = team_id.into();
        if !is_valid_team_id(&team_id) {
            return Err(ReleaseError::Validation(format!(
                "Team identifier must be 10 uppercase alphanumeric characters: '{team_id}'"
            )));
        }
        Ok(Self {
            team_id: Some(team_id),
            ..self
        })
    }

    /// Replace the authority identifier (e.g. once a local certificate is
    /// matched against the remote listing).
    #[must_use]
    pub fn with_id(self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cert_type(&self) -> CertificateType {
        self.cert_type
    }

    #[must_use]
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whole days left, truncated toward zero; negative once expired.
    #[must_use]
    pub fn days_until_expiration(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days()
    }

    #[must_use]
    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>) -> bool {
        if self.is_expired_at(now) {
            return false;
        }
        let days = self.days_until_expiration(now);
        (0..=EXPIRING_SOON_DAYS).contains(&days)
    }

    #[must_use]
    pub fn health_at(&self, now: DateTime<Utc>) -> CertificateHealth {
        if self.is_expired_at(now) {
            CertificateHealth::Expired
        } else if self.is_expiring_soon_at(now) {
            CertificateHealth::ExpiringSoon
        } else {
            CertificateHealth::Healthy
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn health(&self) -> CertificateHealth {
        self.health_at(Utc::now())
    }

    /// Whether `identity` names this certificate, either by authority id or
    /// by SHA-1 thumbprint.
    #[must_use]
    pub fn matches_identity(&self, identity: &str) -> bool {
        (!self.id.is_empty() && self.id == identity)
            || (!self.thumbprint.is_empty() && self.thumbprint == normalize_fingerprint(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cert_expiring_in(delta: Duration, now: DateTime<Utc>) -> Certificate {
        Certificate::new(
            "C1",
            "Apple Distribution: Acme (ABCDE12345)",
            CertificateType::Distribution,
            now + delta,
            "01",
            "aa:bb:cc",
        )
    }

    #[test]
    fn expired_exactly_at_expiration() {
        let now = Utc::now();
        let cert = cert_expiring_in(Duration::zero(), now);
        assert!(cert.is_expired_at(now));
        assert!(!cert.is_expiring_soon_at(now));
        assert_eq!(cert.health_at(now), CertificateHealth::Expired);
    }

    #[test]
    fn expiring_soon_window_is_inclusive_of_thirty_days() {
        let now = Utc::now();
        let cert = cert_expiring_in(Duration::days(30) + Duration::hours(1), now);
        assert_eq!(cert.days_until_expiration(now), 30);
        assert!(cert.is_expiring_soon_at(now));

        let cert = cert_expiring_in(Duration::days(31) + Duration::hours(1), now);
        assert!(!cert.is_expiring_soon_at(now));
        assert_eq!(cert.health_at(now), CertificateHealth::Healthy);
    }

    #[test]
    fn expired_certificates_are_never_expiring_soon() {
        let now = Utc::now();
        let cert = cert_expiring_in(-Duration::hours(6), now);
        assert!(cert.is_expired_at(now));
        assert!(!cert.is_expiring_soon_at(now));
    }

    #[test]
    fn team_id_format_is_enforced() {
        let now = Utc::now();
        assert!(cert_expiring_in(Duration::days(1), now).with_team_id("ABCDE12345").is_ok());
        assert!(cert_expiring_in(Duration::days(1), now).with_team_id("abcde12345").is_err());
        assert!(cert_expiring_in(Duration::days(1), now).with_team_id("ABC").is_err());
    }

    #[test]
    fn thumbprint_is_normalized_for_identity_match() {
        let cert = cert_expiring_in(Duration::days(1), Utc::now());
        assert_eq!(cert.thumbprint(), "AABBCC");
        assert!(cert.matches_identity("aabbcc"));
        assert!(cert.matches_identity("C1"));
        assert!(!cert.matches_identity("C2"));
    }
}
