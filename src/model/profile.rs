//! Provisioning profile value object and identifier matching

use super::certificate::{Certificate, normalize_fingerprint};
use crate::config::CertificateType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    Development,
    Distribution,
}

impl ProfileType {
    #[must_use]
    pub fn for_certificate(cert_type: CertificateType) -> Self {
        match cert_type {
            CertificateType::Development => Self::Development,
            CertificateType::Distribution => Self::Distribution,
        }
    }

    #[must_use]
    pub fn to_apple_api_string(&self) -> &'static str {
        match self {
            Self::Development => "IOS_APP_DEVELOPMENT",
            Self::Distribution => "IOS_APP_STORE",
        }
    }

    #[must_use]
    pub fn from_apple_api_string(value: &str) -> Option<Self> {
        match value {
            "IOS_APP_DEVELOPMENT" => Some(Self::Development),
            "IOS_APP_STORE" => Some(Self::Distribution),
            _ => None,
        }
    }

    /// `method` value for the export options plist
    #[must_use]
    pub fn export_method(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Distribution => "app-store",
        }
    }
}

/// Match an application identifier against a profile's identifier pattern.
///
/// `prefix.*` matches any identifier made of `prefix`, a dot and a
/// non-empty suffix; a bare `*` matches any non-empty identifier; anything
/// else must match exactly.
#[must_use]
pub fn identifier_matches(pattern: &str, identifier: &str) -> bool {
    if identifier.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => identifier
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|suffix| !suffix.is_empty()),
        None => pattern == identifier,
    }
}

/// Binding of an app identifier pattern, a certificate set and a device
/// class, with its own expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningProfile {
    uuid: String,
    name: String,
    team_id: String,
    identifier_pattern: String,
    platform: String,
    profile_type: ProfileType,
    certificate_fingerprints: Vec<String>,
    expires_at: DateTime<Utc>,
    authority_id: Option<String>,
    path: Option<PathBuf>,
}

impl ProvisioningProfile {
    /// `identifier_pattern` is the bundle identifier part of the
    /// application-identifier entitlement, without the team prefix.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        team_id: impl Into<String>,
        identifier_pattern: impl Into<String>,
        platform: impl Into<String>,
        profile_type: ProfileType,
        certificate_fingerprints: impl IntoIterator<Item = String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            team_id: team_id.into(),
            identifier_pattern: identifier_pattern.into(),
            platform: platform.into(),
            profile_type,
            certificate_fingerprints: certificate_fingerprints
                .into_iter()
                .map(|f| normalize_fingerprint(&f))
                .collect(),
            expires_at,
            authority_id: None,
            path: None,
        }
    }

    #[must_use]
    pub fn with_authority_id(self, id: impl Into<String>) -> Self {
        Self {
            authority_id: Some(id.into()),
            ..self
        }
    }

    #[must_use]
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..self
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    #[must_use]
    pub fn identifier_pattern(&self) -> &str {
        &self.identifier_pattern
    }

    #[must_use]
    pub fn platform(&self) -> &str {
        &self.platform
    }

    #[must_use]
    pub fn profile_type(&self) -> ProfileType {
        self.profile_type
    }

    #[must_use]
    pub fn certificate_fingerprints(&self) -> &[String] {
        &self.certificate_fingerprints
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn authority_id(&self) -> Option<&str> {
        self.authority_id.as_deref()
    }

    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn matches_app_identifier(&self, app_identifier: &str) -> bool {
        identifier_matches(&self.identifier_pattern, app_identifier)
    }

    #[must_use]
    pub fn embeds(&self, certificate: &Certificate) -> bool {
        self.certificate_fingerprints
            .iter()
            .any(|f| certificate.matches_identity(f))
    }

    /// Every certificate must be embedded; partial overlap does not count.
    #[must_use]
    pub fn embeds_all(&self, certificates: &[Certificate]) -> bool {
        certificates.iter().all(|c| self.embeds(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_requires_non_empty_suffix() {
        assert!(identifier_matches("com.company.*", "com.company.widget"));
        assert!(identifier_matches("com.company.*", "com.company.todaywidget"));
        assert!(identifier_matches("com.company.*", "com.company.widget.extension"));
        assert!(!identifier_matches("com.company.*", "com.company"));
        assert!(!identifier_matches("com.company.*", "com.company."));
        assert!(!identifier_matches("com.company.*", "com.other.widget"));
        assert!(!identifier_matches("com.company.*", "com.companywidget"));
    }

    #[test]
    fn exact_pattern_requires_exact_match() {
        assert!(identifier_matches("com.company.widget", "com.company.widget"));
        assert!(!identifier_matches("com.company.widget", "com.company.widget2"));
        assert!(!identifier_matches("com.company.widget", "com.company"));
    }

    #[test]
    fn bare_wildcard_matches_anything_non_empty() {
        assert!(identifier_matches("*", "com.any.app"));
        assert!(!identifier_matches("*", ""));
    }

    #[test]
    fn embeds_all_rejects_partial_overlap() {
        let now = Utc::now();
        let cert = |fp: &str| {
            Certificate::new(
                "",
                "Apple Distribution: Acme",
                CertificateType::Distribution,
                now + chrono::Duration::days(100),
                "1",
                fp,
            )
        };
        let profile = ProvisioningProfile::new(
            "U",
            "P",
            "ABCDE12345",
            "com.company.*",
            "iOS",
            ProfileType::Distribution,
            vec!["aa".to_string()],
            now + chrono::Duration::days(100),
        );
        assert!(profile.embeds_all(&[cert("AA")]));
        assert!(!profile.embeds_all(&[cert("AA"), cert("BB")]));
    }
}
