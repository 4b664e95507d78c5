//! Check chains run against one certificate candidate

use super::detector::{Candidate, CandidateSource, MAX_EXPORT_SIZE, has_export_extension};
use super::x509::read_pkcs12;
use crate::error::Result;
use crate::keychain::{CredentialStore, KeychainScope};
use crate::model::EXPIRING_SOON_DAYS;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    /// Existence, readability, format
    Basic,
    /// Basic plus expiration and team ownership
    Standard,
    /// Standard plus keychain accessibility and signing capability
    Comprehensive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Existence,
    Readability,
    Format,
    Expiration,
    TeamOwnership,
    StoreAccessibility,
    SigningCapability,
}

impl ValidationLevel {
    #[must_use]
    pub fn checks(&self) -> &'static [CheckKind] {
        use CheckKind::*;
        match self {
            Self::Basic => &[Existence, Readability, Format],
            Self::Standard => &[Existence, Readability, Format, Expiration, TeamOwnership],
            Self::Comprehensive => &[
                Existence,
                Readability,
                Format,
                Expiration,
                TeamOwnership,
                StoreAccessibility,
                SigningCapability,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Passed,
    /// Passed, but needs attention soon
    Warning,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    fn passed(kind: CheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: CheckStatus::Passed,
            message: message.into(),
        }
    }

    fn failed(kind: CheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: CheckStatus::Failed,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub level: ValidationLevel,
    pub results: Vec<CheckResult>,
}

impl ValidationReport {
    /// Conjunction of every check; warnings count as valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.results.iter().all(|r| r.status != CheckStatus::Failed)
    }

    #[must_use]
    pub fn failed(&self, kind: CheckKind) -> bool {
        self.results
            .iter()
            .any(|r| r.kind == kind && r.status == CheckStatus::Failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Failed)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Warning)
    }

    /// Failed check messages joined for a one-line reason.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Team-ownership rule: exact match, and a missing team id never passes.
#[must_use]
pub fn team_matches(candidate_team: Option<&str>, expected_team: &str) -> bool {
    candidate_team.is_some_and(|team| !team.is_empty() && team == expected_team)
}

pub struct CertificateValidator {
    store: Arc<dyn CredentialStore>,
    keychain: KeychainScope,
    expected_team: String,
}

impl CertificateValidator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keychain: KeychainScope,
        expected_team: impl Into<String>,
    ) -> Self {
        Self {
            store,
            keychain,
            expected_team: expected_team.into(),
        }
    }

    pub async fn validate(&self, candidate: &Candidate, level: ValidationLevel) -> ValidationReport {
        self.validate_at(candidate, level, Utc::now()).await
    }

    /// Every check runs even after an earlier one fails; a check that
    /// errors is recorded as failed.
    pub async fn validate_at(
        &self,
        candidate: &Candidate,
        level: ValidationLevel,
        now: DateTime<Utc>,
    ) -> ValidationReport {
        let mut results = Vec::with_capacity(level.checks().len());
        for &kind in level.checks() {
            let result = match self.run_check(kind, candidate, now).await {
                Ok(result) => result,
                Err(e) => CheckResult::failed(kind, format!("{kind:?} check errored: {e}")),
            };
            results.push(result);
        }
        ValidationReport { level, results }
    }

    async fn run_check(
        &self,
        kind: CheckKind,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<CheckResult> {
        match kind {
            CheckKind::Existence => self.check_existence(candidate).await,
            CheckKind::Readability => self.check_readability(candidate).await,
            CheckKind::Format => Ok(check_format(candidate)),
            CheckKind::Expiration => Ok(check_expiration(candidate, now)),
            CheckKind::TeamOwnership => Ok(self.check_team(candidate)),
            CheckKind::StoreAccessibility => self.check_store(candidate, false).await,
            CheckKind::SigningCapability => self.check_store(candidate, true).await,
        }
    }

    async fn check_existence(&self, candidate: &Candidate) -> Result<CheckResult> {
        let kind = CheckKind::Existence;
        match (&candidate.source, &candidate.path) {
            (CandidateSource::File, Some(path)) => {
                if tokio::fs::try_exists(path).await? {
                    Ok(CheckResult::passed(kind, format!("{} exists", path.display())))
                } else {
                    Ok(CheckResult::failed(kind, format!("{} not found", path.display())))
                }
            }
            (CandidateSource::File, None) => {
                Ok(CheckResult::failed(kind, "File candidate without a path"))
            }
            (source, _) => Ok(CheckResult::passed(
                kind,
                format!("Listed by {}", source.as_str()),
            )),
        }
    }

    async fn check_readability(&self, candidate: &Candidate) -> Result<CheckResult> {
        let kind = CheckKind::Readability;
        let (Some(path), CandidateSource::File) = (&candidate.path, candidate.source) else {
            return Ok(CheckResult::passed(kind, "Not file-backed"));
        };

        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() == 0 || metadata.len() > MAX_EXPORT_SIZE {
            return Ok(CheckResult::failed(
                kind,
                format!("{} has implausible size {} bytes", path.display(), metadata.len()),
            ));
        }

        let data = tokio::fs::read(path).await?;
        let password = candidate.password.as_deref().map(String::as_str).unwrap_or("");
        match read_pkcs12(&data, password) {
            Ok(contents) if contents.has_private_key => {
                Ok(CheckResult::passed(kind, "Export opens with the configured password"))
            }
            Ok(_) => Ok(CheckResult::failed(kind, "Export contains no private key")),
            Err(e) => Ok(CheckResult::failed(kind, e.to_string())),
        }
    }

    fn check_team(&self, candidate: &Candidate) -> CheckResult {
        let kind = CheckKind::TeamOwnership;
        let team = candidate.certificate.team_id();
        if team_matches(team, &self.expected_team) {
            CheckResult::passed(kind, format!("Owned by team {}", self.expected_team))
        } else {
            match team {
                Some(other) => CheckResult::failed(
                    kind,
                    format!(
                        "Certificate belongs to team {other}, expected {}",
                        self.expected_team
                    ),
                ),
                None => CheckResult::failed(kind, "No team identifier in certificate subject"),
            }
        }
    }

    async fn check_store(&self, candidate: &Candidate, need_key: bool) -> Result<CheckResult> {
        let kind = if need_key {
            CheckKind::SigningCapability
        } else {
            CheckKind::StoreAccessibility
        };
        let items = self
            .store
            .list(&self.keychain.name, Some(candidate.certificate.cert_type()))
            .await?;

        let Some(item) = items
            .iter()
            .find(|item| candidate.certificate.matches_identity(&item.fingerprint))
        else {
            return Ok(CheckResult::failed(
                kind,
                format!("{} is not in keychain {}", candidate.certificate.name(), self.keychain.name),
            ));
        };

        if need_key && !item.signing_capable {
            return Ok(CheckResult::failed(
                kind,
                format!("{} has no private key in the keychain", item.subject),
            ));
        }
        Ok(CheckResult::passed(kind, format!("{} accessible", item.subject)))
    }
}

fn check_format(candidate: &Candidate) -> CheckResult {
    let kind = CheckKind::Format;
    if let Some(path) = &candidate.path
        && !has_export_extension(path)
    {
        return CheckResult::failed(kind, format!("{} is not a .p12/.pfx export", path.display()));
    }
    if candidate.certificate.thumbprint().len() != 40 {
        return CheckResult::failed(kind, "Certificate has no SHA-1 fingerprint");
    }
    CheckResult::passed(kind, "Well-formed signing certificate")
}

fn check_expiration(candidate: &Candidate, now: DateTime<Utc>) -> CheckResult {
    let kind = CheckKind::Expiration;
    let cert = &candidate.certificate;
    if cert.is_expired_at(now) {
        return CheckResult::failed(
            kind,
            format!("{} expired on {}", cert.name(), cert.expires_at().format("%Y-%m-%d")),
        );
    }
    let days = cert.days_until_expiration(now);
    if days <= EXPIRING_SOON_DAYS {
        return CheckResult {
            kind,
            status: CheckStatus::Warning,
            message: format!("{} expires in {days} days", cert.name()),
        };
    }
    CheckResult::passed(kind, format!("Valid for {days} more days"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertificateType;
    use crate::model::Certificate;
    use chrono::Duration;

    fn candidate(days: i64) -> Candidate {
        Candidate {
            certificate: Certificate::new(
                "C1",
                "Apple Distribution: Acme",
                CertificateType::Distribution,
                Utc::now() + Duration::days(days),
                "01",
                "A9993E364706816ABA3E25717850C26C9CD0D89D",
            ),
            source: CandidateSource::Remote,
            path: None,
            password: None,
            has_private_key: false,
        }
    }

    #[test]
    fn team_match_is_exact_and_requires_a_team() {
        assert!(team_matches(Some("ABCDE12345"), "ABCDE12345"));
        assert!(!team_matches(Some("ZZZZZ99999"), "ABCDE12345"));
        assert!(!team_matches(Some("abcde12345"), "ABCDE12345"));
        assert!(!team_matches(None, "ABCDE12345"));
        assert!(!team_matches(Some(""), ""));
    }

    #[test]
    fn expiring_soon_is_a_warning_not_a_failure() {
        let result = check_expiration(&candidate(10), Utc::now());
        assert_eq!(result.status, CheckStatus::Warning);

        let result = check_expiration(&candidate(-1), Utc::now());
        assert_eq!(result.status, CheckStatus::Failed);

        let result = check_expiration(&candidate(200), Utc::now());
        assert_eq!(result.status, CheckStatus::Passed);
    }

    #[test]
    fn levels_are_nested() {
        let basic = ValidationLevel::Basic.checks();
        let standard = ValidationLevel::Standard.checks();
        let comprehensive = ValidationLevel::Comprehensive.checks();
        assert!(basic.iter().all(|c| standard.contains(c)));
        assert!(standard.iter().all(|c| comprehensive.contains(c)));
        assert!(standard.contains(&CheckKind::TeamOwnership));
        assert!(!basic.contains(&CheckKind::Expiration));
    }
}
