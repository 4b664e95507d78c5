//! Error types for the release pipeline.
//!
//! Every fallible operation returns [`ReleaseError`]. Variants carry a typed
//! kind so callers can branch on the failure without parsing messages, and
//! every variant can produce at least one recovery suggestion for the
//! user-facing summary.

use crate::certificates::AvailabilityReport;
use crate::config::CertificateType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReleaseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateErrorKind {
    NotFound,
    Invalid,
    QuotaExhausted,
    ImportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileErrorKind {
    NoCompatible,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Authentication,
    RateLimited,
    Outage,
    Network,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Locked,
    AccessDenied,
    CommandFailed,
    /// Intermediate certificates could not be fetched or installed
    TrustChain,
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("Certificate error: {message}")]
    Certificate {
        kind: CertificateErrorKind,
        message: String,
    },

    #[error("Required certificates unavailable: {}", format_types(.missing))]
    CertificatesUnavailable {
        missing: Vec<CertificateType>,
        report: Box<AvailabilityReport>,
    },

    #[error("Provisioning profile error: {message}")]
    Profile {
        kind: ProfileErrorKind,
        message: String,
    },

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Upload failed: {message}")]
    Upload {
        kind: UploadErrorKind,
        message: String,
    },

    #[error("App Store Connect API error: {message}")]
    Api {
        kind: ApiErrorKind,
        status: Option<u16>,
        message: String,
    },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Keychain operation failed: {message}")]
    CredentialStore {
        kind: StoreErrorKind,
        message: String,
    },

    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JWT creation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

fn format_types(types: &[CertificateType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ReleaseError {
    pub fn certificate(kind: CertificateErrorKind, message: impl Into<String>) -> Self {
        Self::Certificate {
            kind,
            message: message.into(),
        }
    }

    pub fn profile(kind: ProfileErrorKind, message: impl Into<String>) -> Self {
        Self::Profile {
            kind,
            message: message.into(),
        }
    }

    pub fn api(kind: ApiErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self::CredentialStore {
            kind,
            message: message.into(),
        }
    }

    pub fn upload(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self::Upload {
            kind,
            message: message.into(),
        }
    }

    /// Short category name used in history entries and summaries.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Certificate { .. } | Self::CertificatesUnavailable { .. } => "CertificateError",
            Self::Profile { .. } => "ProfileError",
            Self::Build(_) => "BuildError",
            Self::Upload { .. } => "UploadError",
            Self::Api { .. } | Self::Reqwest(_) | Self::Jwt(_) => "APIError",
            Self::Validation(_) | Self::TomlParse(_) | Self::TomlSerialize(_) => "ValidationError",
            Self::CredentialStore { .. } => "CredentialStoreError",
            Self::CommandExecution(_) | Self::MissingDependency(_) | Self::Timeout { .. } => {
                "CommandError"
            }
            Self::Io(_) | Self::Json(_) | Self::Plist(_) => "IoError",
        }
    }

    /// Whether a retry of the same idempotent call may succeed.
    ///
    /// Only network timeouts, rate limiting and 5xx-class remote failures
    /// qualify. Uploads are never retried, so no upload error is transient.
    /// Authentication failures are not transient on their own; the API
    /// client handles them with a forced re-authentication.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { kind, .. } => matches!(
                kind,
                ApiErrorKind::RateLimited | ApiErrorKind::Outage | ApiErrorKind::Network
            ),
            Self::Reqwest(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::Api {
                kind: ApiErrorKind::Authentication,
                ..
            }
        ) || matches!(self, Self::Reqwest(e) if e.status().is_some_and(|s| s.as_u16() == 401))
    }

    /// Actionable recovery hints for the user-facing summary. Never empty.
    #[must_use]
    pub fn suggestions(&self) -> Vec<String> {
        let hints: Vec<&str> = match self {
            Self::Certificate { kind, .. } => match kind {
                CertificateErrorKind::NotFound => vec![
                    "Place an exported .p12 for this certificate type in the credentials directory",
                    "Configure App Store Connect API credentials so a certificate can be created",
                ],
                CertificateErrorKind::Invalid => vec![
                    "Re-export the P12 with the current password",
                    "Check that the certificate belongs to the expected team",
                ],
                CertificateErrorKind::QuotaExhausted => vec![
                    "Revoke the oldest certificate to free quota",
                    "Reuse an existing certificate by exporting its P12 from the machine that created it",
                ],
                CertificateErrorKind::ImportFailed => vec![
                    "Re-export the P12 with the current password",
                    "Verify the password table in the release config matches the file name",
                ],
            },
            Self::CertificatesUnavailable { .. } => vec![
                "Run `kodegen_release certificates` to provision the missing certificate types",
                "Provide API key credentials so missing certificates can be created",
            ],
            Self::Profile { kind, .. } => match kind {
                ProfileErrorKind::NoCompatible => vec![
                    "Create a provisioning profile that includes the signing certificate",
                    "Check that the profile's app identifier matches the bundle identifier",
                ],
                ProfileErrorKind::Expired => {
                    vec!["Regenerate the provisioning profile in the developer portal"]
                }
            },
            Self::Build(_) => vec![
                "Inspect the archive log left in the output directory",
                "Run the same xcodebuild command locally to reproduce",
            ],
            Self::Upload { kind, .. } => match kind {
                UploadErrorKind::Rejected => vec![
                    "Check that the build number was not already uploaded",
                    "Review the rejection message from App Store Connect",
                ],
                UploadErrorKind::TimedOut => {
                    vec!["Retry the upload; the exported package was left in place"]
                }
            },
            Self::Api { kind, .. } => match kind {
                ApiErrorKind::Authentication => vec![
                    "Verify the API key id, issuer id and .p8 file",
                    "Check the key has not been revoked in App Store Connect",
                ],
                ApiErrorKind::RateLimited => vec!["Wait a few minutes and retry"],
                ApiErrorKind::Outage | ApiErrorKind::Network => vec![
                    "Check network connectivity and Apple system status, then retry",
                ],
                ApiErrorKind::Rejected => vec!["Check the App Store Connect role of the API key"],
            },
            Self::Reqwest(_) => vec!["Check network/firewall settings and retry"],
            Self::Jwt(_) => vec!["Re-download the .p8 key from App Store Connect"],
            Self::Validation(_) | Self::TomlParse(_) | Self::TomlSerialize(_) => {
                vec!["Fix the reported input and rerun"]
            }
            Self::CredentialStore { kind, .. } => match kind {
                StoreErrorKind::Locked => vec!["Unlock the keychain and retry"],
                StoreErrorKind::AccessDenied => vec![
                    "Grant codesign access to the key (set-key-partition-list)",
                ],
                StoreErrorKind::CommandFailed => {
                    vec!["Run the failing `security` command manually to inspect the error"]
                }
                StoreErrorKind::TrustChain => vec![
                    "Check network access to www.apple.com/certificateauthority",
                    "Set install_apple_intermediates = false if the host already trusts Apple's WWDR intermediates",
                ],
            },
            Self::CommandExecution(_) => vec!["Inspect the command output above and rerun"],
            Self::MissingDependency(_) => vec!["Install Xcode command line tools: xcode-select --install"],
            Self::Timeout { .. } => vec!["Increase the matching timeout in the release config"],
            Self::Io(_) | Self::Json(_) | Self::Plist(_) => {
                vec!["Check file permissions and contents of the reported path"]
            }
        };
        hints.into_iter().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_outage_are_transient() {
        assert!(ReleaseError::api(ApiErrorKind::RateLimited, Some(429), "slow down").is_transient());
        assert!(ReleaseError::api(ApiErrorKind::Outage, Some(503), "down").is_transient());
        assert!(ReleaseError::api(ApiErrorKind::Network, None, "timeout").is_transient());
    }

    #[test]
    fn validation_and_team_mismatch_are_not_transient() {
        assert!(!ReleaseError::Validation("bad".into()).is_transient());
        assert!(
            !ReleaseError::certificate(CertificateErrorKind::Invalid, "team mismatch")
                .is_transient()
        );
        assert!(
            !ReleaseError::api(ApiErrorKind::Authentication, Some(401), "nope").is_transient()
        );
    }

    #[test]
    fn timed_out_upload_is_not_retried() {
        let e = ReleaseError::upload(UploadErrorKind::TimedOut, "altool exceeded 1800s");
        assert!(!e.is_transient());
        assert!(e.suggestions().iter().any(|s| s.contains("Retry the upload")));
    }

    #[test]
    fn every_error_has_a_suggestion() {
        let errors = [
            ReleaseError::certificate(CertificateErrorKind::QuotaExhausted, "full"),
            ReleaseError::profile(ProfileErrorKind::Expired, "old"),
            ReleaseError::Build("archive".into()),
            ReleaseError::upload(UploadErrorKind::Rejected, "dup"),
            ReleaseError::store(StoreErrorKind::Locked, "locked"),
            ReleaseError::Timeout {
                operation: "archive".into(),
                seconds: 900,
            },
        ];
        for e in errors {
            assert!(!e.suggestions().is_empty(), "{e}");
        }
    }

    #[test]
    fn quota_suggestion_mentions_revoking() {
        let e = ReleaseError::certificate(CertificateErrorKind::QuotaExhausted, "full");
        assert!(e.suggestions().iter().any(|s| s.contains("Revoke the oldest")));
    }
}
