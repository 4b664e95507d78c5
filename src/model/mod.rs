//! Value objects shared by every stage of the pipeline.
//!
//! All types here are immutable once built; updates return new instances.

mod api_credentials;
mod certificate;
mod history;
mod profile;
mod version;

pub use api_credentials::{
    ApiCredentials, CredentialKind, DEFAULT_ROTATION_DAYS, SecurityLevel,
};
pub use certificate::{
    Certificate, CertificateHealth, EXPIRING_SOON_DAYS, is_valid_team_id, normalize_fingerprint,
};
pub use history::{DeploymentHistory, DeploymentStatus, HistoryEntry, Phase, PhaseOutcome};
pub use profile::{ProfileType, ProvisioningProfile, identifier_matches};
pub use version::{BuildNumber, BumpType, MarketingVersion, VersionInfo, bump};
