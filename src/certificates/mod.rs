//! Signing certificate lifecycle
//!
//! - `detector`: candidates from keychain, P12 exports and the authority
//! - `validator`: basic / standard / comprehensive check chains
//! - `importer`: P12 import with password fallback and verification
//! - `cleanup`: quota cleanup strategy selection
//! - `manager`: per-type availability with recovery

mod cleanup;
mod detector;
mod importer;
mod manager;
mod passwords;
mod validator;
mod x509;

pub use cleanup::{CleanupStrategy, in_use_fingerprints, select_cleanup_strategy};
pub use detector::{
    Candidate, CandidateSource, CertificateDetector, MAX_EXPORT_SIZE, rank, scan_exports,
};
pub use importer::{BatchImportSummary, CertificateImporter, ImportResult};
pub use manager::{
    Availability, AvailabilityReport, AvailabilitySource, CertificateManager, InventoryEntry,
};
pub use passwords::{PasswordResolver, infer_type_from_filename};
pub use validator::{
    CertificateValidator, CheckKind, CheckResult, CheckStatus, ValidationLevel, ValidationReport,
    team_matches,
};
pub use x509::{CertificateDetails, Pkcs12Contents, build_pkcs12, read_pkcs12, sha1_fingerprint};
