//! Import password resolution for P12 exports

use crate::config::{CertificateType, PasswordTable};
use zeroize::Zeroizing;

/// Best-effort certificate type from a file name.
///
/// `ios_distribution.p12`, `AppStore.p12` and `release-cert.pfx` read as
/// distribution; `dev.p12` and `ios_development.p12` as development.
#[must_use]
pub fn infer_type_from_filename(file_name: &str) -> Option<CertificateType> {
    let lower = file_name.to_ascii_lowercase();
    if ["dist", "appstore", "app_store", "app-store", "release", "adhoc"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        Some(CertificateType::Distribution)
    } else if lower.contains("dev") {
        Some(CertificateType::Development)
    } else {
        None
    }
}

/// Ordered password candidates for a file: its own entry, then its
/// inferred type's entry, then the default, then the team's shared
/// password, then the empty password.
#[derive(Clone, Default)]
pub struct PasswordResolver {
    table: PasswordTable,
    team_password: Option<Zeroizing<String>>,
}

impl PasswordResolver {
    #[must_use]
    pub fn new(table: PasswordTable) -> Self {
        Self {
            table,
            team_password: None,
        }
    }

    #[must_use]
    pub fn with_team_password(mut self, password: impl Into<String>) -> Self {
        self.team_password = Some(Zeroizing::new(password.into()));
        self
    }

    /// First configured password for the file, if any.
    #[must_use]
    pub fn resolve(&self, file_name: &str) -> Option<&str> {
        self.table
            .by_file
            .get(file_name)
            .or_else(|| {
                infer_type_from_filename(file_name).and_then(|t| self.table.by_type.get(&t))
            })
            .or(self.table.default.as_ref())
            .map(String::as_str)
            .or(self.team_password.as_deref().map(String::as_str))
    }

    /// Every distinct candidate in resolution order, ending with "".
    #[must_use]
    pub fn candidates(&self, file_name: &str) -> Vec<Zeroizing<String>> {
        let ordered = [
            self.table.by_file.get(file_name),
            infer_type_from_filename(file_name).and_then(|t| self.table.by_type.get(&t)),
            self.table.default.as_ref(),
            self.team_password.as_deref(),
        ];

        let mut out: Vec<Zeroizing<String>> = Vec::new();
        for candidate in ordered.into_iter().flatten() {
            if !out.iter().any(|seen| **seen == *candidate) {
                out.push(Zeroizing::new(candidate.clone()));
            }
        }
        if !out.iter().any(|seen| seen.is_empty()) {
            out.push(Zeroizing::new(String::new()));
        }
        out
    }
}

impl std::fmt::Debug for PasswordResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordResolver")
            .field("files", &self.table.by_file.keys().collect::<Vec<_>>())
            .field("types", &self.table.by_type.keys().collect::<Vec<_>>())
            .field("has_default", &self.table.default.is_some())
            .field("has_team_password", &self.team_password.is_some())
            .finish()
    }
}
