//! Configuration structures for the release pipeline.

use crate::error::{ReleaseError, Result};
use crate::model::BumpType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default credentials directory, relative to the project root
pub const DEFAULT_CREDENTIALS_DIR: &str = "certificates";

/// Default output directory for archives, packages and history
pub const DEFAULT_OUTPUT_DIR: &str = "build";

/// Default build configuration passed to xcodebuild
pub const DEFAULT_CONFIGURATION: &str = "Release";

/// Apple's per-team limit on live development certificates
pub const DEVELOPMENT_QUOTA: usize = 2;

/// Apple's per-team limit on live distribution certificates
pub const DISTRIBUTION_QUOTA: usize = 3;

/// Signing certificate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateType {
    Development,
    Distribution,
}

impl CertificateType {
    pub const ALL: [CertificateType; 2] = [Self::Development, Self::Distribution];

    /// Convert to Apple API certificate type string
    ///
    /// See: <https://developer.apple.com/documentation/appstoreconnectapi/certificatetype>
    #[must_use]
    pub fn to_apple_api_string(&self) -> &'static str {
        match self {
            Self::Development => "DEVELOPMENT",
            Self::Distribution => "DISTRIBUTION",
        }
    }

    /// Parse an Apple API certificate type, including the legacy iOS-only names.
    #[must_use]
    pub fn from_apple_api_string(value: &str) -> Option<Self> {
        match value {
            "DEVELOPMENT" | "IOS_DEVELOPMENT" => Some(Self::Development),
            "DISTRIBUTION" | "IOS_DISTRIBUTION" => Some(Self::Distribution),
            _ => None,
        }
    }

    /// Get human-readable certificate type name
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Development => "Apple Development",
            Self::Distribution => "Apple Distribution",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Distribution => "distribution",
        }
    }

    /// Classify a certificate by its subject common name.
    ///
    /// Covers both the unified names ("Apple Development: ...") and the
    /// legacy iOS names ("iPhone Distribution: ...").
    #[must_use]
    pub fn from_common_name(common_name: &str) -> Option<Self> {
        if common_name.starts_with("Apple Development")
            || common_name.starts_with("iPhone Developer")
            || common_name.starts_with("iOS Development")
        {
            Some(Self::Development)
        } else if common_name.starts_with("Apple Distribution")
            || common_name.starts_with("iPhone Distribution")
            || common_name.starts_with("iOS Distribution")
        {
            Some(Self::Distribution)
        } else {
            None
        }
    }

    /// Per-team limit enforced by the authority for this type.
    #[must_use]
    pub fn quota(&self) -> usize {
        match self {
            Self::Development => DEVELOPMENT_QUOTA,
            Self::Distribution => DISTRIBUTION_QUOTA,
        }
    }
}

impl std::fmt::Display for CertificateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CertificateType {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "distribution" | "dist" => Ok(Self::Distribution),
            other => Err(ReleaseError::Validation(format!(
                "Unknown certificate type '{other}' (expected development or distribution)"
            ))),
        }
    }
}

/// App Store Connect API key reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub key_id: String,
    pub issuer_id: String,
    pub private_key_path: PathBuf,
}

/// Import passwords, resolved per file by name, then by inferred type,
/// then by the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PasswordTable {
    #[serde(default)]
    pub by_file: HashMap<String, String>,
    #[serde(default)]
    pub by_type: HashMap<CertificateType, String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Upper bounds for every blocking external call, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_store_secs")]
    pub credential_store_secs: u64,
    #[serde(default = "default_archive_secs")]
    pub archive_secs: u64,
    #[serde(default = "default_export_secs")]
    pub export_secs: u64,
    #[serde(default = "default_introspection_secs")]
    pub introspection_secs: u64,
    #[serde(default = "default_processing_secs")]
    pub processing_secs: u64,
    #[serde(default = "default_upload_secs")]
    pub upload_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub processing_poll_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            credential_store_secs: default_store_secs(),
            archive_secs: default_archive_secs(),
            export_secs: default_export_secs(),
            introspection_secs: default_introspection_secs(),
            processing_secs: default_processing_secs(),
            upload_secs: default_upload_secs(),
            processing_poll_secs: default_poll_secs(),
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn credential_store(&self) -> Duration {
        Duration::from_secs(self.credential_store_secs)
    }

    #[must_use]
    pub fn archive(&self) -> Duration {
        Duration::from_secs(self.archive_secs)
    }

    #[must_use]
    pub fn export(&self) -> Duration {
        Duration::from_secs(self.export_secs)
    }

    #[must_use]
    pub fn introspection(&self) -> Duration {
        Duration::from_secs(self.introspection_secs)
    }

    #[must_use]
    pub fn processing(&self) -> Duration {
        Duration::from_secs(self.processing_secs)
    }

    #[must_use]
    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs)
    }

    #[must_use]
    pub fn processing_poll(&self) -> Duration {
        Duration::from_secs(self.processing_poll_secs)
    }
}

/// Release pipeline configuration (usually `release.toml` in the project root).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub app_identifier: String,
    pub team_id: String,
    pub scheme: String,

    /// `.xcodeproj` or `.xcworkspace`
    pub project_path: PathBuf,

    #[serde(default = "default_configuration")]
    pub configuration: String,

    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_required_types")]
    pub required_types: Vec<CertificateType>,

    #[serde(default)]
    pub bump: BumpType,

    #[serde(default)]
    pub api_key: Option<ApiKeyConfig>,

    #[serde(default)]
    pub passwords: PasswordTable,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Wait for App Store Connect to finish processing after upload
    #[serde(default = "default_true")]
    pub monitor_processing: bool,

    /// Never revoke a certificate that a still-valid profile embeds
    #[serde(default = "default_true")]
    pub protect_in_use_certificates: bool,

    /// Download Apple's WWDR intermediates into each run keychain
    #[serde(default = "default_true")]
    pub install_apple_intermediates: bool,
}

impl ReleaseConfig {
    /// Minimal config for the given identifiers; everything else defaulted.
    pub fn new(
        app_identifier: impl Into<String>,
        team_id: impl Into<String>,
        scheme: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            team_id: team_id.into(),
            scheme: scheme.into(),
            project_path: project_path.into(),
            configuration: default_configuration(),
            credentials_dir: default_credentials_dir(),
            output_dir: default_output_dir(),
            required_types: default_required_types(),
            bump: BumpType::default(),
            api_key: None,
            passwords: PasswordTable::default(),
            timeouts: Timeouts::default(),
            monitor_processing: true,
            protect_in_use_certificates: true,
            install_apple_intermediates: true,
        }
    }

    /// Load from a TOML file, then apply environment overrides.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env();
        config.expand_paths()?;
        Ok(config)
    }

    /// Environment overrides (CI/CD takes priority over the file).
    ///
    /// - `APPLE_API_KEY` + `APPLE_API_ISSUER` + `APPLE_API_KEY_PATH`
    /// - `APPLE_TEAM_ID`
    /// - `APPLE_CERTIFICATE_PASSWORD` (default import password)
    pub fn apply_env(&mut self) {
        if let (Ok(key_id), Ok(issuer_id), Ok(key_path)) = (
            std::env::var("APPLE_API_KEY"),
            std::env::var("APPLE_API_ISSUER"),
            std::env::var("APPLE_API_KEY_PATH"),
        ) {
            self.api_key = Some(ApiKeyConfig {
                key_id,
                issuer_id,
                private_key_path: key_path.into(),
            });
        }

        if let Ok(team_id) = std::env::var("APPLE_TEAM_ID") {
            self.team_id = team_id;
        }

        if let Ok(password) = std::env::var("APPLE_CERTIFICATE_PASSWORD") {
            self.passwords.default = Some(password.trim().to_string());
        }
    }

    /// Expand `~` in every configured path.
    pub fn expand_paths(&mut self) -> Result<()> {
        self.project_path = expand_tilde_path(&self.project_path)?;
        self.credentials_dir = expand_tilde_path(&self.credentials_dir)?;
        self.output_dir = expand_tilde_path(&self.output_dir)?;
        if let Some(api_key) = self.api_key.as_mut() {
            api_key.private_key_path = expand_tilde_path(&api_key.private_key_path)?;
        }
        Ok(())
    }

    /// Project root: the directory containing the project or workspace.
    /// A `project_path` without an Xcode extension is the root itself.
    #[must_use]
    pub fn project_root(&self) -> PathBuf {
        let is_container = self
            .project_path
            .extension()
            .is_some_and(|e| e == "xcodeproj" || e == "xcworkspace");
        if !is_container {
            return self.project_path.clone();
        }
        self.project_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Credentials directory resolved against the project root.
    #[must_use]
    pub fn resolved_credentials_dir(&self) -> PathBuf {
        if self.credentials_dir.is_absolute() {
            self.credentials_dir.clone()
        } else {
            self.project_root().join(&self.credentials_dir)
        }
    }

    /// Output directory resolved against the project root.
    #[must_use]
    pub fn resolved_output_dir(&self) -> PathBuf {
        if self.output_dir.is_absolute() {
            self.output_dir.clone()
        } else {
            self.project_root().join(&self.output_dir)
        }
    }
}

/// Expand tilde in path, returning error if HOME is not set
///
/// When HOME is unset, shellexpand leaves `~` unchanged.
pub fn expand_tilde_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::tilde(&raw).to_string();

    if raw.starts_with('~') && expanded.starts_with('~') {
        return Err(ReleaseError::Validation(format!(
            "Could not expand ~ in path '{raw}' (HOME environment variable not set).\n\
             Please use an absolute path instead."
        )));
    }

    Ok(PathBuf::from(expanded))
}

fn default_configuration() -> String {
    DEFAULT_CONFIGURATION.to_string()
}

fn default_credentials_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CREDENTIALS_DIR)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_required_types() -> Vec<CertificateType> {
    vec![CertificateType::Distribution]
}

fn default_true() -> bool {
    true
}

fn default_store_secs() -> u64 {
    60
}

fn default_archive_secs() -> u64 {
    900
}

fn default_export_secs() -> u64 {
    300
}

fn default_introspection_secs() -> u64 {
    30
}

fn default_processing_secs() -> u64 {
    600
}

fn default_upload_secs() -> u64 {
    1800
}

fn default_poll_secs() -> u64 {
    30
}
