//! In-memory adapters and on-the-fly signing fixtures shared by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kodegen_release::certificates::{CertificateDetails, build_pkcs12, read_pkcs12};
use kodegen_release::config::{CertificateType, ReleaseConfig, Timeouts};
use kodegen_release::error::{ReleaseError, Result, StoreErrorKind};
use kodegen_release::keychain::{
    CredentialStore, IntermediateCertificate, IntermediateSource, StoreItem,
};
use kodegen_release::model::{
    BuildNumber, Certificate, MarketingVersion, ProfileType, ProvisioningProfile, VersionInfo,
};
use kodegen_release::repository::{
    ArchiveOutcome, BuildRepository, BuildStatus, CertificateRepository, CreatedCertificate,
    ExportOptions, ExportOutcome, ProfileRepository, RemoteProfile, SigningConfig, UploadOptions,
    UploadReceipt, UploadRepository,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroizing;

pub const TEAM: &str = "ABCDE12345";
pub const OTHER_TEAM: &str = "ZZZZZ99999";
pub const APP: &str = "com.acme.widget";
pub const PASSWORD: &str = "secret";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Self-signed certificate shaped like an Apple signing identity.
pub struct Identity {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub common_name: String,
}

impl Identity {
    pub fn new(cert_type: CertificateType, team: &str, expired: bool) -> Self {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, date_time_ymd};

        let common_name = format!("{}: Test Signer ({team})", cert_type.display_name());
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name.as_str());
        dn.push(DnType::OrganizationalUnitName, team);
        params.distinguished_name = dn;
        if expired {
            params.not_before = date_time_ymd(2020, 1, 1);
            params.not_after = date_time_ymd(2021, 1, 1);
        } else {
            params.not_before = date_time_ymd(2024, 1, 1);
            params.not_after = date_time_ymd(2099, 1, 1);
        }
        let cert = params.self_signed(&key).unwrap();

        Self {
            cert_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
            common_name,
        }
    }

    pub fn details(&self) -> CertificateDetails {
        CertificateDetails::from_der(&self.cert_der).unwrap()
    }

    pub fn fingerprint(&self) -> String {
        self.details().fingerprint
    }

    pub fn certificate(&self, id: &str) -> Certificate {
        self.details().to_certificate(Some(id), None).unwrap()
    }

    pub fn p12(&self, password: &str) -> Vec<u8> {
        build_pkcs12(&self.cert_der, &self.key_der, password, &self.common_name).unwrap()
    }

    pub fn write_p12(&self, dir: &Path, file_name: &str, password: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(file_name);
        std::fs::write(&path, self.p12(password)).unwrap();
        path
    }
}

/// `.mobileprovision` content: an XML plist wrapped in junk bytes standing
/// in for the CMS envelope.
pub fn profile_bytes(
    name: &str,
    uuid: &str,
    team: &str,
    pattern: &str,
    identities: &[&Identity],
    profile_type: ProfileType,
    expires_at: DateTime<Utc>,
) -> Vec<u8> {
    use plist::{Dictionary, Value};

    let mut entitlements = Dictionary::new();
    entitlements.insert(
        "application-identifier".into(),
        Value::String(format!("{team}.{pattern}")),
    );
    entitlements.insert(
        "get-task-allow".into(),
        Value::Boolean(profile_type == ProfileType::Development),
    );

    let mut dict = Dictionary::new();
    dict.insert("Name".into(), Value::String(name.into()));
    dict.insert("UUID".into(), Value::String(uuid.into()));
    dict.insert(
        "TeamIdentifier".into(),
        Value::Array(vec![Value::String(team.into())]),
    );
    dict.insert(
        "ExpirationDate".into(),
        Value::Date(plist::Date::from(std::time::SystemTime::from(expires_at))),
    );
    dict.insert(
        "Platform".into(),
        Value::Array(vec![Value::String("iOS".into())]),
    );
    dict.insert("Entitlements".into(), Value::Dictionary(entitlements));
    dict.insert(
        "DeveloperCertificates".into(),
        Value::Array(
            identities
                .iter()
                .map(|i| Value::Data(i.cert_der.clone()))
                .collect(),
        ),
    );

    let mut xml = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();

    let mut data = vec![0x30, 0x80];
    data.extend_from_slice(&xml);
    data.extend_from_slice(&[0x00, 0x00]);
    data
}

pub fn far_future() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2099-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn long_ago() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Config rooted in `dir` with short timeouts and the fixture password as
/// default import password.
pub fn config(dir: &Path) -> ReleaseConfig {
    let mut config = ReleaseConfig::new(APP, TEAM, "App", dir.join("App.xcodeproj"));
    config.credentials_dir = dir.join("certificates");
    config.output_dir = dir.join("build");
    config.passwords.default = Some(PASSWORD.to_string());
    config.timeouts = Timeouts {
        processing_secs: 3,
        processing_poll_secs: 1,
        ..Timeouts::default()
    };
    config
}

// ---------------------------------------------------------------------------
// Credential store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    keychains: HashMap<String, Vec<StoreItem>>,
    destroyed: Vec<String>,
    imports: usize,
    fail_create: bool,
    fail_list: bool,
    /// Imports left whose key becomes inaccessible after the next listing
    access_losses: usize,
    losing_access: HashSet<String>,
    /// (keychain, fingerprint) of certificates imported without a key
    intermediates: Vec<(String, String)>,
}

/// Keychains as in-memory item lists. Import really opens the P12, so a
/// wrong password fails the same way `security import` does.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn failing_create() -> Self {
        let store = Self::default();
        store.state.lock().unwrap().fail_create = true;
        store
    }

    pub fn failing_list() -> Self {
        let store = Self::default();
        store.state.lock().unwrap().fail_list = true;
        store
    }

    /// The next `imports` imports are listed once as signing-capable, then
    /// their key stops being accessible until imported again.
    pub fn losing_access(imports: usize) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().access_losses = imports;
        store
    }

    pub fn intermediates(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().intermediates.clone()
    }

    pub fn items(&self, name: &str) -> Vec<StoreItem> {
        self.state
            .lock()
            .unwrap()
            .keychains
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_keychains(&self) -> Vec<String> {
        self.state.lock().unwrap().keychains.keys().cloned().collect()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn import_count(&self) -> usize {
        self.state.lock().unwrap().imports
    }

    pub fn seed(&self, name: &str, item: StoreItem) {
        self.state
            .lock()
            .unwrap()
            .keychains
            .entry(name.to_string())
            .or_default()
            .push(item);
    }
}

#[async_trait]
impl CredentialStore for FakeStore {
    async fn create(&self, name: &str, _password: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(ReleaseError::store(
                StoreErrorKind::CommandFailed,
                "create-keychain failed",
            ));
        }
        state.keychains.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn unlock(&self, name: &str, _password: &str) -> Result<()> {
        if self.state.lock().unwrap().keychains.contains_key(name) {
            Ok(())
        } else {
            Err(ReleaseError::store(
                StoreErrorKind::Locked,
                format!("The specified keychain could not be found: {name}"),
            ))
        }
    }

    async fn import(&self, path: &Path, password: &str, name: &str) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        let contents = read_pkcs12(&data, password).map_err(|e| {
            ReleaseError::store(StoreErrorKind::CommandFailed, format!("import failed: {e}"))
        })?;

        let mut state = self.state.lock().unwrap();
        state.imports += 1;
        let fingerprint = contents.details.fingerprint.clone();
        let items = state.keychains.entry(name.to_string()).or_default();
        match items.iter_mut().find(|i| i.fingerprint == fingerprint) {
            Some(existing) => existing.signing_capable = contents.has_private_key,
            None => items.push(StoreItem::from_details(
                contents.details,
                contents.has_private_key,
            )),
        }
        if state.access_losses > 0 {
            state.access_losses -= 1;
            state.losing_access.insert(fingerprint);
        }
        Ok(())
    }

    async fn import_certificate(&self, path: &Path, name: &str) -> Result<()> {
        let der = tokio::fs::read(path).await?;
        let details = CertificateDetails::from_der(&der)?;
        let mut state = self.state.lock().unwrap();
        if !state.keychains.contains_key(name) {
            return Err(ReleaseError::store(
                StoreErrorKind::CommandFailed,
                format!("The specified keychain could not be found: {name}"),
            ));
        }
        state
            .intermediates
            .push((name.to_string(), details.fingerprint));
        Ok(())
    }

    async fn set_access_control(&self, _name: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    async fn list(
        &self,
        name: &str,
        type_filter: Option<CertificateType>,
    ) -> Result<Vec<StoreItem>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(ReleaseError::store(
                StoreErrorKind::CommandFailed,
                "security find-certificate failed",
            ));
        }

        let StoreState {
            keychains,
            losing_access,
            ..
        } = &mut *state;
        let Some(items) = keychains.get_mut(name) else {
            return Ok(Vec::new());
        };
        let listed: Vec<StoreItem> = items
            .iter()
            .filter(|i| type_filter.is_none_or(|t| i.cert_type() == Some(t)))
            .cloned()
            .collect();
        for item in items.iter_mut() {
            if listed.iter().any(|l| l.fingerprint == item.fingerprint)
                && losing_access.remove(&item.fingerprint)
            {
                item.signing_capable = false;
            }
        }
        Ok(listed)
    }

    async fn delete(&self, fingerprint: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(items) = state.keychains.get_mut(name) {
            items.retain(|i| !i.fingerprint.eq_ignore_ascii_case(fingerprint));
        }
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.keychains.remove(name);
        state.destroyed.push(name.to_string());
        Ok(())
    }
}

/// Intermediates generated on the fly, or a failing download.
pub struct FakeIntermediates {
    certificates: Option<Vec<IntermediateCertificate>>,
}

impl FakeIntermediates {
    pub fn new(count: usize) -> Self {
        let certificates = (0..count)
            .map(|i| {
                let key = rcgen::KeyPair::generate().unwrap();
                let cert = rcgen::CertificateParams::new(vec![])
                    .unwrap()
                    .self_signed(&key)
                    .unwrap();
                IntermediateCertificate::from_der(format!("TestWWDR{i}"), cert.der().to_vec())
                    .unwrap()
            })
            .collect();
        Self {
            certificates: Some(certificates),
        }
    }

    pub fn unreachable() -> Self {
        Self { certificates: None }
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.certificates
            .iter()
            .flatten()
            .map(|c| CertificateDetails::from_der(&c.der).unwrap().fingerprint)
            .collect()
    }
}

#[async_trait]
impl IntermediateSource for FakeIntermediates {
    async fn fetch(&self) -> Result<Vec<IntermediateCertificate>> {
        self.certificates.clone().ok_or_else(|| {
            ReleaseError::store(
                StoreErrorKind::TrustChain,
                "Could not connect to Apple servers. Check network/firewall.",
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Remote authority
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AuthorityState {
    certificates: Vec<Certificate>,
    created: Vec<CertificateType>,
    revoked: Vec<String>,
    profiles: Vec<RemoteProfile>,
    created_profiles: Vec<ProfileType>,
    next_id: usize,
}

/// Certificate and profile repository with a fixed initial inventory.
#[derive(Default)]
pub struct FakeAuthority {
    state: Mutex<AuthorityState>,
}

impl FakeAuthority {
    pub fn with_certificates(certificates: Vec<Certificate>) -> Self {
        let authority = Self::default();
        authority.state.lock().unwrap().certificates = certificates;
        authority
    }

    pub fn add_profile(&self, profile: RemoteProfile) {
        self.state.lock().unwrap().profiles.push(profile);
    }

    pub fn created(&self) -> Vec<CertificateType> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.state.lock().unwrap().revoked.clone()
    }

    pub fn created_profiles(&self) -> Vec<ProfileType> {
        self.state.lock().unwrap().created_profiles.clone()
    }
}

#[async_trait]
impl CertificateRepository for FakeAuthority {
    async fn list_certificates(
        &self,
        _team_id: &str,
        cert_type: CertificateType,
    ) -> Result<Vec<Certificate>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .certificates
            .iter()
            .filter(|c| c.cert_type() == cert_type)
            .cloned()
            .collect())
    }

    async fn create_certificate(
        &self,
        team_id: &str,
        cert_type: CertificateType,
    ) -> Result<CreatedCertificate> {
        let identity = Identity::new(cert_type, team_id, false);
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("NEW{}", state.next_id);
        let certificate = identity.certificate(&id);
        state.certificates.push(certificate.clone());
        state.created.push(cert_type);

        Ok(CreatedCertificate {
            certificate,
            certificate_der: identity.cert_der,
            private_key_der: Zeroizing::new(identity.key_der),
        })
    }

    async fn revoke_certificate(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.certificates.retain(|c| c.id() != id);
        state.revoked.push(id.to_string());
        Ok(())
    }
}

#[async_trait]
impl ProfileRepository for FakeAuthority {
    async fn list_profiles(&self, app_identifier: &str, team_id: &str) -> Result<Vec<RemoteProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .profiles
            .iter()
            .filter(|p| p.profile.team_id() == team_id)
            .filter(|p| p.profile.matches_app_identifier(app_identifier))
            .cloned()
            .collect())
    }

    async fn create_profile(
        &self,
        app_identifier: &str,
        certificates: &[Certificate],
        team_id: &str,
        profile_type: ProfileType,
    ) -> Result<RemoteProfile> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let uuid = format!("00000000-0000-0000-0000-{:012}", state.next_id);
        let profile = ProvisioningProfile::new(
            &uuid,
            format!("{app_identifier} {}", profile_type.export_method()),
            team_id,
            app_identifier,
            "iOS",
            profile_type,
            certificates.iter().map(|c| c.thumbprint().to_string()),
            far_future(),
        )
        .with_authority_id(format!("PROFILE{}", state.next_id));
        let remote = RemoteProfile {
            profile,
            content: b"signed profile".to_vec(),
        };
        state.profiles.push(remote.clone());
        state.created_profiles.push(profile_type);
        Ok(remote)
    }
}

// ---------------------------------------------------------------------------
// Build toolchain and uploads
// ---------------------------------------------------------------------------

struct BuildState {
    version: VersionInfo,
    calls: Vec<String>,
    fail_archive: bool,
    last_signing: Option<SigningConfig>,
    last_export: Option<ExportOptions>,
}

/// Records calls; archive creates the archive directory and export writes
/// an `.ipa`.
pub struct FakeBuilds {
    state: Mutex<BuildState>,
}

impl FakeBuilds {
    pub fn at_version(marketing: &str, build: u64) -> Self {
        Self {
            state: Mutex::new(BuildState {
                version: VersionInfo {
                    marketing: MarketingVersion::parse(marketing).unwrap(),
                    build: BuildNumber(build),
                },
                calls: Vec::new(),
                fail_archive: false,
                last_signing: None,
                last_export: None,
            }),
        }
    }

    pub fn failing_archive(self) -> Self {
        self.state.lock().unwrap().fail_archive = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn version(&self) -> VersionInfo {
        self.state.lock().unwrap().version
    }

    pub fn last_signing(&self) -> Option<SigningConfig> {
        self.state.lock().unwrap().last_signing.clone()
    }

    pub fn last_export(&self) -> Option<ExportOptions> {
        self.state.lock().unwrap().last_export.clone()
    }
}

#[async_trait]
impl BuildRepository for FakeBuilds {
    async fn archive(
        &self,
        _project_path: &Path,
        _scheme: &str,
        _configuration: &str,
        output_path: &Path,
        signing: &SigningConfig,
    ) -> Result<ArchiveOutcome> {
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.calls.push("archive".to_string());
            state.last_signing = Some(signing.clone());
            state.fail_archive
        };
        if fail {
            return Ok(ArchiveOutcome {
                success: false,
                archive_path: output_path.to_path_buf(),
                logs: "error: No signing certificate \"iOS Distribution\" found".to_string(),
            });
        }
        tokio::fs::create_dir_all(output_path.join("Products")).await?;
        Ok(ArchiveOutcome {
            success: true,
            archive_path: output_path.to_path_buf(),
            logs: "** ARCHIVE SUCCEEDED **".to_string(),
        })
    }

    async fn export_package(
        &self,
        _archive_path: &Path,
        options: &ExportOptions,
        output_dir: &Path,
    ) -> Result<ExportOutcome> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push("export".to_string());
            state.last_export = Some(options.clone());
        }
        tokio::fs::create_dir_all(output_dir).await?;
        let package = output_dir.join("App.ipa");
        tokio::fs::write(&package, b"PK\x03\x04 fake ipa").await?;
        Ok(ExportOutcome {
            success: true,
            package_path: Some(package),
            logs: "** EXPORT SUCCEEDED **".to_string(),
        })
    }

    async fn list_schemes(&self, _project_path: &Path) -> Result<Vec<String>> {
        Ok(vec!["App".to_string()])
    }

    async fn read_build_settings(
        &self,
        _project_path: &Path,
        _scheme: &str,
        _configuration: &str,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([(
            "PRODUCT_BUNDLE_IDENTIFIER".to_string(),
            APP.to_string(),
        )]))
    }

    async fn read_version(&self, _project_path: &Path) -> Result<VersionInfo> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("read_version".to_string());
        Ok(state.version)
    }

    async fn write_version(&self, _project_path: &Path, version: &VersionInfo) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("write_version".to_string());
        state.version = *version;
        Ok(())
    }
}

/// Accepts every upload and replays a scripted list of processing states;
/// the last state repeats.
pub struct FakeUploads {
    statuses: Mutex<VecDeque<BuildStatus>>,
    uploads: Mutex<Vec<UploadOptions>>,
}

impl FakeUploads {
    pub fn with_statuses(statuses: Vec<BuildStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn uploads(&self) -> Vec<UploadOptions> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadRepository for FakeUploads {
    async fn upload_build(
        &self,
        _package_path: &Path,
        options: &UploadOptions,
    ) -> Result<UploadReceipt> {
        self.uploads.lock().unwrap().push(options.clone());
        Ok(UploadReceipt {
            delivery_id: Some("0f4b2a5e-6c1d-4e8f-9a3b-7d2c1e0f9a8b".to_string()),
            message: "No errors uploading".to_string(),
        })
    }

    async fn get_build_status(
        &self,
        _app_identifier: &str,
        _build_number: &str,
    ) -> Result<BuildStatus> {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            Ok(statuses.pop_front().unwrap_or(BuildStatus::NotFound))
        } else {
            Ok(statuses.front().cloned().unwrap_or(BuildStatus::NotFound))
        }
    }
}
