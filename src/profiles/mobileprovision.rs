//! `.mobileprovision` parsing and installation
//!
//! The file is a CMS envelope around an XML property list; the plist is
//! sliced out by its `<?xml` / `</plist>` markers rather than verifying the
//! signature.

use crate::certificates::sha1_fingerprint;
use crate::error::{ProfileErrorKind, ReleaseError, Result};
use crate::model::{ProfileType, ProvisioningProfile};
use crate::repository::RemoteProfile;
use chrono::{DateTime, Utc};
use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

pub const PROFILE_EXTENSION: &str = "mobileprovision";

fn invalid(message: impl Into<String>) -> ReleaseError {
    ReleaseError::profile(ProfileErrorKind::NoCompatible, message)
}

/// Slice the embedded XML plist out of the signed envelope.
fn embedded_plist(data: &[u8]) -> Option<&[u8]> {
    const START: &[u8] = b"<?xml";
    const END: &[u8] = b"</plist>";
    let start = data.windows(START.len()).position(|w| w == START)?;
    let end = data[start..]
        .windows(END.len())
        .position(|w| w == END)
        .map(|offset| start + offset + END.len())?;
    Some(&data[start..end])
}

fn string_field<'a>(dict: &'a Dictionary, key: &str) -> Result<&'a str> {
    dict.get(key)
        .and_then(Value::as_string)
        .ok_or_else(|| invalid(format!("Profile is missing {key}")))
}

pub fn parse_mobileprovision(data: &[u8]) -> Result<ProvisioningProfile> {
    let xml = embedded_plist(data).ok_or_else(|| invalid("No property list inside profile"))?;
    let value = Value::from_reader_xml(xml)?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| invalid("Profile property list is not a dictionary"))?;

    let name = string_field(dict, "Name")?;
    let uuid = string_field(dict, "UUID")?;
    let team_id = dict
        .get("TeamIdentifier")
        .and_then(Value::as_array)
        .and_then(|teams| teams.first())
        .and_then(Value::as_string)
        .ok_or_else(|| invalid("Profile is missing TeamIdentifier"))?;

    let expires_at: DateTime<Utc> = dict
        .get("ExpirationDate")
        .and_then(Value::as_date)
        .map(|date| DateTime::<Utc>::from(std::time::SystemTime::from(date)))
        .ok_or_else(|| invalid("Profile is missing ExpirationDate"))?;

    let entitlements = dict
        .get("Entitlements")
        .and_then(Value::as_dictionary)
        .ok_or_else(|| invalid("Profile is missing Entitlements"))?;
    let application_identifier = entitlements
        .get("application-identifier")
        .and_then(Value::as_string)
        .ok_or_else(|| invalid("Profile is missing application-identifier"))?;
    let pattern = strip_team_prefix(application_identifier);

    let platform = dict
        .get("Platform")
        .and_then(Value::as_array)
        .and_then(|p| p.first())
        .and_then(Value::as_string)
        .unwrap_or("iOS");

    let fingerprints: Vec<String> = dict
        .get("DeveloperCertificates")
        .and_then(Value::as_array)
        .map(|certs| {
            certs
                .iter()
                .filter_map(Value::as_data)
                .map(sha1_fingerprint)
                .collect()
        })
        .unwrap_or_default();

    let debuggable = entitlements
        .get("get-task-allow")
        .and_then(Value::as_boolean)
        .unwrap_or(false);
    let profile_type = if debuggable || dict.contains_key("ProvisionedDevices") {
        ProfileType::Development
    } else {
        ProfileType::Distribution
    };

    Ok(ProvisioningProfile::new(
        uuid,
        name,
        team_id,
        pattern,
        platform,
        profile_type,
        fingerprints,
        expires_at,
    ))
}

/// `ABCDE12345.com.acme.app` → `com.acme.app`
fn strip_team_prefix(application_identifier: &str) -> &str {
    application_identifier
        .split_once('.')
        .map_or(application_identifier, |(_, rest)| rest)
}

pub async fn read_profile(path: &Path) -> Result<ProvisioningProfile> {
    let data = tokio::fs::read(path).await?;
    Ok(parse_mobileprovision(&data)?.with_path(path))
}

/// Every parsable profile in `dir`. Unparsable files are logged and skipped.
pub async fn load_profiles(dir: &Path) -> Result<Vec<ProvisioningProfile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(PROFILE_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut profiles = Vec::with_capacity(paths.len());
    for path in paths {
        match read_profile(&path).await {
            Ok(profile) => profiles.push(profile),
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping unreadable profile"),
        }
    }
    Ok(profiles)
}

/// Write a remote profile into `dir` as `<uuid>.mobileprovision`.
pub async fn install_profile(dir: &Path, remote: &RemoteProfile) -> Result<ProvisioningProfile> {
    tokio::fs::create_dir_all(dir).await?;
    let path = installed_path(dir, remote.profile.uuid());
    tokio::fs::write(&path, &remote.content).await?;
    tracing::info!(
        profile = remote.profile.name(),
        uuid = remote.profile.uuid(),
        path = %path.display(),
        "provisioning profile installed"
    );
    Ok(remote.profile.clone().with_path(path))
}

#[must_use]
pub fn installed_path(dir: &Path, uuid: &str) -> PathBuf {
    dir.join(format!("{uuid}.{PROFILE_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Name</key><string>Acme App Store</string>
  <key>UUID</key><string>11111111-2222-3333-4444-555555555555</string>
  <key>TeamIdentifier</key><array><string>ABCDE12345</string></array>
  <key>ExpirationDate</key><date>2099-01-01T00:00:00Z</date>
  <key>Platform</key><array><string>iOS</string></array>
  <key>Entitlements</key>
  <dict>
    <key>application-identifier</key><string>ABCDE12345.com.acme.*</string>
    <key>get-task-allow</key><false/>
  </dict>
  <key>DeveloperCertificates</key><array><data>YWJj</data></array>
</dict>
</plist>"#;

    fn wrapped() -> Vec<u8> {
        let mut data = vec![0x30, 0x82, 0x01, 0x00];
        data.extend_from_slice(PROFILE_XML.as_bytes());
        data.extend_from_slice(&[0xA0, 0x00]);
        data
    }

    #[test]
    fn parses_signed_profile() {
        let profile = parse_mobileprovision(&wrapped()).unwrap();
        assert_eq!(profile.uuid(), "11111111-2222-3333-4444-555555555555");
        assert_eq!(profile.team_id(), "ABCDE12345");
        assert_eq!(profile.identifier_pattern(), "com.acme.*");
        assert_eq!(profile.profile_type(), ProfileType::Distribution);
        assert_eq!(
            profile.certificate_fingerprints(),
            &["A9993E364706816ABA3E25717850C26C9CD0D89D".to_string()]
        );
        assert!(profile.matches_app_identifier("com.acme.widget"));
    }

    #[test]
    fn rejects_non_profiles() {
        assert!(parse_mobileprovision(b"garbage").is_err());
    }

    #[tokio::test]
    async fn load_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("good.mobileprovision"), wrapped())
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("bad.mobileprovision"), b"nope")
            .await
            .unwrap();
        let profiles = load_profiles(dir.path()).await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert!(profiles[0].path().is_some());
    }
}
