//! `-exportOptionsPlist` generation

use crate::error::Result;
use crate::repository::ExportOptions;
use plist::{Dictionary, Value};
use std::path::Path;

/// Dictionary Xcode expects for a manually signed export.
#[must_use]
pub fn export_options_plist(options: &ExportOptions) -> Value {
    let mut profiles = Dictionary::new();
    for (bundle_id, profile_name) in &options.provisioning_profiles {
        profiles.insert(bundle_id.clone(), Value::String(profile_name.clone()));
    }

    let mut dict = Dictionary::new();
    dict.insert("method".into(), Value::String(options.method.clone()));
    dict.insert("teamID".into(), Value::String(options.team_id.clone()));
    dict.insert("signingStyle".into(), Value::String("manual".into()));
    dict.insert(
        "signingCertificate".into(),
        Value::String(options.signing_certificate.clone()),
    );
    dict.insert("provisioningProfiles".into(), Value::Dictionary(profiles));
    dict.insert("uploadSymbols".into(), Value::Boolean(options.upload_symbols));
    dict.insert("destination".into(), Value::String("export".into()));
    Value::Dictionary(dict)
}

pub fn write_export_options(options: &ExportOptions, path: &Path) -> Result<()> {
    export_options_plist(options).to_file_xml(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn options() -> ExportOptions {
        ExportOptions {
            method: "app-store".to_string(),
            team_id: "ABCDE12345".to_string(),
            signing_certificate: "Apple Distribution".to_string(),
            provisioning_profiles: BTreeMap::from([(
                "com.acme.app".to_string(),
                "Acme App Store".to_string(),
            )]),
            upload_symbols: true,
        }
    }

    #[test]
    fn writes_manual_signing_plist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ExportOptions.plist");
        write_export_options(&options(), &path).unwrap();

        let value = Value::from_file(&path).unwrap();
        let dict = value.as_dictionary().unwrap();
        assert_eq!(dict.get("method").and_then(Value::as_string), Some("app-store"));
        assert_eq!(dict.get("signingStyle").and_then(Value::as_string), Some("manual"));
        let profiles = dict
            .get("provisioningProfiles")
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(
            profiles.get("com.acme.app").and_then(Value::as_string),
            Some("Acme App Store")
        );
    }
}
