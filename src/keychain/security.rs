//! `CredentialStore` over the macOS `security` command

use super::{CredentialStore, StoreItem};
use crate::certificates::CertificateDetails;
use crate::config::CertificateType;
use crate::error::{ReleaseError, Result, StoreErrorKind};
use crate::process::{failure_text, run_tool};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keychain access through `/usr/bin/security`.
///
/// Bare keychain names resolve to `~/Library/Keychains/<name>`; anything
/// containing a path separator is used as-is.
#[derive(Debug, Clone)]
pub struct SecurityCli {
    timeout: Duration,
}

/// File path of a keychain given by name. Names containing `/` are taken
/// as paths.
pub fn keychain_path(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        return Ok(PathBuf::from(name));
    }
    Ok(dirs::home_dir()
        .ok_or_else(|| ReleaseError::Validation("HOME not set".to_string()))?
        .join("Library/Keychains")
        .join(name))
}

impl SecurityCli {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn security(&self, args: &[&str], keychain: &Path) -> Result<std::process::Output> {
        let mut full: Vec<&std::ffi::OsStr> = args.iter().map(std::ffi::OsStr::new).collect();
        full.push(keychain.as_os_str());
        run_tool("security", full, self.timeout, None, &[]).await
    }

    async fn security_checked(&self, args: &[&str], keychain: &Path) -> Result<String> {
        let output = self.security(args, keychain).await?;
        if !output.status.success() {
            return Err(classify_failure(args[0], &failure_text(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn search_list(&self) -> Result<Vec<String>> {
        let output = run_tool(
            "security",
            ["list-keychains", "-d", "user"],
            self.timeout,
            None,
            &[],
        )
        .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().trim_matches('"').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn set_search_list(&self, keychains: &[String]) -> Result<()> {
        let mut args = vec!["list-keychains".to_string(), "-d".into(), "user".into(), "-s".into()];
        args.extend(keychains.iter().cloned());
        let output = run_tool("security", &args, self.timeout, None, &[]).await?;
        if !output.status.success() {
            return Err(classify_failure("list-keychains", &failure_text(&output)));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SecurityCli {
    async fn create(&self, name: &str, password: &str) -> Result<()> {
        let path = keychain_path(name)?;
        self.security_checked(&["create-keychain", "-p", password], &path)
            .await?;

        // 1 hour lock timeout, no lock on sleep
        self.security_checked(&["set-keychain-settings", "-t", "3600", "-u"], &path)
            .await?;

        // codesign only finds identities in keychains on the search list
        let mut keychains = self.search_list().await?;
        let path_str = path.to_string_lossy().to_string();
        if !keychains.contains(&path_str) {
            keychains.push(path_str);
            self.set_search_list(&keychains).await?;
        }
        Ok(())
    }

    async fn unlock(&self, name: &str, password: &str) -> Result<()> {
        let path = keychain_path(name)?;
        self.security_checked(&["unlock-keychain", "-p", password], &path)
            .await
            .map(|_| ())
    }

    async fn import(&self, file: &Path, password: &str, name: &str) -> Result<()> {
        let path = keychain_path(name)?;
        let file_str = file
            .to_str()
            .ok_or_else(|| ReleaseError::Validation("Invalid certificate path".to_string()))?;
        let output = self
            .security(
                &[
                    "import",
                    file_str,
                    "-P",
                    password,
                    "-T",
                    "/usr/bin/codesign",
                    "-T",
                    "/usr/bin/security",
                    "-T",
                    "/usr/bin/productbuild",
                    "-k",
                ],
                &path,
            )
            .await?;

        if !output.status.success() {
            let stderr = failure_text(&output);
            if stderr.contains("already exists") {
                return Ok(());
            }
            return Err(classify_failure("import", &stderr));
        }
        Ok(())
    }

    async fn import_certificate(&self, file: &Path, name: &str) -> Result<()> {
        let path = keychain_path(name)?;
        let file_str = file
            .to_str()
            .ok_or_else(|| ReleaseError::Validation("Invalid certificate path".to_string()))?;
        let output = self.security(&["import", file_str, "-A", "-k"], &path).await?;

        if !output.status.success() {
            let stderr = failure_text(&output);
            if stderr.contains("already exists") {
                return Ok(());
            }
            return Err(classify_failure("import", &stderr));
        }
        Ok(())
    }

    async fn set_access_control(&self, name: &str, password: &str) -> Result<()> {
        let path = keychain_path(name)?;
        self.security_checked(
            &[
                "set-key-partition-list",
                "-S",
                "apple-tool:,apple:,codesign:",
                "-s",
                "-k",
                password,
            ],
            &path,
        )
        .await
        .map(|_| ())
    }

    async fn list(
        &self,
        name: &str,
        type_filter: Option<CertificateType>,
    ) -> Result<Vec<StoreItem>> {
        let path = keychain_path(name)?;
        let pem = self
            .security_checked(&["find-certificate", "-a", "-p"], &path)
            .await?;
        let identities = identities_or_warn(
            self.security_checked(&["find-identity", "-v", "-p", "codesigning"], &path)
                .await,
            name,
        );

        let items = parse_find_certificate_output(&pem, &identities)?;
        Ok(items
            .into_iter()
            .filter(|item| match type_filter {
                Some(t) => item.cert_type() == Some(t),
                None => item.cert_type().is_some(),
            })
            .collect())
    }

    async fn delete(&self, fingerprint: &str, name: &str) -> Result<()> {
        let path = keychain_path(name)?;
        // delete-identity removes the certificate and its private key
        let output = self
            .security(&["delete-identity", "-Z", fingerprint], &path)
            .await?;
        if output.status.success() {
            return Ok(());
        }
        self.security_checked(&["delete-certificate", "-Z", fingerprint], &path)
            .await
            .map(|_| ())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let path = keychain_path(name)?;
        let path_str = path.to_string_lossy().to_string();

        match self.search_list().await {
            Ok(keychains) => {
                let remaining: Vec<String> =
                    keychains.into_iter().filter(|k| *k != path_str).collect();
                if let Err(e) = self.set_search_list(&remaining).await {
                    tracing::warn!(keychain = name, error = %e, "keychain left on search list");
                }
            }
            Err(e) => tracing::warn!(keychain = name, error = %e, "search list unreadable"),
        }

        self.security_checked(&["delete-keychain"], &path)
            .await
            .map(|_| ())
    }
}

fn classify_failure(command: &str, stderr: &str) -> ReleaseError {
    let lower = stderr.to_lowercase();
    let kind = if lower.contains("locked") || lower.contains("user interaction is not allowed") {
        StoreErrorKind::Locked
    } else if lower.contains("not permitted")
        || lower.contains("denied")
        || lower.contains("authorization")
    {
        StoreErrorKind::AccessDenied
    } else {
        StoreErrorKind::CommandFailed
    };
    ReleaseError::store(kind, format!("security {command} failed: {stderr}"))
}

/// Parse `security find-certificate -a -p` output.
///
/// `identities` holds the SHA-1 hashes that have a private key.
pub fn parse_find_certificate_output(
    pem: &str,
    identities: &HashSet<String>,
) -> Result<Vec<StoreItem>> {
    Ok(CertificateDetails::from_pem_bundle(pem)?
        .into_iter()
        .map(|details| {
            let capable = identities.contains(&details.fingerprint);
            StoreItem::from_details(details, capable)
        })
        .collect())
}

/// Identity hashes from a `find-identity` run. A failed run is logged and
/// lists every certificate as not signing-capable.
fn identities_or_warn(output: Result<String>, keychain: &str) -> HashSet<String> {
    match output {
        Ok(out) => parse_identity_hashes(&out),
        Err(e) => {
            tracing::warn!(keychain, error = %e, "find-identity failed, no signing identities listed");
            HashSet::new()
        }
    }
}

/// Parse `security find-identity -v` output into SHA-1 hashes.
///
/// Format: `  1) 0123ABCD... "Apple Distribution: Acme (ABCDE12345)"`
#[must_use]
pub fn parse_identity_hashes(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let (_, rest) = trimmed.split_once(") ")?;
            let hash = rest.split_whitespace().next()?;
            (hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit()))
                .then(|| hash.to_ascii_uppercase())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity_hashes() {
        let out = r#"
  1) 0123456789ABCDEF0123456789ABCDEF01234567 "Apple Distribution: Acme (ABCDE12345)"
  2) fedcba9876543210fedcba9876543210fedcba98 "Apple Development: Jo (ABCDE12345)"
     2 valid identities found
"#;
        let hashes = parse_identity_hashes(out);
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains("0123456789ABCDEF0123456789ABCDEF01234567"));
        assert!(hashes.contains("FEDCBA9876543210FEDCBA9876543210FEDCBA98"));
    }

    #[test]
    fn listing_marks_only_identities_signing_capable() {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

        let pem_for = |cn: &str| {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(vec![]).unwrap();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, cn);
            dn.push(DnType::OrganizationalUnitName, "ABCDE12345");
            params.distinguished_name = dn;
            let cert = params.self_signed(&key).unwrap();
            (cert.pem(), crate::certificates::sha1_fingerprint(cert.der()))
        };
        let (with_key, with_key_hash) = pem_for("Apple Distribution: Acme (ABCDE12345)");
        let (cert_only, _) = pem_for("Apple Development: Jo (ABCDE12345)");

        let identities = HashSet::from([with_key_hash.clone()]);
        let items =
            parse_find_certificate_output(&format!("{with_key}{cert_only}"), &identities).unwrap();

        assert_eq!(items.len(), 2);
        assert!(items[0].signing_capable);
        assert_eq!(items[0].fingerprint, with_key_hash);
        assert!(!items[1].signing_capable);
    }

    #[test]
    fn failed_identity_lookup_lists_no_identities() {
        let failed = Err(classify_failure("find-identity", "security: command failed"));
        assert!(identities_or_warn(failed, "run.keychain-db").is_empty());

        let ok = Ok(r#"  1) 0123456789ABCDEF0123456789ABCDEF01234567 "Apple Distribution: Acme (ABCDE12345)""#.to_string());
        assert_eq!(identities_or_warn(ok, "run.keychain-db").len(), 1);
    }

    #[test]
    fn classifies_locked_keychain() {
        let e = classify_failure("import", "SecKeychainItemImport: User interaction is not allowed.");
        assert!(matches!(
            e,
            ReleaseError::CredentialStore {
                kind: StoreErrorKind::Locked,
                ..
            }
        ));
    }
}
