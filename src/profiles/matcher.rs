//! Profile compatibility resolution

use super::mobileprovision::{install_profile, load_profiles};
use crate::context::ReleaseContext;
use crate::error::{ProfileErrorKind, ReleaseError, Result};
use crate::model::{Certificate, ProfileType, ProvisioningProfile};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Profiles compatible with `app_identifier`, `team_id` and every
/// certificate in `certificates`.
///
/// Expired profiles are dropped first. Exact identifier matches sort before
/// wildcard matches, then later expiration first.
#[must_use]
pub fn find_compatible(
    profiles: &[ProvisioningProfile],
    app_identifier: &str,
    certificates: &[Certificate],
    team_id: &str,
    now: DateTime<Utc>,
) -> Vec<ProvisioningProfile> {
    let mut compatible: Vec<ProvisioningProfile> = profiles
        .iter()
        .filter(|p| !p.is_expired_at(now))
        .filter(|p| p.team_id() == team_id)
        .filter(|p| p.matches_app_identifier(app_identifier))
        .filter(|p| p.embeds_all(certificates))
        .cloned()
        .collect();

    compatible.sort_by_key(|p| {
        (
            p.identifier_pattern() != app_identifier,
            std::cmp::Reverse(p.expires_at()),
        )
    });
    compatible
}

/// Resolves, and when possible creates, the profile a build will be
/// signed with.
pub struct ProfileMatcher {
    ctx: ReleaseContext,
}

impl ProfileMatcher {
    #[must_use]
    pub fn new(ctx: ReleaseContext) -> Self {
        Self { ctx }
    }

    /// Local profiles from the credentials directory plus, with remote
    /// credentials, the authority's profiles for the app. Deduplicated by
    /// UUID; remote profiles are installed locally.
    pub async fn known_profiles(&self, app_identifier: &str, team_id: &str) -> Vec<ProvisioningProfile> {
        let dir = self.ctx.config().resolved_credentials_dir();
        let mut profiles = match load_profiles(&dir).await {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "could not scan local profiles");
                Vec::new()
            }
        };

        if let Some(remote) = self.ctx.profiles() {
            match remote.list_profiles(app_identifier, team_id).await {
                Ok(listed) => {
                    let mut seen: HashSet<String> =
                        profiles.iter().map(|p| p.uuid().to_string()).collect();
                    for entry in listed {
                        if !seen.insert(entry.profile.uuid().to_string()) {
                            continue;
                        }
                        match install_profile(&dir, &entry).await {
                            Ok(installed) => profiles.push(installed),
                            Err(e) => {
                                tracing::warn!(uuid = entry.profile.uuid(), error = %e, "could not install profile");
                                profiles.push(entry.profile);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(source = "remote", error = %e, "profile listing failed");
                }
            }
        }
        profiles
    }

    pub async fn find_compatible(
        &self,
        app_identifier: &str,
        certificates: &[Certificate],
        team_id: &str,
    ) -> Vec<ProvisioningProfile> {
        let profiles = self.known_profiles(app_identifier, team_id).await;
        find_compatible(&profiles, app_identifier, certificates, team_id, Utc::now())
    }

    /// Best profile of the certificate's type; created through the
    /// authority when none is compatible.
    pub async fn ensure_profile(
        &self,
        app_identifier: &str,
        certificate: &Certificate,
        team_id: &str,
    ) -> Result<ProvisioningProfile> {
        let profile_type = ProfileType::for_certificate(certificate.cert_type());
        let now = Utc::now();
        let profiles = self.known_profiles(app_identifier, team_id).await;
        let certificates = std::slice::from_ref(certificate);

        if let Some(profile) = find_compatible(&profiles, app_identifier, certificates, team_id, now)
            .into_iter()
            .find(|p| p.profile_type() == profile_type)
        {
            tracing::info!(
                team = team_id,
                app = app_identifier,
                profile = profile.name(),
                uuid = profile.uuid(),
                "compatible profile found"
            );
            return Ok(profile);
        }

        if let Some(remote) = self.ctx.profiles() {
            let created = remote
                .create_profile(app_identifier, certificates, team_id, profile_type)
                .await?;
            let dir = self.ctx.config().resolved_credentials_dir();
            let installed = install_profile(&dir, &created).await?;
            tracing::info!(
                team = team_id,
                app = app_identifier,
                profile = installed.name(),
                status = "created",
                "provisioning profile created"
            );
            return Ok(installed);
        }

        // Distinguish "only expired ones match" from "nothing matches"
        let expired_match = profiles.iter().any(|p| {
            p.is_expired_at(now)
                && p.team_id() == team_id
                && p.matches_app_identifier(app_identifier)
                && p.embeds(certificate)
        });
        if expired_match {
            return Err(ReleaseError::profile(
                ProfileErrorKind::Expired,
                format!("Every profile for {app_identifier} with {} has expired", certificate.name()),
            ));
        }
        Err(ReleaseError::profile(
            ProfileErrorKind::NoCompatible,
            format!(
                "No {} profile for {app_identifier} (team {team_id}) includes {}",
                profile_type.export_method(),
                certificate.name()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertificateType;
    use chrono::Duration;

    fn cert(fingerprint: &str) -> Certificate {
        Certificate::new(
            fingerprint,
            "Apple Distribution: Acme",
            CertificateType::Distribution,
            Utc::now() + Duration::days(200),
            "01",
            fingerprint,
        )
    }

    fn profile(uuid: &str, pattern: &str, fingerprints: &[&str], days: i64) -> ProvisioningProfile {
        ProvisioningProfile::new(
            uuid,
            format!("Profile {uuid}"),
            "ABCDE12345",
            pattern,
            "iOS",
            ProfileType::Distribution,
            fingerprints.iter().map(|f| f.to_string()),
            Utc::now() + Duration::days(days),
        )
    }

    #[test]
    fn wildcard_and_exact_matches_are_both_compatible() {
        let profiles = vec![
            profile("wild", "com.company.*", &["AA"], 100),
            profile("exact", "com.company.widget", &["AA"], 50),
            profile("other", "com.other.*", &["AA"], 100),
        ];
        let found = find_compatible(&profiles, "com.company.widget", &[cert("AA")], "ABCDE12345", Utc::now());
        let uuids: Vec<&str> = found.iter().map(|p| p.uuid()).collect();
        assert_eq!(uuids, vec!["exact", "wild"]);
    }

    #[test]
    fn expired_profiles_are_excluded() {
        let profiles = vec![profile("old", "com.company.*", &["AA"], -1)];
        assert!(
            find_compatible(&profiles, "com.company.widget", &[cert("AA")], "ABCDE12345", Utc::now())
                .is_empty()
        );
    }

    #[test]
    fn partial_certificate_overlap_is_not_compatible() {
        let profiles = vec![profile("p", "com.company.*", &["AA"], 100)];
        let certs = [cert("AA"), cert("BB")];
        assert!(find_compatible(&profiles, "com.company.widget", &certs, "ABCDE12345", Utc::now()).is_empty());
    }

    #[test]
    fn other_team_is_not_compatible() {
        let profiles = vec![profile("p", "com.company.*", &["AA"], 100)];
        assert!(find_compatible(&profiles, "com.company.widget", &[cert("AA")], "ZZZZZ99999", Utc::now()).is_empty());
    }
}
