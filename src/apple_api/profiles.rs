use super::{AppleApiClient, Document, Resource};
use crate::error::{ApiErrorKind, ReleaseError, Result};
use crate::model::{Certificate, ProfileType};
use crate::profiles::parse_mobileprovision;
use crate::repository::{ProfileRepository, RemoteProfile};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleIdAttributes {
    identifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileAttributes {
    #[serde(default)]
    profile_type: String,
    #[serde(default)]
    profile_state: String,
    profile_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceAttributes {}

impl AppleApiClient {
    /// Authority id of the registered bundle identifier.
    async fn bundle_id_resource(&self, app_identifier: &str) -> Result<Option<String>> {
        let doc: Document<Vec<Resource<BundleIdAttributes>>> = self
            .get(&format!("/v1/bundleIds?filter[identifier]={app_identifier}&limit=200"))
            .await?;
        // filter[identifier] is a prefix match
        Ok(doc
            .data
            .into_iter()
            .find(|r| r.attributes.identifier == app_identifier)
            .map(|r| r.id))
    }

    async fn enabled_device_ids(&self) -> Result<Vec<String>> {
        let doc: Document<Vec<Resource<DeviceAttributes>>> = self
            .get("/v1/devices?filter[platform]=IOS&filter[status]=ENABLED&limit=200")
            .await?;
        Ok(doc.data.into_iter().map(|r| r.id).collect())
    }
}

fn decode_profile(resource: Resource<ProfileAttributes>) -> Result<RemoteProfile> {
    let content = resource.attributes.profile_content.as_deref().ok_or_else(|| {
        ReleaseError::api(ApiErrorKind::Rejected, None, "Profile response has no content")
    })?;
    let content = base64::engine::general_purpose::STANDARD
        .decode(content)
        .map_err(|e| {
            ReleaseError::api(
                ApiErrorKind::Rejected,
                None,
                format!("Failed to decode profile content: {e}"),
            )
        })?;
    let profile = parse_mobileprovision(&content)?.with_authority_id(resource.id);
    Ok(RemoteProfile { profile, content })
}

#[async_trait]
impl ProfileRepository for AppleApiClient {
    async fn list_profiles(&self, app_identifier: &str, team_id: &str) -> Result<Vec<RemoteProfile>> {
        let Some(bundle_id) = self.bundle_id_resource(app_identifier).await? else {
            return Ok(Vec::new());
        };

        let doc: Document<Vec<Resource<ProfileAttributes>>> = self
            .get(&format!("/v1/bundleIds/{bundle_id}/profiles?limit=200"))
            .await?;

        let mut profiles = Vec::new();
        for resource in doc.data {
            if ProfileType::from_apple_api_string(&resource.attributes.profile_type).is_none()
                || resource.attributes.profile_state != "ACTIVE"
            {
                continue;
            }
            match decode_profile(resource) {
                Ok(remote) if remote.profile.team_id() == team_id => profiles.push(remote),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping undecodable remote profile"),
            }
        }
        Ok(profiles)
    }

    async fn create_profile(
        &self,
        app_identifier: &str,
        certificates: &[Certificate],
        team_id: &str,
        profile_type: ProfileType,
    ) -> Result<RemoteProfile> {
        let bundle_id = self
            .bundle_id_resource(app_identifier)
            .await?
            .ok_or_else(|| {
                ReleaseError::api(
                    ApiErrorKind::Rejected,
                    None,
                    format!("Bundle identifier {app_identifier} is not registered for team {team_id}"),
                )
            })?;

        let certificate_refs: Vec<serde_json::Value> = certificates
            .iter()
            .map(|c| serde_json::json!({ "type": "certificates", "id": c.id() }))
            .collect();

        let mut relationships = serde_json::json!({
            "bundleId": { "data": { "type": "bundleIds", "id": bundle_id } },
            "certificates": { "data": certificate_refs },
        });
        if profile_type == ProfileType::Development {
            let devices: Vec<serde_json::Value> = self
                .enabled_device_ids()
                .await?
                .into_iter()
                .map(|id| serde_json::json!({ "type": "devices", "id": id }))
                .collect();
            relationships["devices"] = serde_json::json!({ "data": devices });
        }

        let name = format!(
            "{app_identifier} {} {}",
            profile_type.export_method(),
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let payload = serde_json::json!({
            "data": {
                "type": "profiles",
                "attributes": {
                    "name": name,
                    "profileType": profile_type.to_apple_api_string(),
                },
                "relationships": relationships,
            }
        });

        let doc: Document<Resource<ProfileAttributes>> = self.post("/v1/profiles", &payload).await?;
        decode_profile(doc.data)
    }
}
