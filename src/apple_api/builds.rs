use super::{AppleApiClient, Document, Resource};
use crate::error::{ReleaseError, Result, UploadErrorKind};
use crate::process::{failure_text, run_tool};
use crate::repository::{BuildStatus, UploadOptions, UploadReceipt, UploadRepository};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct AppAttributes {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildAttributes {
    #[serde(default)]
    processing_state: String,
}

/// Pull the delivery id out of altool's human-readable output.
fn parse_delivery_id(output: &str) -> Option<String> {
    let re = Regex::new(r"(?i)Delivery\s+UUID:?\s*([0-9a-f-]{36})").ok()?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn upload_rejection(stderr: &str) -> ReleaseError {
    let hint = if stderr.contains("ENTITY_ERROR.ATTRIBUTE.INVALID.DUPLICATE")
        || stderr.contains("bundle version must be higher")
    {
        " (build number already used)"
    } else if stderr.contains("401") || stderr.contains("NOT_AUTHORIZED") {
        " (API key rejected)"
    } else {
        ""
    };
    ReleaseError::upload(
        UploadErrorKind::Rejected,
        format!("altool rejected the upload{hint}:\n{stderr}"),
    )
}

fn processing_status(state: &str) -> BuildStatus {
    match state {
        "VALID" => BuildStatus::Ready,
        "PROCESSING" => BuildStatus::Processing,
        other => BuildStatus::Invalid(other.to_string()),
    }
}

#[async_trait]
impl UploadRepository for AppleApiClient {
    async fn upload_build(
        &self,
        package_path: &Path,
        options: &UploadOptions,
    ) -> Result<UploadReceipt> {
        if !package_path.exists() {
            return Err(ReleaseError::Validation(format!(
                "Package not found: {}",
                package_path.display()
            )));
        }

        // altool only reads keys named AuthKey_<id>.p8 from API_PRIVATE_KEYS_DIR
        let key_dir = tempfile::tempdir()?;
        tokio::fs::copy(
            self.private_key_path(),
            key_dir.path().join(format!("AuthKey_{}.p8", self.key_id())),
        )
        .await?;

        tracing::info!(
            app = %options.app_identifier,
            version = %options.marketing_version,
            build = %options.build_number,
            package = %package_path.display(),
            "uploading build"
        );

        let args: Vec<&OsStr> = vec![
            OsStr::new("altool"),
            OsStr::new("--upload-app"),
            OsStr::new("--type"),
            OsStr::new("ios"),
            OsStr::new("--file"),
            package_path.as_os_str(),
            OsStr::new("--apiKey"),
            OsStr::new(self.key_id()),
            OsStr::new("--apiIssuer"),
            OsStr::new(self.issuer_id()),
        ];
        let output = match run_tool(
            "xcrun",
            args,
            self.timeouts().upload(),
            None,
            &[("API_PRIVATE_KEYS_DIR", key_dir.path().as_os_str())],
        )
        .await
        {
            Ok(output) => output,
            Err(ReleaseError::Timeout { seconds, .. }) => {
                return Err(ReleaseError::upload(
                    UploadErrorKind::TimedOut,
                    format!("altool did not finish within {seconds}s"),
                ));
            }
            Err(e) => return Err(e),
        };

        if !output.status.success() {
            return Err(upload_rejection(&failure_text(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        // altool reports some rejections with exit status 0
        if stderr.contains("*** Error:") || stdout.contains("*** Error:") {
            return Err(upload_rejection(&failure_text(&output)));
        }

        let delivery_id =
            parse_delivery_id(&stdout).or_else(|| parse_delivery_id(&stderr));
        Ok(UploadReceipt {
            delivery_id,
            message: stdout.trim().to_string(),
        })
    }

    async fn get_build_status(&self, app_identifier: &str, build_number: &str) -> Result<BuildStatus> {
        let apps: Document<Vec<Resource<AppAttributes>>> = self
            .get(&format!("/v1/apps?filter[bundleId]={app_identifier}&limit=1"))
            .await?;
        let Some(app) = apps.data.into_iter().next() else {
            return Ok(BuildStatus::NotFound);
        };

        let builds: Document<Vec<Resource<BuildAttributes>>> = self
            .get(&format!(
                "/v1/builds?filter[app]={}&filter[version]={build_number}&limit=1",
                app.id
            ))
            .await?;

        Ok(builds
            .data
            .into_iter()
            .next()
            .map_or(BuildStatus::NotFound, |b| {
                processing_status(&b.attributes.processing_state)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_delivery_uuid() {
        let out = "No errors uploading 'App.ipa'\nDelivery UUID: 0f4b2a5e-6c1d-4e8f-9a3b-7d2c1e0f9a8b\n";
        assert_eq!(
            parse_delivery_id(out).as_deref(),
            Some("0f4b2a5e-6c1d-4e8f-9a3b-7d2c1e0f9a8b")
        );
        assert_eq!(parse_delivery_id("No errors uploading"), None);
    }

    #[test]
    fn maps_processing_states() {
        assert_eq!(processing_status("VALID"), BuildStatus::Ready);
        assert_eq!(processing_status("PROCESSING"), BuildStatus::Processing);
        assert_eq!(
            processing_status("INVALID"),
            BuildStatus::Invalid("INVALID".to_string())
        );
    }

    #[test]
    fn duplicate_build_number_is_called_out() {
        let e = upload_rejection("ENTITY_ERROR.ATTRIBUTE.INVALID.DUPLICATE");
        assert!(e.to_string().contains("build number already used"));
    }
}
