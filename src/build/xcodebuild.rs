//! `BuildRepository` over `xcodebuild` and `agvtool`

use super::write_export_options;
use crate::config::Timeouts;
use crate::error::{ReleaseError, Result};
use crate::keychain::keychain_path;
use crate::model::{BuildNumber, MarketingVersion, VersionInfo};
use crate::process::{failure_text, run_tool};
use crate::repository::{
    ArchiveOutcome, BuildRepository, ExportOptions, ExportOutcome, SigningConfig,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Xcode looks in both locations depending on version.
const PROFILE_DIRS: [&str; 2] = [
    "Library/MobileDevice/Provisioning Profiles",
    "Library/Developer/Xcode/UserData/Provisioning Profiles",
];

#[derive(Debug, Clone)]
pub struct Xcodebuild {
    timeouts: Timeouts,
}

impl Xcodebuild {
    #[must_use]
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }

    async fn xcodebuild(
        &self,
        args: Vec<OsString>,
        timeout: std::time::Duration,
    ) -> Result<std::process::Output> {
        tracing::debug!(args = ?args, "xcodebuild");
        run_tool("xcodebuild", args, timeout, None, &[]).await
    }

    async fn agvtool(&self, project_path: &Path, args: &[&str]) -> Result<String> {
        let (_, project) = project_flag(project_path)?;
        let dir = project.parent().unwrap_or(Path::new("."));
        let output = run_tool(
            "xcrun",
            std::iter::once("agvtool").chain(args.iter().copied()),
            self.timeouts.introspection(),
            Some(dir),
            &[],
        )
        .await?;
        if !output.status.success() {
            return Err(ReleaseError::CommandExecution(format!(
                "agvtool {} failed: {}",
                args.join(" "),
                failure_text(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `-workspace`/`-project` flag and the container to pass with it.
///
/// A directory is searched for a workspace first, then a project.
pub fn project_flag(project_path: &Path) -> Result<(&'static str, PathBuf)> {
    let flag_for = |path: &Path| match path.extension().and_then(|e| e.to_str()) {
        Some("xcworkspace") => Some("-workspace"),
        Some("xcodeproj") => Some("-project"),
        _ => None,
    };

    if let Some(flag) = flag_for(project_path) {
        return Ok((flag, project_path.to_path_buf()));
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(project_path)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for wanted in ["-workspace", "-project"] {
        if let Some(found) = entries.iter().find(|p| flag_for(p) == Some(wanted)) {
            return Ok((wanted, found.clone()));
        }
    }
    Err(ReleaseError::Validation(format!(
        "No .xcworkspace or .xcodeproj found in {}",
        project_path.display()
    )))
}

#[derive(Deserialize)]
struct SchemeContainer {
    #[serde(default)]
    schemes: Vec<String>,
}

#[derive(Deserialize)]
struct SchemeList {
    project: Option<SchemeContainer>,
    workspace: Option<SchemeContainer>,
}

/// Schemes from `xcodebuild -list -json`.
pub fn parse_scheme_list(json: &str) -> Result<Vec<String>> {
    let list: SchemeList = serde_json::from_str(json)?;
    Ok(list
        .workspace
        .or(list.project)
        .map(|c| c.schemes)
        .unwrap_or_default())
}

/// `KEY = value` pairs from `-showBuildSettings`. The first target wins on
/// duplicate keys.
#[must_use]
pub fn parse_build_settings(output: &str) -> BTreeMap<String, String> {
    let mut settings = BTreeMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.trim().split_once(" = ")
            && !key.is_empty()
            && !key.contains(' ')
        {
            settings
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    settings
}

/// First `.ipa` in an export directory.
pub fn find_package(dir: &Path) -> Option<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "ipa"))
        .collect();
    found.sort();
    found.into_iter().next()
}

async fn install_for_xcode(profile_path: &Path, uuid: &str) -> Result<()> {
    let home = dirs::home_dir()
        .ok_or_else(|| ReleaseError::Validation("HOME not set".to_string()))?;
    for dir in PROFILE_DIRS {
        let dir = home.join(dir);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::copy(profile_path, dir.join(format!("{uuid}.mobileprovision"))).await?;
    }
    Ok(())
}

#[async_trait]
impl BuildRepository for Xcodebuild {
    async fn archive(
        &self,
        project_path: &Path,
        scheme: &str,
        configuration: &str,
        output_path: &Path,
        signing: &SigningConfig,
    ) -> Result<ArchiveOutcome> {
        if let Some(profile_path) = &signing.profile_path {
            install_for_xcode(profile_path, &signing.profile_uuid).await?;
        }
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (flag, container) = project_flag(project_path)?;
        let mut args: Vec<OsString> = vec![
            "archive".into(),
            flag.into(),
            container.into_os_string(),
            "-scheme".into(),
            scheme.into(),
            "-configuration".into(),
            configuration.into(),
            "-archivePath".into(),
            output_path.as_os_str().to_owned(),
            "-destination".into(),
            "generic/platform=iOS".into(),
            "CODE_SIGN_STYLE=Manual".into(),
            format!("DEVELOPMENT_TEAM={}", signing.team_id).into(),
            format!("CODE_SIGN_IDENTITY={}", signing.identity).into(),
            format!("PROVISIONING_PROFILE_SPECIFIER={}", signing.profile_name).into(),
        ];
        if let Some(keychain) = &signing.keychain {
            args.push(
                format!("OTHER_CODE_SIGN_FLAGS=--keychain {}", keychain_path(keychain)?.display())
                    .into(),
            );
        }

        let output = self.xcodebuild(args, self.timeouts.archive()).await?;
        let logs = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        let log_path = output_path.with_extension("log");
        if let Err(e) = tokio::fs::write(&log_path, &logs).await {
            tracing::warn!(path = %log_path.display(), error = %e, "could not write archive log");
        }

        Ok(ArchiveOutcome {
            success: output.status.success() && output_path.exists(),
            archive_path: output_path.to_path_buf(),
            logs,
        })
    }

    async fn export_package(
        &self,
        archive_path: &Path,
        options: &ExportOptions,
        output_dir: &Path,
    ) -> Result<ExportOutcome> {
        tokio::fs::create_dir_all(output_dir).await?;
        let plist_path = output_dir.join("ExportOptions.plist");
        write_export_options(options, &plist_path)?;

        let args: Vec<OsString> = vec![
            "-exportArchive".into(),
            "-archivePath".into(),
            archive_path.as_os_str().to_owned(),
            "-exportPath".into(),
            output_dir.as_os_str().to_owned(),
            "-exportOptionsPlist".into(),
            plist_path.into_os_string(),
        ];
        let output = self.xcodebuild(args, self.timeouts.export()).await?;
        let logs = failure_text(&output);

        let package_path = if output.status.success() {
            find_package(output_dir)
        } else {
            None
        };
        Ok(ExportOutcome {
            success: package_path.is_some(),
            package_path,
            logs,
        })
    }

    async fn list_schemes(&self, project_path: &Path) -> Result<Vec<String>> {
        let (flag, container) = project_flag(project_path)?;
        let args: Vec<OsString> = vec![
            "-list".into(),
            "-json".into(),
            flag.into(),
            container.into_os_string(),
        ];
        let output = self.xcodebuild(args, self.timeouts.introspection()).await?;
        if !output.status.success() {
            return Err(ReleaseError::CommandExecution(format!(
                "xcodebuild -list failed: {}",
                failure_text(&output)
            )));
        }
        parse_scheme_list(&String::from_utf8_lossy(&output.stdout))
    }

    async fn read_build_settings(
        &self,
        project_path: &Path,
        scheme: &str,
        configuration: &str,
    ) -> Result<BTreeMap<String, String>> {
        let (flag, container) = project_flag(project_path)?;
        let args: Vec<OsString> = vec![
            "-showBuildSettings".into(),
            flag.into(),
            container.into_os_string(),
            "-scheme".into(),
            scheme.into(),
            "-configuration".into(),
            configuration.into(),
        ];
        let output = self.xcodebuild(args, self.timeouts.introspection()).await?;
        if !output.status.success() {
            return Err(ReleaseError::CommandExecution(format!(
                "xcodebuild -showBuildSettings failed: {}",
                failure_text(&output)
            )));
        }
        Ok(parse_build_settings(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn read_version(&self, project_path: &Path) -> Result<VersionInfo> {
        let marketing = self
            .agvtool(project_path, &["what-marketing-version", "-terse1"])
            .await?;
        let build = self.agvtool(project_path, &["what-version", "-terse"]).await?;
        Ok(VersionInfo {
            marketing: MarketingVersion::parse(&marketing)?,
            build: BuildNumber::parse(&build)?,
        })
    }

    async fn write_version(&self, project_path: &Path, version: &VersionInfo) -> Result<()> {
        let marketing = version.marketing.to_string();
        let build = version.build.to_string();
        self.agvtool(project_path, &["new-marketing-version", &marketing])
            .await?;
        self.agvtool(project_path, &["new-version", "-all", &build])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_workspace_over_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("App.xcodeproj")).unwrap();
        std::fs::create_dir(dir.path().join("App.xcworkspace")).unwrap();

        let (flag, path) = project_flag(dir.path()).unwrap();
        assert_eq!(flag, "-workspace");
        assert!(path.ends_with("App.xcworkspace"));

        let (flag, _) = project_flag(&dir.path().join("App.xcodeproj")).unwrap();
        assert_eq!(flag, "-project");
    }

    #[test]
    fn empty_directory_has_no_project() {
        let dir = tempfile::tempdir().unwrap();
        assert!(project_flag(dir.path()).is_err());
    }

    #[test]
    fn parses_scheme_list() {
        let json = r#"{"project":{"name":"App","schemes":["App","AppTests"],"targets":["App"]}}"#;
        assert_eq!(parse_scheme_list(json).unwrap(), vec!["App", "AppTests"]);
    }

    #[test]
    fn parses_build_settings() {
        let out = "Build settings for action build and target App:\n    \
                   PRODUCT_BUNDLE_IDENTIFIER = com.acme.app\n    \
                   MARKETING_VERSION = 1.4.0\n\
                   Build settings for action build and target Widget:\n    \
                   PRODUCT_BUNDLE_IDENTIFIER = com.acme.app.widget\n";
        let settings = parse_build_settings(out);
        assert_eq!(settings["PRODUCT_BUNDLE_IDENTIFIER"], "com.acme.app");
        assert_eq!(settings["MARKETING_VERSION"], "1.4.0");
    }

    #[test]
    fn finds_exported_ipa() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ExportOptions.plist"), "").unwrap();
        assert!(find_package(dir.path()).is_none());
        std::fs::write(dir.path().join("App.ipa"), "pk").unwrap();
        assert!(find_package(dir.path()).unwrap().ends_with("App.ipa"));
    }
}
