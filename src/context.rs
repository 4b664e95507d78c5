//! Explicit dependencies handed to every pipeline component

use crate::apple_api::AppleApiClient;
use crate::build::Xcodebuild;
use crate::config::ReleaseConfig;
use crate::error::Result;
use crate::keychain::{AppleIntermediates, CredentialStore, IntermediateSource, SecurityCli};
use crate::repository::{
    BuildRepository, CertificateRepository, ProfileRepository, UploadRepository,
};
use std::sync::Arc;

/// Adapters and configuration for one release run.
///
/// Remote repositories are optional: without API credentials the pipeline
/// works from local material only and has no creation path.
#[derive(Clone)]
pub struct ReleaseContext {
    config: Arc<ReleaseConfig>,
    store: Arc<dyn CredentialStore>,
    builds: Arc<dyn BuildRepository>,
    certificates: Option<Arc<dyn CertificateRepository>>,
    profiles: Option<Arc<dyn ProfileRepository>>,
    uploads: Option<Arc<dyn UploadRepository>>,
    intermediates: Option<Arc<dyn IntermediateSource>>,
}

impl ReleaseContext {
    pub fn new(
        config: ReleaseConfig,
        store: Arc<dyn CredentialStore>,
        builds: Arc<dyn BuildRepository>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            builds,
            certificates: None,
            profiles: None,
            uploads: None,
            intermediates: None,
        }
    }

    /// Production wiring: `security`, `xcodebuild`, Apple's WWDR
    /// intermediates (unless disabled) and, when an API key is configured,
    /// the App Store Connect client for all remote operations.
    pub async fn for_host(config: ReleaseConfig) -> Result<Self> {
        let store = Arc::new(SecurityCli::new(config.timeouts.credential_store()));
        let builds = Arc::new(Xcodebuild::new(config.timeouts));
        let api_key = config.api_key.clone();
        let intermediates = config
            .install_apple_intermediates
            .then(|| AppleIntermediates::new(config.timeouts.credential_store()))
            .transpose()?;
        let mut context = Self::new(config, store, builds);
        if let Some(intermediates) = intermediates {
            context = context.with_intermediate_source(Arc::new(intermediates));
        }

        if let Some(api_key) = api_key {
            let client = Arc::new(AppleApiClient::from_config(&api_key, &context.config).await?);
            context = context
                .with_certificate_repository(client.clone())
                .with_profile_repository(client.clone())
                .with_upload_repository(client);
        }
        Ok(context)
    }

    #[must_use]
    pub fn with_certificate_repository(mut self, repo: Arc<dyn CertificateRepository>) -> Self {
        self.certificates = Some(repo);
        self
    }

    #[must_use]
    pub fn with_profile_repository(mut self, repo: Arc<dyn ProfileRepository>) -> Self {
        self.profiles = Some(repo);
        self
    }

    #[must_use]
    pub fn with_upload_repository(mut self, repo: Arc<dyn UploadRepository>) -> Self {
        self.uploads = Some(repo);
        self
    }

    #[must_use]
    pub fn with_intermediate_source(mut self, source: Arc<dyn IntermediateSource>) -> Self {
        self.intermediates = Some(source);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn CredentialStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn builds(&self) -> &dyn BuildRepository {
        self.builds.as_ref()
    }

    #[must_use]
    pub fn certificates(&self) -> Option<&dyn CertificateRepository> {
        self.certificates.as_deref()
    }

    /// Shared handle for components that keep the repository.
    #[must_use]
    pub fn certificate_repository(&self) -> Option<Arc<dyn CertificateRepository>> {
        self.certificates.clone()
    }

    #[must_use]
    pub fn profiles(&self) -> Option<&dyn ProfileRepository> {
        self.profiles.as_deref()
    }

    #[must_use]
    pub fn uploads(&self) -> Option<&dyn UploadRepository> {
        self.uploads.as_deref()
    }

    /// Intermediates installed into every run keychain.
    #[must_use]
    pub fn intermediates(&self) -> Option<&dyn IntermediateSource> {
        self.intermediates.as_deref()
    }
}
