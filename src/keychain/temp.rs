//! Per-run keychain that is torn down when the run ends

use super::{CredentialStore, IntermediateSource, KeychainScope};
use crate::error::Result;
use rand::distr::{Alphanumeric, SampleString};
use std::sync::Arc;
use zeroize::Zeroizing;

const NAME_PREFIX: &str = "kodegen-release";

/// Uniquely named keychain with a random password, created for one
/// deployment run.
///
/// Call [`EphemeralKeychain::teardown`] when the run finishes. If the value
/// is dropped without teardown, deletion is spawned on the current tokio
/// runtime as a best effort.
pub struct EphemeralKeychain {
    store: Arc<dyn CredentialStore>,
    name: String,
    password: Zeroizing<String>,
    torn_down: bool,
}

impl EphemeralKeychain {
    /// Create, unlock and grant codesign access to a fresh keychain, then
    /// install the intermediates from `intermediates` so imported identities
    /// chain to a trusted root.
    pub async fn create(
        store: Arc<dyn CredentialStore>,
        intermediates: Option<&dyn IntermediateSource>,
    ) -> Result<Self> {
        let name = format!(
            "{NAME_PREFIX}-{}.keychain-db",
            Alphanumeric.sample_string(&mut rand::rng(), 16)
        );
        let password = Zeroizing::new(Alphanumeric.sample_string(&mut rand::rng(), 16));

        store.create(&name, &password).await?;

        let keychain = Self {
            store,
            name,
            password,
            torn_down: false,
        };

        // From here on, Drop cleans up if a later step fails
        keychain.store.unlock(&keychain.name, &keychain.password).await?;
        keychain
            .store
            .set_access_control(&keychain.name, &keychain.password)
            .await?;

        if let Some(source) = intermediates {
            let installed = keychain.install_intermediates(source).await;
            if let Err(e) = installed {
                keychain.teardown().await;
                return Err(e);
            }
        }

        tracing::info!(keychain = %keychain.name, "ephemeral keychain created");
        Ok(keychain)
    }

    async fn install_intermediates(&self, source: &dyn IntermediateSource) -> Result<()> {
        let certificates = source.fetch().await?;
        let staging = tempfile::TempDir::new()?;
        for certificate in &certificates {
            let path = staging.path().join(format!("{}.cer", certificate.name));
            tokio::fs::write(&path, &certificate.der).await?;
            self.store.import_certificate(&path, &self.name).await?;
            tracing::info!(
                keychain = %self.name,
                intermediate = %certificate.name,
                "intermediate certificate installed"
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    #[must_use]
    pub fn scope(&self) -> KeychainScope {
        KeychainScope::new(self.name.clone(), self.password.as_str())
    }

    /// Re-apply the partition list after new keys were imported.
    pub async fn refresh_access(&self) -> Result<()> {
        self.store.unlock(&self.name, &self.password).await?;
        self.store.set_access_control(&self.name, &self.password).await
    }

    /// Delete the keychain. Failure is logged, never propagated: teardown
    /// runs on every exit path, including after another error.
    pub async fn teardown(mut self) {
        self.torn_down = true;
        match self.store.destroy(&self.name).await {
            Ok(()) => tracing::info!(keychain = %self.name, "ephemeral keychain deleted"),
            Err(e) => {
                warn!("Failed to delete temporary keychain {}: {}", self.name, e);
                tracing::warn!(keychain = %self.name, error = %e, "ephemeral keychain deletion failed");
            }
        }
    }
}

impl Drop for EphemeralKeychain {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.destroy(&name).await;
            });
        }
    }
}
