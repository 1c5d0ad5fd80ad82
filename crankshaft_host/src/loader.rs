//! Extension Loader
//!
//! Turns a candidate manifest into a running extension. Each attempt moves
//! through `Discovered -> Validating -> Instantiated`, or ends in `Failed`.
//! A failed attempt leaves nothing behind: any identity it registered is
//! revoked and forgotten before the error is returned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crankshaft_capability::audit::AuditLog;
use crankshaft_capability::proxy::{ExtensionProxy, ServiceTable};
use crankshaft_capability::registry::CapabilityRegistry;
use crankshaft_core::error::{LoadError, ManifestError};
use crankshaft_core::id::ExtensionId;
use crankshaft_core::manifest::ExtensionManifest;
use crankshaft_core::version::{host_version, Version};

use crate::discovery::ExtensionCandidate;
use crate::extension::{Extension, ExtensionCatalog, ExtensionContext};

/// Stage of one load attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Discovered,
    Validating,
    Instantiated,
    Failed,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovered => "discovered",
            Self::Validating => "validating",
            Self::Instantiated => "instantiated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A successfully instantiated extension.
pub struct LoadedExtension {
    pub identity: ExtensionId,
    pub manifest: Arc<ExtensionManifest>,
    pub instance: Arc<dyn Extension>,
    pub proxy: ExtensionProxy,
    pub loaded_at: DateTime<Utc>,
}

impl fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("identity", &self.identity)
            .field("id", &self.manifest.id)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Host properties a manifest is checked against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoaderOptions {
    pub host_version: Version,
    pub platform: String,
    pub call_timeout: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            host_version: host_version(),
            platform: std::env::consts::OS.to_string(),
            call_timeout: crankshaft_capability::proxy::DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Validates manifests and instantiates extensions.
pub struct ExtensionLoader {
    registry: Arc<CapabilityRegistry>,
    audit: Arc<AuditLog>,
    services: Arc<ServiceTable>,
    catalog: ExtensionCatalog,
    options: LoaderOptions,
}

impl ExtensionLoader {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        audit: Arc<AuditLog>,
        services: Arc<ServiceTable>,
        catalog: ExtensionCatalog,
        options: LoaderOptions,
    ) -> Self {
        Self {
            registry,
            audit,
            services,
            catalog,
            options,
        }
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Validate and instantiate `candidate` within `timeout`.
    pub async fn load(
        &self,
        candidate: &ExtensionCandidate,
        timeout: Duration,
    ) -> Result<LoadedExtension, LoadError> {
        let deadline = Instant::now() + timeout;
        let manifest = self.validate_until(candidate, deadline, timeout).await?;
        self.instantiate_until(manifest, deadline, timeout).await
    }

    /// Run the validation stage on its own.
    ///
    /// Checks that the manifest parsed, that every capability kind is
    /// recognized and every scope well formed, that the host version and
    /// platform are supported, and that the entry point exists. The checks
    /// run to completion; a manifest that passes after `timeout` has
    /// elapsed is reported as a validation timeout.
    pub async fn validate(
        &self,
        candidate: &ExtensionCandidate,
        timeout: Duration,
    ) -> Result<ExtensionManifest, LoadError> {
        self.validate_until(candidate, Instant::now() + timeout, timeout)
            .await
    }

    /// Run the instantiation stage for an already validated manifest.
    pub async fn instantiate(
        &self,
        manifest: ExtensionManifest,
        timeout: Duration,
    ) -> Result<LoadedExtension, LoadError> {
        self.instantiate_until(manifest, Instant::now() + timeout, timeout)
            .await
    }

    async fn validate_until(
        &self,
        candidate: &ExtensionCandidate,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ExtensionManifest, LoadError> {
        trace_state(&candidate.label, LoadState::Discovered);
        trace_state(&candidate.label, LoadState::Validating);

        // The checks never yield, so the deadline is enforced once they finish.
        let result = self.check(candidate).and_then(|manifest| {
            if Instant::now() >= deadline {
                Err(LoadError::LoadTimeout {
                    extension: candidate.label.clone(),
                    stage: "validation",
                    timeout_ms: millis(timeout),
                })
            } else {
                Ok(manifest)
            }
        });

        if let Err(err) = &result {
            warn!(extension = %candidate.label, error = %err, "Extension failed validation");
            trace_state(&candidate.label, LoadState::Failed);
        }
        result
    }

    fn check(&self, candidate: &ExtensionCandidate) -> Result<ExtensionManifest, LoadError> {
        let invalid = |source: ManifestError| LoadError::ManifestInvalid {
            extension: candidate.label.clone(),
            source,
        };

        let document = candidate.document.as_ref().map_err(|e| invalid(e.clone()))?;
        let manifest = document.validate().map_err(invalid)?;

        if !manifest.supports_host(&self.options.host_version) {
            return Err(LoadError::IncompatibleHost {
                extension: manifest.id.clone(),
                required: manifest
                    .min_core_version
                    .unwrap_or(self.options.host_version),
                host: self.options.host_version,
            });
        }
        if !manifest.supports_platform(&self.options.platform) {
            return Err(LoadError::UnsupportedPlatform {
                extension: manifest.id.clone(),
                platform: self.options.platform.clone(),
            });
        }
        if !self.catalog.contains(&manifest.entry_point) {
            return Err(LoadError::UnknownEntryPoint {
                extension: manifest.id.clone(),
                entry_point: manifest.entry_point.clone(),
            });
        }

        Ok(manifest)
    }

    async fn instantiate_until(
        &self,
        manifest: ExtensionManifest,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<LoadedExtension, LoadError> {
        let extension = manifest.id.clone();
        let identity = ExtensionId::new();

        let result = self
            .instantiate_as(identity, manifest, deadline, timeout)
            .await;

        match &result {
            Ok(loaded) => {
                trace_state(&extension, LoadState::Instantiated);
                info!(
                    extension = %extension,
                    identity = %identity,
                    capabilities = loaded.manifest.capabilities.len(),
                    "Extension loaded"
                );
            }
            Err(err) => {
                // Nothing granted to a failed load may survive it.
                if self.registry.is_registered(identity) {
                    if let Err(revoke_err) = self.registry.revoke_all(identity) {
                        warn!(identity = %identity, error = %revoke_err, "Cleanup after failed load did not complete");
                    }
                }
                warn!(extension = %extension, error = %err, "Extension failed to load");
                trace_state(&extension, LoadState::Failed);
            }
        }
        result
    }

    async fn instantiate_as(
        &self,
        identity: ExtensionId,
        manifest: ExtensionManifest,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<LoadedExtension, LoadError> {
        let extension = manifest.id.clone();

        // Seed the registry from the manifest
        self.registry.register_identity(identity);
        for request in &manifest.capabilities {
            self.registry
                .grant(identity, request.kind, request.scope.clone())
                .map_err(|source| LoadError::Registry {
                    extension: extension.clone(),
                    source,
                })?;
        }

        let instance: Arc<dyn Extension> = self
            .catalog
            .instantiate(&manifest.entry_point)
            .ok_or_else(|| LoadError::UnknownEntryPoint {
                extension: extension.clone(),
                entry_point: manifest.entry_point.clone(),
            })?
            .into();

        let proxy = ExtensionProxy::new(
            identity,
            self.registry.clone(),
            self.audit.clone(),
            self.services.clone(),
        )
        .with_call_timeout(self.options.call_timeout);

        let manifest = Arc::new(manifest);
        let context = ExtensionContext {
            identity,
            manifest: manifest.clone(),
            proxy: proxy.clone(),
        };

        debug!(extension = %extension, identity = %identity, "Initializing extension");
        match tokio::time::timeout_at(deadline, instance.initialize(context)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(LoadError::InitializationFailed {
                    extension,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(LoadError::LoadTimeout {
                    extension,
                    stage: "initialize",
                    timeout_ms: millis(timeout),
                })
            }
        }

        Ok(LoadedExtension {
            identity,
            manifest,
            instance,
            proxy,
            loaded_at: Utc::now(),
        })
    }
}

impl fmt::Debug for ExtensionLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionLoader")
            .field("catalog", &self.catalog)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn trace_state(extension: &str, state: LoadState) {
    debug!(extension = %extension, state = %state, "Load state");
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crankshaft_core::capability::CapabilityKind;
    use crankshaft_core::error::ExtensionError;
    use crankshaft_core::manifest::{CapabilityDeclaration, ManifestDocument};

    struct Quiet;

    #[async_trait]
    impl Extension for Quiet {
        async fn initialize(&self, _context: ExtensionContext) -> Result<(), ExtensionError> {
            Ok(())
        }
    }

    struct Refuses;

    #[async_trait]
    impl Extension for Refuses {
        async fn initialize(&self, _context: ExtensionContext) -> Result<(), ExtensionError> {
            Err(ExtensionError::Failed("missing configuration".to_string()))
        }
    }

    fn document(id: &str, entry_point: &str) -> ManifestDocument {
        ManifestDocument {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            entry_point: Some(entry_point.to_string()),
            capabilities: vec![
                CapabilityDeclaration::new("read-settings", Some("ui.*")),
                CapabilityDeclaration::new("register-view", None),
            ],
            ..ManifestDocument::default()
        }
    }

    fn loader(options: LoaderOptions) -> (ExtensionLoader, Arc<CapabilityRegistry>) {
        let registry = Arc::new(CapabilityRegistry::new());
        let catalog = ExtensionCatalog::new()
            .with("quiet", || Quiet)
            .with("refuses", || Refuses);
        let loader = ExtensionLoader::new(
            registry.clone(),
            Arc::new(AuditLog::in_memory()),
            Arc::new(ServiceTable::new()),
            catalog,
            options,
        );
        (loader, registry)
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_load_seeds_declared_capabilities() {
        let (loader, registry) = loader(LoaderOptions::default());
        let candidate = ExtensionCandidate::from_document(document("quiet-one", "quiet"));

        let loaded = loader.load(&candidate, TIMEOUT).await.unwrap();
        assert_eq!(registry.active_count(loaded.identity).unwrap(), 2);
        assert!(registry
            .check(loaded.identity, CapabilityKind::RegisterView, None)
            .unwrap());
        assert!(!registry
            .check(loaded.identity, CapabilityKind::NetworkAccess, None)
            .unwrap());
    }

    #[tokio::test]
    async fn test_unrecognized_kind_fails_without_tokens() {
        let (loader, registry) = loader(LoaderOptions::default());
        let mut doc = document("greedy", "quiet");
        doc.capabilities
            .push(CapabilityDeclaration::new("root-shell", None));

        let err = loader
            .load(&ExtensionCandidate::from_document(doc), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::ManifestInvalid {
                source: ManifestError::UnrecognizedCapability(_),
                ..
            }
        ));
        assert!(registry.identities().is_empty());
    }

    #[tokio::test]
    async fn test_failed_initialize_revokes_everything() {
        let (loader, registry) = loader(LoaderOptions::default());
        let candidate = ExtensionCandidate::from_document(document("refuser", "refuses"));

        let err = loader.load(&candidate, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, LoadError::InitializationFailed { .. }));
        assert!(registry.identities().is_empty());
    }

    #[tokio::test]
    async fn test_version_platform_and_entry_point_gates() {
        let (loader, _registry) = loader(LoaderOptions {
            host_version: Version::new(1, 0, 0),
            platform: "linux".to_string(),
            ..LoaderOptions::default()
        });

        let mut doc = document("future", "quiet");
        doc.min_core_version = Some("1.2.0".to_string());
        assert!(matches!(
            loader.validate(&ExtensionCandidate::from_document(doc), TIMEOUT).await,
            Err(LoadError::IncompatibleHost { .. })
        ));

        let mut doc = document("windows-only", "quiet");
        doc.platforms = vec!["windows".to_string()];
        assert!(matches!(
            loader.validate(&ExtensionCandidate::from_document(doc), TIMEOUT).await,
            Err(LoadError::UnsupportedPlatform { .. })
        ));

        let doc = document("ghost", "not-in-catalog");
        assert!(matches!(
            loader.validate(&ExtensionCandidate::from_document(doc), TIMEOUT).await,
            Err(LoadError::UnknownEntryPoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_validation_past_deadline_times_out() {
        let (loader, registry) = loader(LoaderOptions::default());
        let candidate = ExtensionCandidate::from_document(document("quiet-one", "quiet"));

        let err = loader.validate(&candidate, Duration::ZERO).await.unwrap_err();
        assert!(matches!(
            err,
            LoadError::LoadTimeout { stage: "validation", timeout_ms: 0, .. }
        ));

        let err = loader.load(&candidate, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, LoadError::LoadTimeout { stage: "validation", .. }));
        assert!(registry.identities().is_empty());

        assert!(loader.validate(&candidate, TIMEOUT).await.is_ok());
    }

    #[test]
    fn test_load_state_display() {
        assert_eq!(LoadState::Instantiated.to_string(), "instantiated");
    }
}
