//! Extension trait and the catalog of instantiable extensions.
//!
//! Extensions are compiled into the host and registered by entry-point name.
//! A manifest's `entry_point` selects which factory the loader calls.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crankshaft_capability::proxy::ExtensionProxy;
use crankshaft_core::error::ExtensionError;
use crankshaft_core::id::ExtensionId;
use crankshaft_core::manifest::ExtensionManifest;

/// What an extension receives when it is initialized.
#[derive(Clone, Debug)]
pub struct ExtensionContext {
    /// Identity assigned for this load.
    pub identity: ExtensionId,

    /// The validated manifest the extension was loaded from.
    pub manifest: Arc<ExtensionManifest>,

    /// The extension's only route to core services.
    pub proxy: ExtensionProxy,
}

/// Lifecycle hooks implemented by every extension.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Called once after capabilities are seeded. Failing, or exceeding the
    /// load timeout, aborts the load and revokes everything.
    async fn initialize(&self, context: ExtensionContext) -> Result<(), ExtensionError>;

    /// Called once at unload, after the extension's capabilities are revoked.
    async fn shutdown(&self) -> Result<(), ExtensionError> {
        Ok(())
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// Named factories for the extensions this host can run.
#[derive(Clone, Default)]
pub struct ExtensionCatalog {
    factories: BTreeMap<String, Factory>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `entry_point`, replacing any earlier one.
    pub fn register<F, E>(&mut self, entry_point: impl Into<String>, factory: F)
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Extension + 'static,
    {
        self.factories.insert(
            entry_point.into(),
            Arc::new(move || Box::new(factory()) as Box<dyn Extension>),
        );
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F, E>(mut self, entry_point: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Extension + 'static,
    {
        self.register(entry_point, factory);
        self
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories.contains_key(entry_point)
    }

    /// Create a fresh instance for `entry_point`.
    pub fn instantiate(&self, entry_point: &str) -> Option<Box<dyn Extension>> {
        self.factories.get(entry_point).map(|factory| factory())
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for ExtensionCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
