//! # Crankshaft Host
//!
//! Loading, lifecycle and supervision of extensions.
//!
//! The [`ExtensionHostManager`] discovers manifests, orders them by
//! dependency, hands each to the [`ExtensionLoader`] and keeps the loaded
//! instances. Extensions only ever see an
//! [`ExtensionProxy`](crankshaft_capability::ExtensionProxy); the
//! capabilities behind it come from their manifest and can be revoked at any
//! time through the manager.

pub mod config;
pub mod discovery;
pub mod extension;
pub mod loader;
pub mod logging;
pub mod manager;
pub mod services;

pub use config::{load_config, save_config, ConfigError, HostConfig};
pub use discovery::{ExtensionCandidate, ExtensionDiscovery};
pub use extension::{Extension, ExtensionCatalog, ExtensionContext};
pub use loader::{ExtensionLoader, LoadState, LoadedExtension, LoaderOptions};
pub use logging::init_logging;
pub use manager::{
    resolve_order, ExtensionHostManager, ExtensionSummary, HostOptions, LoadOutcome, LoadPlan,
    LoadReport,
};
pub use services::{RegisteredView, SettingsService, ViewRegistry};
