//! # Crankshaft Core
//!
//! Shared vocabulary of the Crankshaft extension host: typed identities,
//! capability kinds and scopes, the manifest model, host events and the error
//! taxonomy. The capability registry, audit log and service proxy live in
//! `crankshaft_capability`; loading and lifecycle live in `crankshaft_host`.

pub mod capability;
pub mod error;
pub mod event;
pub mod id;
pub mod manifest;
pub mod version;

pub use capability::{CapabilityKind, Scope, ScopeError, ScopeRule, CAPABILITY_SET_VERSION};
pub use error::{
    AuditError, CapabilityError, Error, ExtensionError, LoadError, ManifestError, ProxyError,
    Result, ServiceError,
};
pub use event::{EventBus, HostEvent};
pub use id::{ExtensionId, Id};
pub use manifest::{
    CapabilityDeclaration, CapabilityRequest, ExtensionManifest, ExtensionType, ManifestDocument,
    ManifestFormat, ManifestParser,
};
pub use version::{host_version, Version};
