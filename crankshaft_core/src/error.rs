//! Error types for the extension host.
//!
//! Every component owns one error enum; [`Error`] wraps them all for callers
//! that drive the whole host.

use thiserror::Error;

use crate::capability::{CapabilityKind, Scope, ScopeError};
use crate::id::ExtensionId;
use crate::version::Version;

/// Root error type for the host.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders an optional scope for error and log messages.
pub fn display_scope(scope: &Option<Scope>) -> String {
    match scope {
        Some(scope) => scope.to_string(),
        None => "<any>".to_string(),
    }
}

/// Errors raised by the capability registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("Unknown extension identity: {0}")]
    UnknownIdentity(ExtensionId),

    #[error("Duplicate grant of {kind} (scope {}) to {identity}", display_scope(.scope))]
    DuplicateGrant {
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<Scope>,
    },

    #[error("Capability denied: {kind} (scope {})", display_scope(.scope))]
    CapabilityDenied {
        kind: CapabilityKind,
        scope: Option<Scope>,
    },

    #[error("Capability revoked: {kind} (scope {})", display_scope(.scope))]
    CapabilityRevoked {
        kind: CapabilityKind,
        scope: Option<Scope>,
    },

    #[error("Extension {0} is being unloaded")]
    IdentityClosing(ExtensionId),

    #[error("Attenuation would widen {kind} from {} to {}", display_scope(.parent), display_scope(.requested))]
    ScopeEscalation {
        kind: CapabilityKind,
        parent: Option<Scope>,
        requested: Option<Scope>,
    },

    #[error("Token handle is not valid for this registry")]
    InvalidHandle,

    #[error("Invalid scope: {0}")]
    InvalidScope(#[from] ScopeError),

    #[error("Registry halted after integrity violation: {0}")]
    RegistryHalted(String),
}

/// Manifest parse and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse manifest: {0}")]
    Parse(String),

    #[error("Unsupported manifest format: {0}")]
    UnsupportedFormat(String),

    #[error("Manifest field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("Manifest id is invalid: {0}")]
    InvalidId(String),

    #[error("Manifest field `{field}` is not a version triplet: {value}")]
    InvalidVersion { field: &'static str, value: String },

    #[error("Unrecognized capability kind: {0}")]
    UnrecognizedCapability(String),

    #[error("Invalid scope for {kind}: {source}")]
    InvalidScope {
        kind: CapabilityKind,
        #[source]
        source: ScopeError,
    },

    #[error("Capability {kind} (scope {}) is declared twice", display_scope(.scope))]
    DuplicateCapability {
        kind: CapabilityKind,
        scope: Option<Scope>,
    },

    #[error("Dependency id is invalid: {0}")]
    InvalidDependency(String),

    #[error("Extension {0} lists itself as a dependency")]
    SelfDependency(String),
}

/// Reasons an extension load attempt ends in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Manifest of {extension} is invalid: {source}")]
    ManifestInvalid {
        extension: String,
        #[source]
        source: ManifestError,
    },

    #[error("Loading {extension} timed out during {stage} after {timeout_ms}ms")]
    LoadTimeout {
        extension: String,
        stage: &'static str,
        timeout_ms: u64,
    },

    #[error("{extension} requires host {required}, host is {host}")]
    IncompatibleHost {
        extension: String,
        required: Version,
        host: Version,
    },

    #[error("{extension} does not support platform {platform}")]
    UnsupportedPlatform { extension: String, platform: String },

    #[error("{extension} names an unknown entry point: {entry_point}")]
    UnknownEntryPoint {
        extension: String,
        entry_point: String,
    },

    #[error("{extension} failed to initialize: {reason}")]
    InitializationFailed { extension: String, reason: String },

    #[error("Missing dependencies for {extension}: {}", .missing.join(","))]
    MissingDependencies {
        extension: String,
        missing: Vec<String>,
    },

    #[error("Dependency cycle detected for {extension} among {}", .members.join(","))]
    DependencyCycle {
        extension: String,
        members: Vec<String>,
    },

    #[error("Extension already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Capability seeding failed for {extension}: {source}")]
    Registry {
        extension: String,
        #[source]
        source: CapabilityError,
    },

    #[error("Discovery failed: {0}")]
    Discovery(String),
}

/// Audit log errors. Any of these surfaces to extensions as a denial.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit log cannot accept writes: {0}")]
    WriteFailure(String),

    #[error("Audit log is closed")]
    Closed,

    #[error("Audit store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit record serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors returned to extension code by the core service proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("Capability denied: {kind} (scope {})", display_scope(.scope))]
    CapabilityDenied {
        kind: CapabilityKind,
        scope: Option<Scope>,
    },

    #[error("No core service is registered for {0}")]
    ServiceUnavailable(CapabilityKind),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Call to {kind} timed out after {timeout_ms}ms")]
    Timeout { kind: CapabilityKind, timeout_ms: u64 },
}

/// Errors raised by core service implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Service failed: {0}")]
    Failed(String),
}

/// Errors raised by extension lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionError {
    #[error("{0}")]
    Failed(String),

    #[error("Core service call failed: {0}")]
    Proxy(#[from] ProxyError),
}

/// A type alias for Result with the root error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_error_messages_render_scope() {
        let err = CapabilityError::CapabilityDenied {
            kind: CapabilityKind::WriteSettings,
            scope: Some(Scope::new("ui.language").unwrap()),
        };
        assert_eq!(
            err.to_string(),
            "Capability denied: write-settings (scope ui.language)"
        );

        let err = CapabilityError::CapabilityRevoked {
            kind: CapabilityKind::NetworkAccess,
            scope: None,
        };
        assert_eq!(err.to_string(), "Capability revoked: network-access (scope <any>)");
    }

    #[test]
    fn test_root_error_wraps_components() {
        let err: Error = LoadError::AlreadyLoaded("weather-widget".to_string()).into();
        assert!(matches!(err, Error::Load(LoadError::AlreadyLoaded(_))));
        assert!(err.to_string().contains("weather-widget"));
    }
}
