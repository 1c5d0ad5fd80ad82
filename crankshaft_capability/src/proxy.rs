//! Core service proxy.
//!
//! [`ExtensionProxy`] is the only surface extension code can call. Each proxy
//! is bound to one identity; every call is authorized against the registry,
//! recorded in the audit log, and only then forwarded to the core service
//! registered for the requested capability kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crankshaft_core::capability::{CapabilityKind, Scope};
use crankshaft_core::error::{CapabilityError, ProxyError, ServiceError};
use crankshaft_core::id::ExtensionId;

use crate::audit::{AuditEntry, AuditLog, AuditOutcome};
use crate::registry::CapabilityRegistry;

/// Default bound on a single service call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// One call from an extension to a core service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub kind: CapabilityKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    /// Service-defined operation name, e.g. `get`.
    pub operation: String,

    #[serde(default)]
    pub payload: Value,
}

impl ServiceRequest {
    pub fn new(kind: CapabilityKind, operation: impl Into<String>) -> Self {
        Self {
            kind,
            scope: None,
            operation: operation.into(),
            payload: Value::Null,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A host-side service reachable through the proxy.
#[async_trait]
pub trait CoreService: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle an authorized request from `caller`.
    async fn call(&self, caller: ExtensionId, request: &ServiceRequest)
        -> Result<Value, ServiceError>;
}

/// Core services keyed by the capability kind that guards them.
#[derive(Default)]
pub struct ServiceTable {
    services: RwLock<HashMap<CapabilityKind, Arc<dyn CoreService>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `kind` to `service`, replacing any previous registration.
    pub fn register(&self, kind: CapabilityKind, service: Arc<dyn CoreService>) {
        debug!(kind = %kind, service = service.name(), "Registered core service");
        self.services.write().insert(kind, service);
    }

    pub fn get(&self, kind: CapabilityKind) -> Option<Arc<dyn CoreService>> {
        self.services.read().get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<CapabilityKind> {
        let mut kinds: Vec<_> = self.services.read().keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Call handle given to one extension.
#[derive(Clone)]
pub struct ExtensionProxy {
    identity: ExtensionId,
    registry: Arc<CapabilityRegistry>,
    audit: Arc<AuditLog>,
    services: Arc<ServiceTable>,
    call_timeout: Duration,
}

impl ExtensionProxy {
    /// Bind a proxy to `identity`.
    pub fn new(
        identity: ExtensionId,
        registry: Arc<CapabilityRegistry>,
        audit: Arc<AuditLog>,
        services: Arc<ServiceTable>,
    ) -> Self {
        Self {
            identity,
            registry,
            audit,
            services,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Use `timeout` for [`invoke`](Self::invoke).
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The identity this proxy acts for.
    pub fn identity(&self) -> ExtensionId {
        self.identity
    }

    /// Invoke a core service with the proxy's default timeout.
    pub async fn invoke(&self, request: ServiceRequest) -> Result<Value, ProxyError> {
        self.invoke_with_timeout(request, self.call_timeout).await
    }

    /// Invoke a core service, giving up after `timeout`.
    ///
    /// The decision is written to the audit log before the service runs. A
    /// denied call never reaches the service, and every denial looks the
    /// same to the caller whatever its cause. If the audit record cannot be
    /// written the call is denied.
    pub async fn invoke_with_timeout(
        &self,
        request: ServiceRequest,
        timeout: Duration,
    ) -> Result<Value, ProxyError> {
        let kind = request.kind;

        // Ask the registry
        let (outcome, reason) =
            match self
                .registry
                .authorize(self.identity, kind, request.scope.as_ref())
            {
                Ok(_) => (AuditOutcome::Allowed, None),
                Err(err) => (denial_outcome(&err), Some(err.to_string())),
            };

        // Record the decision before anything is forwarded
        let entry = AuditEntry {
            owner: self.identity,
            kind,
            scope: request.scope.clone(),
            operation: request.operation.clone(),
            outcome,
            summary: reason,
        };
        if let Err(err) = self.audit.record(entry) {
            warn!(
                identity = %self.identity,
                kind = %kind,
                error = %err,
                "Audit write failed, denying call"
            );
            return Err(self.denied(&request));
        }

        if !outcome.is_allowed() {
            debug!(identity = %self.identity, kind = %kind, outcome = %outcome, "Call denied");
            return Err(self.denied(&request));
        }

        // Forward to the service
        let service = self
            .services
            .get(kind)
            .ok_or(ProxyError::ServiceUnavailable(kind))?;

        match tokio::time::timeout(timeout, service.call(self.identity, &request)).await {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => {
                warn!(
                    identity = %self.identity,
                    kind = %kind,
                    service = service.name(),
                    "Core service call timed out"
                );
                Err(ProxyError::Timeout {
                    kind,
                    timeout_ms: millis(timeout),
                })
            }
        }
    }

    fn denied(&self, request: &ServiceRequest) -> ProxyError {
        ProxyError::CapabilityDenied {
            kind: request.kind,
            scope: request.scope.clone(),
        }
    }
}

impl fmt::Debug for ExtensionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionProxy")
            .field("identity", &self.identity)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn denial_outcome(err: &CapabilityError) -> AuditOutcome {
    match err {
        CapabilityError::CapabilityRevoked { .. } => AuditOutcome::DeniedRevoked,
        CapabilityError::UnknownIdentity(_) | CapabilityError::IdentityClosing(_) => {
            AuditOutcome::DeniedUnknownExtension
        }
        _ => AuditOutcome::DeniedNoCapability,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl CoreService for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(
            &self,
            _caller: ExtensionId,
            request: &ServiceRequest,
        ) -> Result<Value, ServiceError> {
            Ok(request.payload.clone())
        }
    }

    fn setup() -> (ExtensionProxy, Arc<CapabilityRegistry>, Arc<AuditLog>) {
        let registry = Arc::new(CapabilityRegistry::new());
        let audit = Arc::new(AuditLog::in_memory());
        let services = Arc::new(ServiceTable::new());
        services.register(CapabilityKind::Event, Arc::new(Echo));

        let identity = ExtensionId::new();
        registry.register_identity(identity);
        let proxy = ExtensionProxy::new(identity, registry.clone(), audit.clone(), services);
        (proxy, registry, audit)
    }

    #[tokio::test]
    async fn test_allowed_call_is_forwarded_and_audited() {
        let (proxy, registry, audit) = setup();
        registry
            .grant(proxy.identity(), CapabilityKind::Event, Some(Scope::new("time.*").unwrap()))
            .unwrap();

        let request = ServiceRequest::new(CapabilityKind::Event, "publish")
            .with_scope(Scope::new("time.tick").unwrap())
            .with_payload(json!({"at": 1}));
        assert_eq!(proxy.invoke(request).await.unwrap(), json!({"at": 1}));

        let records = audit.query(&AuditQuery::new());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Allowed);
        assert_eq!(records[0].operation, "publish");
    }

    #[tokio::test]
    async fn test_denials_are_uniform_and_audited() {
        let (proxy, registry, audit) = setup();
        let request = ServiceRequest::new(CapabilityKind::Event, "publish");

        let never = proxy.invoke(request.clone()).await.unwrap_err();

        registry.grant(proxy.identity(), CapabilityKind::Event, None).unwrap();
        registry.revoke(proxy.identity(), CapabilityKind::Event, None).unwrap();
        let revoked = proxy.invoke(request.clone()).await.unwrap_err();

        registry.revoke_all(proxy.identity()).unwrap();
        let unknown = proxy.invoke(request).await.unwrap_err();

        assert_eq!(never, revoked);
        assert_eq!(revoked, unknown);

        let outcomes: Vec<_> = audit
            .query(&AuditQuery::new())
            .into_iter()
            .map(|r| r.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![
                AuditOutcome::DeniedUnknownExtension,
                AuditOutcome::DeniedRevoked,
                AuditOutcome::DeniedNoCapability,
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_service() {
        let (proxy, registry, _audit) = setup();
        registry.grant(proxy.identity(), CapabilityKind::Audio, None).unwrap();

        let err = proxy
            .invoke(ServiceRequest::new(CapabilityKind::Audio, "play"))
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::ServiceUnavailable(CapabilityKind::Audio));
    }

    #[test]
    fn test_timeout_millis_saturate() {
        assert_eq!(millis(Duration::from_millis(250)), 250);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
