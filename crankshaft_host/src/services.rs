//! Built-in core services.
//!
//! Settings and view registration ship with the host; embedders register
//! services for the remaining capability kinds on the manager's
//! [`ServiceTable`](crankshaft_capability::proxy::ServiceTable).

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crankshaft_capability::proxy::{CoreService, ServiceRequest};
use crankshaft_core::capability::{CapabilityKind, Scope, SCOPE_WILDCARD};
use crankshaft_core::error::ServiceError;
use crankshaft_core::id::ExtensionId;

fn required_scope(request: &ServiceRequest) -> Result<&Scope, ServiceError> {
    request.scope.as_ref().ok_or_else(|| {
        ServiceError::InvalidRequest(format!("{} requires a scope", request.operation))
    })
}

fn unsupported(request: &ServiceRequest) -> ServiceError {
    ServiceError::UnsupportedOperation(format!("{} via {}", request.operation, request.kind))
}

/// Key/value settings store.
///
/// Operations: `get` and `list` under `read-settings`, `set` and `remove`
/// under `write-settings`. The request scope is the settings key; `list`
/// takes a wildcard scope such as `ui.*`.
#[derive(Debug, Default)]
pub struct SettingsService {
    values: RwLock<BTreeMap<String, Value>>,
}

impl SettingsService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed settings, e.g. from host defaults.
    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            values: RwLock::new(values.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.write().insert(key.into(), value);
    }

    fn list(&self, pattern: &Scope) -> Value {
        let rule = CapabilityKind::ReadSettings.scope_rule();
        let values = self.values.read();
        let matching: serde_json::Map<String, Value> = values
            .iter()
            .filter(|(key, _)| {
                Scope::new(key.as_str())
                    .map(|key| rule.permits(Some(pattern), Some(&key)))
                    .unwrap_or(false)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(matching)
    }
}

#[async_trait]
impl CoreService for SettingsService {
    fn name(&self) -> &str {
        "settings"
    }

    async fn call(&self, caller: ExtensionId, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let scope = required_scope(request)?;
        let key = scope.as_str();

        match (request.kind, request.operation.as_str()) {
            (CapabilityKind::ReadSettings, "get") => self
                .get(key)
                .ok_or_else(|| ServiceError::NotFound(key.to_string())),
            (CapabilityKind::ReadSettings, "list") => Ok(self.list(scope)),
            (CapabilityKind::WriteSettings, "set") => {
                if key.ends_with(SCOPE_WILDCARD) {
                    return Err(ServiceError::InvalidRequest(format!(
                        "cannot set wildcard key {key}"
                    )));
                }
                debug!(caller = %caller, key, "Setting changed by extension");
                let previous = self.values.write().insert(key.to_string(), request.payload.clone());
                Ok(previous.unwrap_or(Value::Null))
            }
            (CapabilityKind::WriteSettings, "remove") => Ok(self
                .values
                .write()
                .remove(key)
                .unwrap_or(Value::Null)),
            _ => Err(unsupported(request)),
        }
    }
}

/// A view contributed by an extension.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegisteredView {
    pub slot: String,
    pub owner: ExtensionId,
    pub title: String,
    pub payload: Value,
}

/// Registry of view slots in the host shell.
///
/// Operations under `register-view`: `register` claims the slot named by the
/// request scope (payload `{"title": ...}`), `unregister` releases it. A slot
/// belongs to one extension at a time.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: RwLock<BTreeMap<String, RegisteredView>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every registered view, ordered by slot.
    pub fn views(&self) -> Vec<RegisteredView> {
        self.views.read().values().cloned().collect()
    }

    /// Drop every view owned by `owner`. Returns how many were removed.
    pub fn remove_owner(&self, owner: ExtensionId) -> usize {
        let mut views = self.views.write();
        let before = views.len();
        views.retain(|_, view| view.owner != owner);
        before - views.len()
    }
}

#[async_trait]
impl CoreService for ViewRegistry {
    fn name(&self) -> &str {
        "views"
    }

    async fn call(&self, caller: ExtensionId, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let slot = required_scope(request)?.as_str().to_string();
        if slot.contains('*') {
            return Err(ServiceError::InvalidRequest(format!(
                "view slot must be concrete: {slot}"
            )));
        }

        let mut views = self.views.write();
        match request.operation.as_str() {
            "register" => {
                if let Some(existing) = views.get(&slot) {
                    if existing.owner != caller {
                        return Err(ServiceError::Failed(format!("slot {slot} is taken")));
                    }
                }
                let title = request
                    .payload
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or(&slot)
                    .to_string();
                views.insert(
                    slot.clone(),
                    RegisteredView {
                        slot: slot.clone(),
                        owner: caller,
                        title,
                        payload: request.payload.clone(),
                    },
                );
                debug!(caller = %caller, slot = %slot, "View registered");
                Ok(json!({ "slot": slot }))
            }
            "unregister" => match views.get(&slot) {
                Some(view) if view.owner == caller => {
                    views.remove(&slot);
                    Ok(Value::Bool(true))
                }
                Some(_) => Err(ServiceError::Failed(format!("slot {slot} is owned by another extension"))),
                None => Err(ServiceError::NotFound(slot)),
            },
            _ => Err(unsupported(request)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: CapabilityKind, operation: &str, scope: &str) -> ServiceRequest {
        ServiceRequest::new(kind, operation).with_scope(Scope::new(scope).unwrap())
    }

    #[tokio::test]
    async fn test_settings_operations() {
        let settings = SettingsService::with_values([
            ("ui.language", json!("en")),
            ("ui.theme", json!("dark")),
            ("audio.volume", json!(40)),
        ]);
        let caller = ExtensionId::new();

        let value = settings
            .call(caller, &request(CapabilityKind::ReadSettings, "get", "ui.language"))
            .await
            .unwrap();
        assert_eq!(value, json!("en"));

        let listed = settings
            .call(caller, &request(CapabilityKind::ReadSettings, "list", "ui.*"))
            .await
            .unwrap();
        assert_eq!(listed, json!({"ui.language": "en", "ui.theme": "dark"}));

        settings
            .call(
                caller,
                &request(CapabilityKind::WriteSettings, "set", "ui.theme").with_payload(json!("light")),
            )
            .await
            .unwrap();
        assert_eq!(settings.get("ui.theme"), Some(json!("light")));

        // A read grant cannot be used to write.
        assert!(matches!(
            settings
                .call(caller, &request(CapabilityKind::ReadSettings, "set", "ui.theme"))
                .await,
            Err(ServiceError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_view_slots_are_exclusive() {
        let views = ViewRegistry::new();
        let a = ExtensionId::new();
        let b = ExtensionId::new();

        let register = request(CapabilityKind::RegisterView, "register", "dashboard.weather")
            .with_payload(json!({"title": "Weather"}));
        views.call(a, &register).await.unwrap();
        assert!(matches!(
            views.call(b, &register).await,
            Err(ServiceError::Failed(_))
        ));

        assert_eq!(views.views()[0].title, "Weather");
        assert_eq!(views.remove_owner(a), 1);
        assert!(views.views().is_empty());
    }
}
