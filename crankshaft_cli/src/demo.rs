//! Built-in demo extensions and the `demo` command.
//!
//! The same entry points back the manifests under `demos/`, so `load demos`
//! runs them from disk.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use colored::Colorize;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crankshaft_capability::audit::AuditQuery;
use crankshaft_capability::proxy::{CoreService, ExtensionProxy, ServiceRequest};
use crankshaft_core::capability::{CapabilityKind, Scope};
use crankshaft_core::error::{ExtensionError, ServiceError};
use crankshaft_core::id::ExtensionId;
use crankshaft_core::manifest::{CapabilityDeclaration, ExtensionType, ManifestDocument};
use crankshaft_host::{
    Extension, ExtensionCandidate, ExtensionCatalog, ExtensionContext, ExtensionHostManager,
    HostConfig,
};

use crate::commands::{print_record, print_report};

const WEATHER_HOST: &str = "api.weather.example";

fn scope(raw: &str) -> Result<Scope, ExtensionError> {
    Scope::new(raw).map_err(|e| ExtensionError::Failed(e.to_string()))
}

/// Shows the local forecast on the dashboard.
#[derive(Clone, Default)]
pub struct WeatherWidget {
    proxy: Arc<Mutex<Option<ExtensionProxy>>>,
}

impl WeatherWidget {
    /// Fetch the forecast in the user's language.
    pub async fn refresh(&self) -> Result<Value, ExtensionError> {
        let proxy = self
            .proxy
            .lock()
            .clone()
            .ok_or_else(|| ExtensionError::Failed("not initialized".to_string()))?;

        let language = proxy
            .invoke(ServiceRequest::new(CapabilityKind::ReadSettings, "get").with_scope(scope("ui.language")?))
            .await?;
        let forecast = proxy
            .invoke(
                ServiceRequest::new(CapabilityKind::NetworkAccess, "get")
                    .with_scope(scope(WEATHER_HOST)?)
                    .with_payload(json!({ "path": "/forecast", "lang": language })),
            )
            .await?;
        Ok(forecast)
    }
}

#[async_trait]
impl Extension for WeatherWidget {
    async fn initialize(&self, context: ExtensionContext) -> Result<(), ExtensionError> {
        context
            .proxy
            .invoke(
                ServiceRequest::new(CapabilityKind::RegisterView, "register")
                    .with_scope(scope("dashboard.weather")?)
                    .with_payload(json!({ "title": "Weather" })),
            )
            .await?;
        *self.proxy.lock() = Some(context.proxy);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExtensionError> {
        self.proxy.lock().take();
        Ok(())
    }
}

/// Publishes a start event.
struct Clock;

#[async_trait]
impl Extension for Clock {
    async fn initialize(&self, context: ExtensionContext) -> Result<(), ExtensionError> {
        context
            .proxy
            .invoke(
                ServiceRequest::new(CapabilityKind::Event, "publish")
                    .with_scope(scope("time.started")?)
                    .with_payload(json!({ "by": context.manifest.id })),
            )
            .await?;
        Ok(())
    }
}

/// Reaches past its grants; the denials end up in the audit trail.
struct Snooper;

#[async_trait]
impl Extension for Snooper {
    async fn initialize(&self, context: ExtensionContext) -> Result<(), ExtensionError> {
        let proxy = context.proxy;
        proxy
            .invoke(ServiceRequest::new(CapabilityKind::ReadSettings, "get").with_scope(scope("ui.theme")?))
            .await?;

        let probes = [
            ServiceRequest::new(CapabilityKind::ReadSettings, "get").with_scope(scope("audio.volume")?),
            ServiceRequest::new(CapabilityKind::Contacts, "list"),
        ];
        for probe in probes {
            if let Err(err) = proxy.invoke(probe).await {
                warn!(extension = %context.manifest.id, error = %err, "Probe refused");
            }
        }
        Ok(())
    }
}

/// Canned forecasts for the weather host.
struct WeatherService;

#[async_trait]
impl CoreService for WeatherService {
    fn name(&self) -> &str {
        "weather"
    }

    async fn call(&self, _caller: ExtensionId, request: &ServiceRequest) -> Result<Value, ServiceError> {
        match request.scope.as_ref().map(Scope::as_str) {
            Some(WEATHER_HOST) if request.operation == "get" => Ok(json!({
                "summary": "light rain",
                "high_c": 14,
                "low_c": 8,
                "lang": request.payload.get("lang").cloned().unwrap_or(Value::Null),
            })),
            Some(WEATHER_HOST) => Err(ServiceError::UnsupportedOperation(request.operation.clone())),
            other => Err(ServiceError::NotFound(format!("host {}", other.unwrap_or("<none>")))),
        }
    }
}

/// Logs published events.
struct EventLog;

#[async_trait]
impl CoreService for EventLog {
    fn name(&self) -> &str {
        "events"
    }

    async fn call(&self, caller: ExtensionId, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let topic = request
            .scope
            .as_ref()
            .ok_or_else(|| ServiceError::InvalidRequest("publish requires a topic".to_string()))?;
        info!(caller = %caller, topic = %topic, payload = %request.payload, "Extension event");
        Ok(Value::Bool(true))
    }
}

/// Catalog of the demo entry points.
pub fn catalog() -> ExtensionCatalog {
    catalog_with(WeatherWidget::default())
}

/// Catalog whose weather widget shares state with `widget`.
pub fn catalog_with(widget: WeatherWidget) -> ExtensionCatalog {
    ExtensionCatalog::new()
        .with("weather-widget", move || widget.clone())
        .with("clock", || Clock)
        .with("snooper", || Snooper)
}

/// Default settings and the demo-only services.
pub fn seed(host: &ExtensionHostManager) {
    let settings = host.settings();
    settings.set("ui.language", json!("en"));
    settings.set("ui.theme", json!("dark"));
    settings.set("audio.volume", json!(40));

    host.services()
        .register(CapabilityKind::NetworkAccess, Arc::new(WeatherService));
    host.services().register(CapabilityKind::Event, Arc::new(EventLog));
}

fn document(
    id: &str,
    name: &str,
    extension_type: ExtensionType,
    capabilities: &[(&str, Option<&str>)],
) -> ManifestDocument {
    ManifestDocument {
        id: id.to_string(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        extension_type,
        capabilities: capabilities
            .iter()
            .map(|(kind, scope)| CapabilityDeclaration::new(*kind, *scope))
            .collect(),
        ..ManifestDocument::default()
    }
}

/// The manifests the demo loads, mirroring `demos/`.
pub fn manifests() -> Vec<ManifestDocument> {
    let weather = document(
        "weather-widget",
        "Weather Widget",
        ExtensionType::Ui,
        &[
            ("read-settings", Some("ui.*")),
            ("network-access", Some(WEATHER_HOST)),
            ("register-view", Some("dashboard.*")),
        ],
    );

    let mut clock = document("clock", "Clock", ExtensionType::Service, &[("event", Some("time.*"))]);
    clock.version = "0.3.1".to_string();

    let mut snooper = document(
        "snooper",
        "Snooper",
        ExtensionType::Integration,
        &[("read-settings", Some("ui.theme"))],
    );
    snooper.dependencies = vec!["clock".to_string()];

    let mut broken = document(
        "root-kit",
        "Root Kit",
        ExtensionType::Platform,
        &[("read-settings", None), ("root-shell", None)],
    );
    broken.entry_point = Some("snooper".to_string());

    vec![weather, clock, snooper, broken]
}

fn section(title: &str) {
    println!();
    println!("{}", title.bold());
}

/// Execute the demo command
pub async fn run(config: &HostConfig) -> Result<()> {
    let widget = WeatherWidget::default();
    let host = ExtensionHostManager::from_config(config, catalog_with(widget.clone()))?;
    seed(&host);
    let mut events = host.subscribe();

    section("Loading extensions");
    let candidates = manifests()
        .into_iter()
        .map(ExtensionCandidate::from_document)
        .collect();
    for report in host.load_all(candidates).await {
        print_report(&report);
    }

    section("Loaded extensions");
    for summary in host.list() {
        println!(
            "  {} {}  {} capabilities, {} active",
            format!("{:<16}", summary.name).cyan(),
            summary.version,
            summary.declared_capabilities,
            summary.active_tokens
        );
    }
    for view in host.views().views() {
        println!("  view {} -> {}", view.slot, view.title);
    }

    section("Refreshing the weather widget");
    match widget.refresh().await {
        Ok(forecast) => println!("  {} {}", "ok".green(), forecast),
        Err(err) => println!("  {} {}", "error".red(), err),
    }

    let identity = host
        .find("weather-widget")
        .ok_or_else(|| anyhow!("weather-widget did not load"))?;
    let revoked = host.revoke_capability(
        identity,
        CapabilityKind::NetworkAccess,
        Some(&Scope::new(WEATHER_HOST)?),
    )?;
    section(&format!("Revoked network-access from weather-widget ({revoked} token)"));
    match widget.refresh().await {
        Ok(forecast) => println!("  {} {}", "ok".green(), forecast),
        Err(err) => println!("  {} {}", "refused".red(), err),
    }

    section("Audit trail");
    for record in host.query_audit(&AuditQuery::new().limit(20)) {
        print_record(&record);
    }

    host.shutdown().await?;

    section("Host events");
    while let Ok(event) = events.try_recv() {
        println!("  {}", serde_json::to_string(&event)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crankshaft_capability::audit::{AuditLog, AuditOutcome};
    use crankshaft_core::error::LoadError;
    use crankshaft_host::HostOptions;

    #[tokio::test]
    async fn test_demo_scenario() {
        let widget = WeatherWidget::default();
        let host = ExtensionHostManager::new(
            catalog_with(widget.clone()),
            Arc::new(AuditLog::in_memory()),
            HostOptions::default(),
        );
        seed(&host);

        let candidates = manifests()
            .into_iter()
            .map(ExtensionCandidate::from_document)
            .collect();
        let reports = host.load_all(candidates).await;
        assert!(reports[..3].iter().all(|r| r.is_loaded()));
        assert!(matches!(reports[3].error(), Some(LoadError::ManifestInvalid { .. })));

        let forecast = widget.refresh().await.unwrap();
        assert_eq!(forecast["lang"], json!("en"));

        let identity = host.find("weather-widget").unwrap();
        host.revoke_capability(
            identity,
            CapabilityKind::NetworkAccess,
            Some(&Scope::new(WEATHER_HOST).unwrap()),
        )
        .unwrap();
        assert!(widget.refresh().await.is_err());

        let snooper = host.find("snooper").unwrap();
        let denied = host.query_audit(
            &AuditQuery::new()
                .owner(snooper)
                .outcome(AuditOutcome::DeniedNoCapability),
        );
        assert_eq!(denied.len(), 2);

        host.shutdown().await.unwrap();
        assert!(widget.proxy.lock().is_none());
    }
}
