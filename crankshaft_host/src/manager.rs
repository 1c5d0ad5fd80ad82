//! Extension Host Manager
//!
//! Owns the registry, audit log, services and every loaded extension. The UI
//! talks to the host only through this type: it loads and unloads
//! extensions, revokes capabilities, reads the audit trail and subscribes to
//! [`HostEvent`]s.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crankshaft_capability::audit::{AuditLog, AuditQuery, AuditRecord, JsonlAuditStore};
use crankshaft_capability::proxy::ServiceTable;
use crankshaft_capability::registry::CapabilityRegistry;
use crankshaft_core::capability::{CapabilityKind, Scope};
use crankshaft_core::error::{CapabilityError, Error, LoadError};
use crankshaft_core::event::{EventBus, HostEvent};
use crankshaft_core::id::ExtensionId;
use crankshaft_core::manifest::{ExtensionManifest, ExtensionType};
use crankshaft_core::version::{host_version, Version};

use crate::config::HostConfig;
use crate::discovery::{ExtensionCandidate, ExtensionDiscovery};
use crate::extension::ExtensionCatalog;
use crate::loader::{ExtensionLoader, LoadState, LoadedExtension, LoaderOptions};
use crate::services::{SettingsService, ViewRegistry};

/// Timeouts and host properties used by the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostOptions {
    pub load_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub platform: String,
    pub host_version: Version,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

impl From<&HostConfig> for HostOptions {
    fn from(config: &HostConfig) -> Self {
        Self {
            load_timeout: config.load_timeout(),
            call_timeout: config.call_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            platform: config.platform.clone(),
            host_version: host_version(),
        }
    }
}

/// Terminal result of one load attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded { identity: ExtensionId },
    Failed { reason: String, #[serde(skip)] error: LoadError },
}

/// One report per candidate passed to [`ExtensionHostManager::load_all`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub extension: String,
    pub state: LoadState,
    #[serde(flatten)]
    pub outcome: LoadOutcome,
}

impl LoadReport {
    fn loaded(extension: String, identity: ExtensionId) -> Self {
        Self {
            extension,
            state: LoadState::Instantiated,
            outcome: LoadOutcome::Loaded { identity },
        }
    }

    fn failed(extension: String, error: LoadError) -> Self {
        Self {
            extension,
            state: LoadState::Failed,
            outcome: LoadOutcome::Failed {
                reason: error.to_string(),
                error,
            },
        }
    }

    pub fn identity(&self) -> Option<ExtensionId> {
        match &self.outcome {
            LoadOutcome::Loaded { identity } => Some(*identity),
            LoadOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&LoadError> {
        match &self.outcome {
            LoadOutcome::Loaded { .. } => None,
            LoadOutcome::Failed { error, .. } => Some(error),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.identity().is_some()
    }
}

/// What the UI shows for one loaded extension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExtensionSummary {
    pub identity: ExtensionId,
    pub id: String,
    pub name: String,
    pub version: Version,
    pub extension_type: ExtensionType,
    pub declared_capabilities: usize,
    pub active_tokens: usize,
    pub loaded_at: DateTime<Utc>,
}

struct HostedExtension {
    loaded: LoadedExtension,
    /// Load order, used to unload dependents before their dependencies.
    sequence: u64,
}

/// The extension host.
pub struct ExtensionHostManager {
    registry: Arc<CapabilityRegistry>,
    audit: Arc<AuditLog>,
    services: Arc<ServiceTable>,
    settings: Arc<SettingsService>,
    views: Arc<ViewRegistry>,
    loader: ExtensionLoader,
    extensions: DashMap<ExtensionId, Arc<HostedExtension>>,
    /// Manifest ids that are loading or loaded.
    reserved: DashSet<String>,
    events: EventBus,
    options: HostOptions,
    next_sequence: AtomicU64,
}

impl ExtensionHostManager {
    /// Create a host with the built-in settings and view services.
    pub fn new(catalog: ExtensionCatalog, audit: Arc<AuditLog>, options: HostOptions) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let services = Arc::new(ServiceTable::new());

        let settings = Arc::new(SettingsService::new());
        services.register(CapabilityKind::ReadSettings, settings.clone());
        services.register(CapabilityKind::WriteSettings, settings.clone());
        let views = Arc::new(ViewRegistry::new());
        services.register(CapabilityKind::RegisterView, views.clone());

        let loader = ExtensionLoader::new(
            registry.clone(),
            audit.clone(),
            services.clone(),
            catalog,
            LoaderOptions {
                host_version: options.host_version,
                platform: options.platform.clone(),
                call_timeout: options.call_timeout,
            },
        );

        Self {
            registry,
            audit,
            services,
            settings,
            views,
            loader,
            extensions: DashMap::new(),
            reserved: DashSet::new(),
            events: EventBus::default(),
            options,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Create a host from configuration, restoring the audit log from
    /// `audit_log_path` when one is set.
    pub fn from_config(config: &HostConfig, catalog: ExtensionCatalog) -> Result<Self, Error> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let audit = match &config.audit_log_path {
            Some(path) => AuditLog::open(
                Arc::new(JsonlAuditStore::new(path)),
                config.audit_buffer_capacity,
            )?,
            None => AuditLog::in_memory(),
        }
        .with_memory_window(config.audit_memory_window);

        Ok(Self::new(catalog, Arc::new(audit), HostOptions::from(config)))
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Route further capability kinds to services here.
    pub fn services(&self) -> &Arc<ServiceTable> {
        &self.services
    }

    pub fn settings(&self) -> &Arc<SettingsService> {
        &self.settings
    }

    pub fn views(&self) -> &Arc<ViewRegistry> {
        &self.views
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// Receive lifecycle and revocation events.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Load a batch of candidates in dependency order.
    ///
    /// Every candidate ends in exactly one report, returned in input order.
    /// A failure only affects the failing extension and whatever depends on
    /// it; missing dependencies and cycles fail just the extensions involved.
    pub async fn load_all(&self, candidates: Vec<ExtensionCandidate>) -> Vec<LoadReport> {
        let mut reports: Vec<Option<LoadReport>> = vec![None; candidates.len()];
        let timeout = self.options.load_timeout;

        // Validate everything first
        let mut manifests: BTreeMap<String, (usize, ExtensionManifest)> = BTreeMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            match self.loader.validate(candidate, timeout).await {
                Ok(manifest) => {
                    // Claimed until the load fails or the extension is unloaded.
                    if self.reserved.insert(manifest.id.clone()) {
                        manifests.insert(manifest.id.clone(), (index, manifest));
                    } else {
                        reports[index] = Some(self.fail(
                            manifest.id.clone(),
                            LoadError::AlreadyLoaded(manifest.id.clone()),
                        ));
                    }
                }
                Err(err) => reports[index] = Some(self.fail(candidate.label.clone(), err)),
            }
        }

        // Order by dependencies
        let plan = self.plan(&manifests);
        for (id, err) in plan.rejected {
            if let Some((index, _)) = manifests.remove(&id) {
                self.reserved.remove(&id);
                reports[index] = Some(self.fail(id, err));
            }
        }

        // Instantiate in order
        let mut failed: BTreeSet<String> = BTreeSet::new();
        for id in plan.order {
            let Some((index, manifest)) = manifests.remove(&id) else {
                continue;
            };

            let broken: Vec<String> = manifest
                .dependencies
                .iter()
                .filter(|dep| failed.contains(*dep))
                .cloned()
                .collect();
            if !broken.is_empty() {
                failed.insert(id.clone());
                self.reserved.remove(&id);
                reports[index] = Some(self.fail(
                    id.clone(),
                    LoadError::MissingDependencies {
                        extension: id,
                        missing: broken,
                    },
                ));
                continue;
            }

            match self.loader.instantiate(manifest, timeout).await {
                Ok(loaded) => {
                    reports[index] = Some(self.admit(loaded));
                }
                Err(err) => {
                    failed.insert(id.clone());
                    self.reserved.remove(&id);
                    reports[index] = Some(self.fail(id, err));
                }
            }
        }

        reports
            .into_iter()
            .zip(candidates.iter())
            .map(|(report, candidate)| {
                report.unwrap_or_else(|| {
                    LoadReport::failed(
                        candidate.label.clone(),
                        LoadError::Discovery("candidate was not processed".to_string()),
                    )
                })
            })
            .collect()
    }

    /// Discover manifests under `dir` and load them.
    pub async fn load_from_directory(&self, dir: impl AsRef<Path>) -> Result<Vec<LoadReport>, LoadError> {
        let candidates = ExtensionDiscovery::new(dir).discover()?;
        info!(count = candidates.len(), "Loading discovered extensions");
        Ok(self.load_all(candidates).await)
    }

    /// Load a single candidate.
    pub async fn load(&self, candidate: ExtensionCandidate) -> LoadReport {
        let label = candidate.label.clone();
        self.load_all(vec![candidate])
            .await
            .pop()
            .unwrap_or_else(|| {
                LoadReport::failed(label, LoadError::Discovery("no report".to_string()))
            })
    }

    fn admit(&self, loaded: LoadedExtension) -> LoadReport {
        let identity = loaded.identity;
        let extension = loaded.manifest.id.clone();
        let name = loaded.manifest.name.clone();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);

        self.extensions
            .insert(identity, Arc::new(HostedExtension { loaded, sequence }));
        self.events.publish(HostEvent::ExtensionLoaded {
            identity,
            extension: extension.clone(),
            name,
            timestamp: Utc::now(),
        });
        LoadReport::loaded(extension, identity)
    }

    fn fail(&self, extension: String, error: LoadError) -> LoadReport {
        warn!(extension = %extension, error = %error, "Extension load failed");
        self.events.publish(HostEvent::ExtensionFailed {
            extension: extension.clone(),
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
        LoadReport::failed(extension, error)
    }

    fn plan(&self, manifests: &BTreeMap<String, (usize, ExtensionManifest)>) -> LoadPlan {
        let loaded: BTreeSet<String> = self
            .extensions
            .iter()
            .map(|entry| entry.value().loaded.manifest.id.clone())
            .collect();
        let graph: BTreeMap<String, Vec<String>> = manifests
            .iter()
            .map(|(id, (_, manifest))| (id.clone(), manifest.dependencies.clone()))
            .collect();
        resolve_order(&graph, &loaded)
    }

    /// Unload one extension.
    ///
    /// Capabilities are revoked before the extension's `shutdown` runs, so
    /// a call that has not yet passed its check fails from this point on.
    /// Returns the number of tokens revoked.
    pub async fn unload(&self, identity: ExtensionId) -> Result<usize, Error> {
        let Some((_, hosted)) = self.extensions.remove(&identity) else {
            return Err(CapabilityError::UnknownIdentity(identity).into());
        };
        let extension = hosted.loaded.manifest.id.clone();

        let revoked = self.registry.revoke_all(identity)?;
        let views = self.views.remove_owner(identity);

        match tokio::time::timeout(self.options.shutdown_timeout, hosted.loaded.instance.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(extension = %extension, error = %err, "Extension shutdown failed"),
            Err(_) => warn!(extension = %extension, "Extension shutdown timed out"),
        }

        self.reserved.remove(&extension);
        info!(extension = %extension, identity = %identity, revoked, views, "Extension unloaded");
        self.events.publish(HostEvent::ExtensionUnloaded {
            identity,
            extension,
            timestamp: Utc::now(),
        });
        Ok(revoked)
    }

    /// Unload every extension, dependents first. Returns how many were
    /// unloaded.
    pub async fn unload_all(&self) -> usize {
        let mut order: Vec<(u64, ExtensionId)> = self
            .extensions
            .iter()
            .map(|entry| (entry.value().sequence, *entry.key()))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0));

        let mut unloaded = 0;
        for (_, identity) in order {
            match self.unload(identity).await {
                Ok(_) => unloaded += 1,
                // Unloaded concurrently.
                Err(err) => debug!(identity = %identity, error = %err, "Skipping unload"),
            }
        }
        unloaded
    }

    /// Revoke `(kind, scope)` from a loaded extension at runtime.
    pub fn revoke_capability(
        &self,
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<&Scope>,
    ) -> Result<usize, Error> {
        let count = self.registry.revoke(identity, kind, scope)?;
        self.publish_revocation(identity, kind, scope.cloned(), count);
        Ok(count)
    }

    /// Revoke every scope of `kind` from a loaded extension.
    pub fn revoke_kind(&self, identity: ExtensionId, kind: CapabilityKind) -> Result<usize, Error> {
        let count = self.registry.revoke_kind(identity, kind)?;
        self.publish_revocation(identity, kind, None, count);
        Ok(count)
    }

    fn publish_revocation(
        &self,
        identity: ExtensionId,
        kind: CapabilityKind,
        scope: Option<Scope>,
        count: usize,
    ) {
        if count == 0 {
            return;
        }
        self.events.publish(HostEvent::CapabilityRevoked {
            identity,
            kind,
            scope,
            count,
            timestamp: Utc::now(),
        });
    }

    /// Summaries of every loaded extension, ordered by name.
    pub fn list(&self) -> Vec<ExtensionSummary> {
        let mut summaries: Vec<ExtensionSummary> = self
            .extensions
            .iter()
            .map(|entry| self.summarize(entry.value()))
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn loaded_count(&self) -> usize {
        self.extensions.len()
    }

    pub fn summary(&self, identity: ExtensionId) -> Option<ExtensionSummary> {
        self.extensions
            .get(&identity)
            .map(|entry| self.summarize(entry.value()))
    }

    /// Identity of the loaded extension with manifest id `id`.
    pub fn find(&self, id: &str) -> Option<ExtensionId> {
        self.extensions
            .iter()
            .find(|entry| entry.value().loaded.manifest.id == id)
            .map(|entry| *entry.key())
    }

    fn summarize(&self, hosted: &HostedExtension) -> ExtensionSummary {
        let loaded = &hosted.loaded;
        ExtensionSummary {
            identity: loaded.identity,
            id: loaded.manifest.id.clone(),
            name: loaded.manifest.name.clone(),
            version: loaded.manifest.version,
            extension_type: loaded.manifest.extension_type,
            declared_capabilities: loaded.manifest.capabilities.len(),
            active_tokens: self.registry.active_count(loaded.identity).unwrap_or(0),
            loaded_at: loaded.loaded_at,
        }
    }

    pub fn query_audit(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        self.audit.query(query)
    }

    /// Unload everything, then flush and close the audit log.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let unloaded = self.unload_all().await;
        if let Err(err) = self.audit.shutdown() {
            error!(error = %err, "Audit log did not close cleanly");
            return Err(err.into());
        }
        info!(unloaded, "Extension host shut down");
        Ok(())
    }

    /// Status snapshot for diagnostics.
    pub fn status(&self) -> serde_json::Value {
        json!({
            "host_version": self.options.host_version.to_string(),
            "platform": self.options.platform,
            "loaded": self.loaded_count(),
            "audit_records": self.audit.len(),
            "registry_halted": self.registry.is_halted(),
            "services": self.services.kinds().iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        })
    }
}

/// Dependency resolution result.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Load order: every id appears after its dependencies.
    pub order: Vec<String>,
    /// Ids that cannot be loaded, with the reason.
    pub rejected: Vec<(String, LoadError)>,
}

/// Order `graph` (id to dependency ids) topologically.
///
/// Dependencies satisfied by `loaded` count as present. An id whose
/// dependency is neither in the graph nor loaded, or depends on such an id,
/// is rejected with `MissingDependencies`; ids on a cycle are rejected with
/// `DependencyCycle`, and ids that merely depend on a cycle with
/// `MissingDependencies`. Ties are broken by id so the order is stable.
pub fn resolve_order(graph: &BTreeMap<String, Vec<String>>, loaded: &BTreeSet<String>) -> LoadPlan {
    let mut plan = LoadPlan::default();
    let mut rejected: BTreeMap<String, LoadError> = BTreeMap::new();

    // Missing dependencies, propagated to dependents
    for (id, deps) in graph {
        let missing: Vec<String> = deps
            .iter()
            .filter(|dep| !graph.contains_key(*dep) && !loaded.contains(*dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            rejected.insert(
                id.clone(),
                LoadError::MissingDependencies {
                    extension: id.clone(),
                    missing,
                },
            );
        }
    }
    loop {
        let newly: Vec<(String, Vec<String>)> = graph
            .iter()
            .filter(|(id, _)| !rejected.contains_key(*id))
            .filter_map(|(id, deps)| {
                let broken: Vec<String> = deps
                    .iter()
                    .filter(|dep| rejected.contains_key(*dep))
                    .cloned()
                    .collect();
                (!broken.is_empty()).then(|| (id.clone(), broken))
            })
            .collect();
        if newly.is_empty() {
            break;
        }
        for (id, broken) in newly {
            rejected.insert(
                id.clone(),
                LoadError::MissingDependencies {
                    extension: id,
                    missing: broken,
                },
            );
        }
    }

    // Kahn's algorithm over what is left
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = graph
        .iter()
        .filter(|(id, _)| !rejected.contains_key(*id))
        .map(|(id, deps)| {
            let in_batch = deps
                .iter()
                .filter(|dep| graph.contains_key(*dep))
                .map(String::as_str)
                .collect();
            (id.as_str(), in_batch)
        })
        .collect();

    loop {
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            pending.remove(id);
            for deps in pending.values_mut() {
                deps.remove(id);
            }
            plan.order.push(id.to_string());
        }
    }

    // Whatever remains sits on or behind a cycle
    let remaining: Vec<&str> = pending.keys().copied().collect();
    let reachability: HashMap<&str, BTreeSet<&str>> =
        remaining.iter().map(|id| (*id, reachable(&pending, id))).collect();

    for id in &remaining {
        let members: Vec<String> = remaining
            .iter()
            .filter(|other| {
                reachability[id].contains(*other) && reachability[*other].contains(id)
            })
            .map(|other| other.to_string())
            .collect();

        let err = if members.is_empty() {
            let blocked: Vec<String> = pending[id].iter().map(|d| d.to_string()).collect();
            LoadError::MissingDependencies {
                extension: id.to_string(),
                missing: blocked,
            }
        } else {
            LoadError::DependencyCycle {
                extension: id.to_string(),
                members,
            }
        };
        rejected.insert(id.to_string(), err);
    }

    plan.rejected = rejected.into_iter().collect();
    plan
}

fn reachable<'a>(pending: &BTreeMap<&'a str, BTreeSet<&'a str>>, from: &'a str) -> BTreeSet<&'a str> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if let Some(deps) = pending.get(node) {
            for dep in deps {
                if seen.insert(*dep) {
                    stack.push(*dep);
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_dependencies_load_first() {
        let plan = resolve_order(
            &graph(&[("ui", &["core", "net"]), ("net", &["core"]), ("core", &[])]),
            &BTreeSet::new(),
        );
        assert_eq!(plan.order, vec!["core", "net", "ui"]);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn test_missing_dependency_fails_dependents_only() {
        let plan = resolve_order(
            &graph(&[("a", &["ghost"]), ("b", &["a"]), ("c", &[])]),
            &BTreeSet::new(),
        );
        assert_eq!(plan.order, vec!["c"]);
        assert_eq!(plan.rejected.len(), 2);
        assert!(matches!(
            &plan.rejected[0],
            (id, LoadError::MissingDependencies { missing, .. }) if id == "a" && missing == &vec!["ghost".to_string()]
        ));
        assert!(matches!(
            &plan.rejected[1],
            (id, LoadError::MissingDependencies { missing, .. }) if id == "b" && missing == &vec!["a".to_string()]
        ));
    }

    #[test]
    fn test_already_loaded_dependency_counts() {
        let loaded: BTreeSet<String> = ["core".to_string()].into_iter().collect();
        let plan = resolve_order(&graph(&[("ui", &["core"])]), &loaded);
        assert_eq!(plan.order, vec!["ui"]);
    }

    #[test]
    fn test_cycle_members_and_bystanders() {
        let plan = resolve_order(
            &graph(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"]), ("d", &[])]),
            &BTreeSet::new(),
        );
        assert_eq!(plan.order, vec!["d"]);

        let errors: BTreeMap<_, _> = plan.rejected.into_iter().collect();
        assert!(matches!(
            &errors["a"],
            LoadError::DependencyCycle { members, .. } if members == &vec!["a".to_string(), "b".to_string()]
        ));
        assert!(matches!(&errors["b"], LoadError::DependencyCycle { .. }));
        assert!(matches!(&errors["c"], LoadError::MissingDependencies { .. }));
    }
}
