//! Extension manifest parsing and validation.
//!
//! A manifest is read into a [`ManifestDocument`], a loose serde mirror of the
//! file, and then validated into an [`ExtensionManifest`] whose capability
//! requests are typed. Validation never partially succeeds: one unrecognized
//! capability kind rejects the whole manifest.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityKind, Scope};
use crate::error::ManifestError;
use crate::version::Version;

/// File name probed first in an extension directory.
pub const MANIFEST_TOML: &str = "manifest.toml";

/// Fallback manifest file name.
pub const MANIFEST_JSON: &str = "manifest.json";

/// Platform entry meaning "runs everywhere".
pub const PLATFORM_ALL: &str = "all";

/// Broad category of an extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionType {
    #[default]
    Service,
    Ui,
    Integration,
    Platform,
}

impl fmt::Display for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Service => "service",
            Self::Ui => "ui",
            Self::Integration => "integration",
            Self::Platform => "platform",
        };
        f.write_str(name)
    }
}

/// One capability entry exactly as written in a manifest file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    /// Kind string, e.g. `read-settings`.
    pub kind: String,

    /// Optional scope string, e.g. `ui.*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl CapabilityDeclaration {
    pub fn new(kind: impl Into<String>, scope: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            scope: scope.map(str::to_string),
        }
    }
}

/// Unvalidated manifest as deserialized from TOML or JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    /// Stable extension id, e.g. `weather-widget`.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Extension version triplet.
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, rename = "type")]
    pub extension_type: ExtensionType,

    /// Ids of extensions that must be loaded first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Supported platforms; empty means all.
    #[serde(default)]
    pub platforms: Vec<String>,

    /// Oldest host version this extension runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_core_version: Option<String>,

    /// Catalog entry that instantiates the extension; defaults to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,

    /// Requested capabilities, in declaration order.
    #[serde(default)]
    pub capabilities: Vec<CapabilityDeclaration>,
}

impl ManifestDocument {
    /// Validate the document into a typed manifest.
    pub fn validate(&self) -> Result<ExtensionManifest, ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::EmptyField("id"));
        }
        if !is_valid_id(&self.id) {
            return Err(ManifestError::InvalidId(self.id.clone()));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::EmptyField("name"));
        }

        let version = parse_version("version", &self.version)?;
        let min_core_version = self
            .min_core_version
            .as_deref()
            .map(|value| parse_version("min_core_version", value))
            .transpose()?;

        for dependency in &self.dependencies {
            if !is_valid_id(dependency) {
                return Err(ManifestError::InvalidDependency(dependency.clone()));
            }
            if dependency == &self.id {
                return Err(ManifestError::SelfDependency(self.id.clone()));
            }
        }

        let mut seen = HashSet::new();
        let mut capabilities = Vec::with_capacity(self.capabilities.len());
        for declaration in &self.capabilities {
            let request = CapabilityRequest::from_declaration(declaration)?;
            if !seen.insert((request.kind, request.scope.clone())) {
                return Err(ManifestError::DuplicateCapability {
                    kind: request.kind,
                    scope: request.scope,
                });
            }
            capabilities.push(request);
        }

        let entry_point = self
            .entry_point
            .clone()
            .filter(|entry| !entry.trim().is_empty())
            .unwrap_or_else(|| self.id.clone());

        let mut listed = HashSet::new();
        let dependencies: Vec<String> = self
            .dependencies
            .iter()
            .filter(|dep| listed.insert(dep.as_str()))
            .cloned()
            .collect();

        Ok(ExtensionManifest {
            id: self.id.clone(),
            name: self.name.trim().to_string(),
            version,
            description: self.description.clone(),
            author: self.author.clone(),
            extension_type: self.extension_type,
            dependencies,
            platforms: self.platforms.iter().map(|p| p.to_ascii_lowercase()).collect(),
            min_core_version,
            entry_point,
            capabilities,
        })
    }
}

fn parse_version(field: &'static str, value: &str) -> Result<Version, ManifestError> {
    value.parse().map_err(|_| ManifestError::InvalidVersion {
        field,
        value: value.to_string(),
    })
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

/// A validated capability request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub kind: CapabilityKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

impl CapabilityRequest {
    pub fn new(kind: CapabilityKind, scope: Option<Scope>) -> Self {
        Self { kind, scope }
    }

    fn from_declaration(declaration: &CapabilityDeclaration) -> Result<Self, ManifestError> {
        let kind: CapabilityKind = declaration
            .kind
            .parse()
            .map_err(|_| ManifestError::UnrecognizedCapability(declaration.kind.clone()))?;

        let scope = match declaration.scope.as_deref() {
            None => None,
            Some(raw) => {
                let scope = Scope::new(raw)
                    .map_err(|source| ManifestError::InvalidScope { kind, source })?;
                kind.validate_scope(&scope)
                    .map_err(|source| ManifestError::InvalidScope { kind, source })?;
                Some(scope)
            }
        };

        Ok(Self { kind, scope })
    }
}

/// A validated extension manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub description: Option<String>,
    pub author: Option<String>,
    pub extension_type: ExtensionType,
    pub dependencies: Vec<String>,
    pub platforms: Vec<String>,
    pub min_core_version: Option<Version>,
    pub entry_point: String,
    pub capabilities: Vec<CapabilityRequest>,
}

impl ExtensionManifest {
    /// Returns true when the extension declares support for `platform`.
    pub fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty()
            || self
                .platforms
                .iter()
                .any(|p| p == PLATFORM_ALL || p.eq_ignore_ascii_case(platform))
    }

    /// Returns true when a host at `host` satisfies `min_core_version`.
    pub fn supports_host(&self, host: &Version) -> bool {
        self.min_core_version
            .as_ref()
            .map_or(true, |minimum| host.satisfies(minimum))
    }
}

/// Manifest file encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestFormat {
    Toml,
    Json,
}

impl ManifestFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            other => Err(ManifestError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

/// Parser for extension manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestParser;

impl ManifestParser {
    /// Create a new manifest parser
    pub fn new() -> Self {
        Self
    }

    /// Read a manifest file without validating it.
    pub fn read_file<P: AsRef<Path>>(&self, path: P) -> Result<ManifestDocument, ManifestError> {
        let path = path.as_ref();
        let format = ManifestFormat::from_path(path)?;

        // Read the file
        let content = fs::read_to_string(path).map_err(|e| ManifestError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        self.read_str(&content, format)
    }

    /// Read a manifest string without validating it.
    pub fn read_str(
        &self,
        content: &str,
        format: ManifestFormat,
    ) -> Result<ManifestDocument, ManifestError> {
        match format {
            ManifestFormat::Toml => {
                toml::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))
            }
            ManifestFormat::Json => {
                serde_json::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))
            }
        }
    }

    /// Parse and validate a manifest file.
    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<ExtensionManifest, ManifestError> {
        self.read_file(path)?.validate()
    }

    /// Parse and validate a manifest string.
    pub fn parse_str(
        &self,
        content: &str,
        format: ManifestFormat,
    ) -> Result<ExtensionManifest, ManifestError> {
        self.read_str(content, format)?.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEATHER: &str = r#"
id = "weather-widget"
name = "Weather Widget"
version = "1.2.0"
type = "ui"
min_core_version = "0.1.0"
platforms = ["linux", "windows"]

[[capabilities]]
kind = "read-settings"
scope = "ui.*"

[[capabilities]]
kind = "network-access"
scope = "api.weather.example"

[[capabilities]]
kind = "register-view"
"#;

    #[test]
    fn test_parse_toml_manifest() {
        let manifest = ManifestParser::new()
            .parse_str(WEATHER, ManifestFormat::Toml)
            .unwrap();

        assert_eq!(manifest.id, "weather-widget");
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert_eq!(manifest.extension_type, ExtensionType::Ui);
        assert_eq!(manifest.entry_point, "weather-widget");
        assert_eq!(manifest.capabilities.len(), 3);
        assert_eq!(manifest.capabilities[0].kind, CapabilityKind::ReadSettings);
        assert_eq!(
            manifest.capabilities[0].scope.as_ref().map(Scope::as_str),
            Some("ui.*")
        );
        assert_eq!(manifest.capabilities[2].scope, None);
        assert!(manifest.supports_platform("linux"));
        assert!(!manifest.supports_platform("macos"));
    }

    #[test]
    fn test_parse_json_manifest() {
        let json = r#"{
            "id": "clock",
            "name": "Clock",
            "version": "0.3.1",
            "dependencies": ["weather-widget"],
            "capabilities": [{ "kind": "event", "scope": "time.*" }]
        }"#;
        let manifest = ManifestParser::new()
            .parse_str(json, ManifestFormat::Json)
            .unwrap();

        assert_eq!(manifest.extension_type, ExtensionType::Service);
        assert_eq!(manifest.dependencies, vec!["weather-widget".to_string()]);
        assert!(manifest.supports_platform("anything"));
    }

    #[test]
    fn test_unrecognized_capability_rejects_manifest() {
        let mut document = ManifestParser::new()
            .read_str(WEATHER, ManifestFormat::Toml)
            .unwrap();
        document
            .capabilities
            .push(CapabilityDeclaration::new("teleport", None));

        assert_eq!(
            document.validate().unwrap_err(),
            ManifestError::UnrecognizedCapability("teleport".to_string())
        );
    }

    #[test]
    fn test_validation_errors() {
        let base = ManifestParser::new()
            .read_str(WEATHER, ManifestFormat::Toml)
            .unwrap();

        let mut doc = base.clone();
        doc.id = "Weather Widget".to_string();
        assert!(matches!(doc.validate(), Err(ManifestError::InvalidId(_))));

        let mut doc = base.clone();
        doc.version = "1.2".to_string();
        assert!(matches!(
            doc.validate(),
            Err(ManifestError::InvalidVersion { field: "version", .. })
        ));

        let mut doc = base.clone();
        doc.dependencies.push("weather-widget".to_string());
        assert!(matches!(doc.validate(), Err(ManifestError::SelfDependency(_))));

        let mut doc = base.clone();
        doc.capabilities
            .push(CapabilityDeclaration::new("read-settings", Some("ui.*")));
        assert!(matches!(
            doc.validate(),
            Err(ManifestError::DuplicateCapability { .. })
        ));

        let mut doc = base;
        doc.capabilities
            .push(CapabilityDeclaration::new("network-access", Some("*")));
        assert!(matches!(doc.validate(), Err(ManifestError::InvalidScope { .. })));
    }

    #[test]
    fn test_repeated_dependencies_are_listed_once() {
        let mut doc = ManifestParser::new()
            .read_str(WEATHER, ManifestFormat::Toml)
            .unwrap();
        doc.dependencies = ["clock", "settings-sync", "clock", "settings-sync"]
            .map(String::from)
            .to_vec();

        let manifest = doc.validate().unwrap();
        assert_eq!(manifest.dependencies, vec!["clock", "settings-sync"]);
    }

    #[test]
    fn test_host_version_gate() {
        let manifest = ManifestParser::new()
            .parse_str(WEATHER, ManifestFormat::Toml)
            .unwrap();
        assert!(manifest.supports_host(&Version::new(0, 1, 4)));
        assert!(!manifest.supports_host(&Version::new(0, 0, 9)));
        assert!(!manifest.supports_host(&Version::new(1, 0, 0)));
    }

    #[test]
    fn test_parse_file_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_TOML);
        std::fs::write(&path, WEATHER).unwrap();

        let manifest = ManifestParser::new().parse_file(&path).unwrap();
        assert_eq!(manifest.name, "Weather Widget");

        let bad = dir.path().join("manifest.yaml");
        std::fs::write(&bad, "id: x").unwrap();
        assert!(matches!(
            ManifestParser::new().parse_file(&bad),
            Err(ManifestError::UnsupportedFormat(_))
        ));
    }
}
