//! Manifest discovery on disk.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crankshaft_core::error::{LoadError, ManifestError};
use crankshaft_core::manifest::{ManifestDocument, ManifestParser, MANIFEST_JSON, MANIFEST_TOML};

/// An extension offered to the loader, not yet validated.
#[derive(Clone, Debug)]
pub struct ExtensionCandidate {
    /// Name used in reports: the manifest id when readable, else the path.
    pub label: String,

    /// Manifest file the candidate came from, if any.
    pub origin: Option<PathBuf>,

    /// The parsed manifest, or why it could not be read.
    pub document: Result<ManifestDocument, ManifestError>,
}

impl ExtensionCandidate {
    /// A candidate from an in-memory manifest.
    pub fn from_document(document: ManifestDocument) -> Self {
        Self {
            label: document.id.clone(),
            origin: None,
            document: Ok(document),
        }
    }

    /// A candidate read from a manifest file. Read and parse errors are kept
    /// so that the load attempt reports them.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let document = ManifestParser::new().read_file(path);
        let label = match &document {
            Ok(document) if !document.id.is_empty() => document.id.clone(),
            _ => path.display().to_string(),
        };
        Self {
            label,
            origin: Some(path.to_path_buf()),
            document,
        }
    }
}

/// Finds extension manifests below a directory.
#[derive(Debug, Clone)]
pub struct ExtensionDiscovery {
    root: PathBuf,
}

impl ExtensionDiscovery {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        debug!("Creating ExtensionDiscovery with root: {:?}", root);
        Self { root }
    }

    /// Locate manifest files.
    ///
    /// Each immediate subdirectory contributes its `manifest.toml`, or its
    /// `manifest.json` when there is no TOML file. Manifest files placed
    /// directly in the root are picked up too. Results are sorted by path.
    pub fn manifest_paths(&self) -> Result<Vec<PathBuf>, LoadError> {
        if !self.root.is_dir() {
            return Err(LoadError::Discovery(format!(
                "Extension directory does not exist: {}",
                self.root.display()
            )));
        }

        let entries = fs::read_dir(&self.root).map_err(|e| {
            LoadError::Discovery(format!("Failed to read extension directory: {}", e))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                LoadError::Discovery(format!("Failed to read directory entry: {}", e))
            })?;
            let path = entry.path();

            if path.is_dir() {
                let toml = path.join(MANIFEST_TOML);
                let json = path.join(MANIFEST_JSON);
                if toml.is_file() {
                    paths.push(toml);
                } else if json.is_file() {
                    paths.push(json);
                } else {
                    debug!("No manifest in {:?}", path);
                }
            } else if path
                .file_name()
                .is_some_and(|name| name == MANIFEST_TOML || name == MANIFEST_JSON)
            {
                paths.push(path);
            }
        }

        paths.sort();
        debug!("Discovered {} manifests under {:?}", paths.len(), self.root);
        Ok(paths)
    }

    /// Locate and read every manifest.
    pub fn discover(&self) -> Result<Vec<ExtensionCandidate>, LoadError> {
        Ok(self
            .manifest_paths()?
            .into_iter()
            .map(ExtensionCandidate::from_file)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_discover_extensions() {
        let temp_dir = tempdir().unwrap();

        let weather = temp_dir.path().join("weather");
        fs::create_dir(&weather).unwrap();
        fs::write(
            weather.join(MANIFEST_TOML),
            "id = \"weather-widget\"\nname = \"Weather\"\nversion = \"1.0.0\"\n",
        )
        .unwrap();

        let clock = temp_dir.path().join("clock");
        fs::create_dir(&clock).unwrap();
        fs::write(
            clock.join(MANIFEST_JSON),
            r#"{"id": "clock", "name": "Clock", "version": "0.1.0"}"#,
        )
        .unwrap();

        let broken = temp_dir.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(MANIFEST_TOML), "id = ").unwrap();

        fs::create_dir(temp_dir.path().join("empty")).unwrap();

        let candidates = ExtensionDiscovery::new(temp_dir.path()).discover().unwrap();
        assert_eq!(candidates.len(), 3);

        let labels: Vec<_> = candidates.iter().map(|c| c.label.as_str()).collect();
        assert!(labels.contains(&"weather-widget"));
        assert!(labels.contains(&"clock"));

        let broken = candidates
            .iter()
            .find(|c| c.document.is_err())
            .unwrap();
        assert!(broken.label.ends_with(MANIFEST_TOML));
    }

    #[test]
    fn test_missing_directory() {
        let temp_dir = tempdir().unwrap();
        let discovery = ExtensionDiscovery::new(temp_dir.path().join("nope"));
        assert!(matches!(discovery.discover(), Err(LoadError::Discovery(_))));
    }
}
