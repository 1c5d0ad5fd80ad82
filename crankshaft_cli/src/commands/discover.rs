//! Command to list the manifests in an extensions directory.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crankshaft_host::ExtensionDiscovery;

/// Execute the discover command
pub fn execute(dir: &Path) -> Result<()> {
    let candidates = ExtensionDiscovery::new(dir).discover()?;

    if candidates.is_empty() {
        println!("{}", format!("No manifests under {}.", dir.display()).yellow());
        return Ok(());
    }

    println!("{} manifest(s) under {}:", candidates.len().to_string().cyan(), dir.display());
    for candidate in &candidates {
        let origin = candidate
            .origin
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        match candidate.document.as_ref().map_err(|e| e.clone()).and_then(|d| d.validate()) {
            Ok(manifest) => println!(
                "  {} {} {}  {}",
                "ok     ".green(),
                manifest.id.cyan(),
                manifest.version,
                origin
            ),
            Err(err) => println!("  {} {}  {}", "invalid".red(), origin, err),
        }
    }
    Ok(())
}
