//! Command to validate a manifest file.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use crankshaft_core::error::display_scope;
use crankshaft_core::manifest::ManifestParser;
use crankshaft_core::version::host_version;

/// Execute the validate command
pub fn execute(path: &Path) -> Result<()> {
    let manifest = ManifestParser::new()
        .parse_file(path)
        .with_context(|| format!("{} is not a valid manifest", path.display()))?;

    println!("{} {} {}", "Valid:".green(), manifest.id.cyan(), manifest.version);
    println!("  name:        {}", manifest.name);
    println!("  type:        {}", manifest.extension_type);
    println!("  entry point: {}", manifest.entry_point);
    if !manifest.dependencies.is_empty() {
        println!("  depends on:  {}", manifest.dependencies.join(", "));
    }

    let host = host_version();
    if !manifest.supports_host(&host) {
        println!("  {} requires host {:?}, this is {}", "warning:".yellow(), manifest.min_core_version, host);
    }

    println!("  capabilities:");
    if manifest.capabilities.is_empty() {
        println!("    (none)");
    }
    for request in &manifest.capabilities {
        println!("    {:<16} {}", request.kind.as_str(), display_scope(&request.scope));
    }
    Ok(())
}
