//! Command to load a directory of extensions into the demo host.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crankshaft_host::{ExtensionHostManager, HostConfig};

use super::print_report;
use crate::demo;

/// Execute the load command
pub async fn execute(config: &HostConfig, dir: &Path, json: bool) -> Result<()> {
    let host = ExtensionHostManager::from_config(config, demo::catalog())?;
    demo::seed(&host);

    let reports = host.load_from_directory(dir).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        let loaded = reports.iter().filter(|r| r.is_loaded()).count();
        println!(
            "Loaded {} of {} extension(s):",
            loaded.to_string().cyan(),
            reports.len()
        );
        for report in &reports {
            print_report(report);
        }
        if loaded < reports.len() {
            println!("{}", "Some extensions failed to load.".yellow());
        }
    }

    host.shutdown().await?;
    Ok(())
}
