//! Command to write a configuration file.

use std::path::Path;

use anyhow::Result;

use crankshaft_host::{save_config, HostConfig};

/// Execute the init-config command
pub fn execute(config: &HostConfig, path: &Path) -> Result<()> {
    save_config(config, path)?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}
