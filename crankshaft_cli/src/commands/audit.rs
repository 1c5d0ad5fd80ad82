//! Command to query a persisted audit log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use colored::Colorize;

use crankshaft_capability::audit::{AuditLog, AuditOutcome, AuditQuery, JsonlAuditStore};
use crankshaft_core::capability::CapabilityKind;
use crankshaft_core::id::ExtensionId;
use crankshaft_host::HostConfig;

use super::print_record;

/// Filters taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub extension: Option<String>,
    pub outcome: Option<String>,
    pub kind: Option<String>,
    pub limit: usize,
}

impl AuditFilter {
    pub fn to_query(&self) -> Result<AuditQuery> {
        let mut query = AuditQuery::new().limit(self.limit);
        if let Some(extension) = &self.extension {
            let owner: ExtensionId = extension
                .parse()
                .with_context(|| format!("invalid extension identity: {extension}"))?;
            query = query.owner(owner);
        }
        if let Some(outcome) = &self.outcome {
            let outcome: AuditOutcome = outcome.parse().map_err(|e: String| anyhow!(e))?;
            query = query.outcome(outcome);
        }
        if let Some(kind) = &self.kind {
            let kind: CapabilityKind = kind.parse()?;
            query = query.kind(kind);
        }
        Ok(query)
    }
}

/// Execute the audit command
pub fn execute(config: &HostConfig, log: Option<PathBuf>, filter: &AuditFilter) -> Result<()> {
    let path = log
        .or_else(|| config.audit_log_path.clone())
        .ok_or_else(|| anyhow!("no audit log given and none configured"))?;
    if !path.exists() {
        return Err(anyhow!("audit log {} does not exist", path.display()));
    }

    let audit = AuditLog::open(Arc::new(JsonlAuditStore::new(&path)), config.audit_buffer_capacity)?
        .with_memory_window(config.audit_memory_window);
    let records = audit.query(&filter.to_query()?);

    if records.is_empty() {
        println!("{}", "No matching audit records.".yellow());
        return Ok(());
    }
    println!(
        "{} of {} record(s), newest first:",
        records.len().to_string().cyan(),
        audit.len()
    );
    for record in &records {
        print_record(record);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_builds_query() {
        let owner = ExtensionId::new();
        let filter = AuditFilter {
            extension: Some(owner.to_string()),
            outcome: Some("denied-revoked".to_string()),
            kind: Some("network-access".to_string()),
            limit: 5,
        };
        let query = filter.to_query().unwrap();
        assert_eq!(
            query,
            AuditQuery::new()
                .limit(5)
                .owner(owner)
                .outcome(AuditOutcome::DeniedRevoked)
                .kind(CapabilityKind::NetworkAccess)
        );
    }

    #[test]
    fn test_filter_rejects_bad_values() {
        let filter = AuditFilter {
            outcome: Some("maybe".to_string()),
            limit: 1,
            ..AuditFilter::default()
        };
        assert!(filter.to_query().is_err());

        let filter = AuditFilter {
            extension: Some("not-a-uuid".to_string()),
            limit: 1,
            ..AuditFilter::default()
        };
        assert!(filter.to_query().is_err());
    }
}
