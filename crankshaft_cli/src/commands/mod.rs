//! Subcommand implementations.

pub mod audit;
pub mod discover;
pub mod init_config;
pub mod load;
pub mod validate;

use colored::Colorize;

use crankshaft_capability::AuditRecord;
use crankshaft_core::error::display_scope;
use crankshaft_host::{LoadReport, LoadState};

/// Format a load state for display with color
pub fn format_state(state: LoadState) -> String {
    match state {
        LoadState::Instantiated => state.to_string().green().to_string(),
        LoadState::Failed => state.to_string().red().to_string(),
        _ => state.to_string().yellow().to_string(),
    }
}

pub fn print_report(report: &LoadReport) {
    match (report.identity(), report.error()) {
        (Some(identity), _) => println!(
            "  {} {}  {}",
            format!("{:<24}", report.extension).cyan(),
            format_state(report.state),
            identity
        ),
        (None, Some(err)) => println!(
            "  {} {}  {}",
            format!("{:<24}", report.extension).cyan(),
            format_state(report.state),
            err
        ),
        (None, None) => println!("  {} {}", format!("{:<24}", report.extension).cyan(), format_state(report.state)),
    }
}

pub fn print_record(record: &AuditRecord) {
    let outcome = if record.outcome.is_allowed() {
        record.outcome.as_str().green()
    } else {
        record.outcome.as_str().red()
    };
    println!(
        "  #{:<5} {}  {}  {:<16} {:<28} {:<10} {}",
        record.sequence,
        record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.owner,
        record.kind.as_str(),
        display_scope(&record.scope),
        record.operation,
        outcome
    );
}
