//! `firmflow plugins`: list the analysis plugins with config overrides applied

use crate::cli::{Output, OutputFormat};
use crate::config::FirmflowConfig;
use crate::plugins::{PluginMetadata, PluginRegistry};
use anyhow::Result;
use serde::Serialize;

#[derive(Serialize)]
struct PluginRow<'a> {
    #[serde(flatten)]
    metadata: &'a PluginMetadata,
    timeout_ms: u128,
    workers: usize,
    default: bool,
}

pub fn execute(config: &FirmflowConfig, format: OutputFormat, output: &Output) -> Result<()> {
    let registry = PluginRegistry::builtin().configure(&config.analysis)?;
    let selected = registry.with_dependencies(&config.analysis.default_plugins);

    let rows: Vec<PluginRow> = registry
        .iter()
        .map(|plugin| PluginRow {
            metadata: plugin.metadata(),
            timeout_ms: plugin.timeout().as_millis(),
            workers: plugin.process_count(),
            default: selected.contains(plugin.name()),
        })
        .collect();

    if format == OutputFormat::Json {
        return output.json(&rows);
    }

    output.header("Analysis plugins");
    for row in &rows {
        let meta = row.metadata;
        output.section_header(&format!("{} {}", meta.name, meta.version));
        output.table_row("Description", meta.description);
        if !meta.dependencies.is_empty() {
            output.table_row("Depends on", &meta.dependencies.join(", "));
        }
        if !meta.mime_whitelist.is_empty() {
            output.table_row("Only", &meta.mime_whitelist.join(", "));
        }
        if !meta.mime_blacklist.is_empty() {
            output.table_row("Skips", &meta.mime_blacklist.join(", "));
        }
        output.table_row("Timeout", &format!("{}ms", row.timeout_ms));
        output.table_row("Workers", &row.workers.to_string());
        output.table_row("Runs by default", &row.default.to_string());
    }
    output.blank_line();
    output.count("🔌", "Plugins", rows.len());
    Ok(())
}
