//! Configuration command implementations

use crate::cli::{Output, OutputFormat};
use crate::config::FirmflowConfig;
use crate::error::ConfigError;
use anyhow::{Result, bail};

/// Print the merged configuration
pub fn show(config: &FirmflowConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => print!("{}", config.to_toml()?),
    }
    Ok(())
}

/// Report whether the merged configuration loads and validates
pub fn validate(
    loaded: Result<FirmflowConfig, ConfigError>,
    source: Option<&str>,
    format: OutputFormat,
    output: &Output,
) -> Result<()> {
    let source = source.unwrap_or("defaults");
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            if format == OutputFormat::Json {
                output.json(&serde_json::json!({ "valid": false, "source": source, "error": e.to_string() }))?;
            } else {
                output.error(&format!("Configuration is invalid: {e}"));
            }
            bail!("invalid configuration in {source}");
        }
    };

    if format == OutputFormat::Json {
        return output.json(&serde_json::json!({ "valid": true, "source": source }));
    }

    output.success("Configuration is valid");
    output.table_row("Source", source);
    output.table_row("Unpack workers", &config.unpack_threads().to_string());
    output.table_row("Max depth", &config.unpack.max_depth.to_string());
    output.table_row("Unpack throttle", &config.unpack.throttle_limit.to_string());
    output.table_row("Analysis throttle", &config.analysis.throttle_limit.to_string());
    output.table_row("Crash policy", &format!("{:?}", config.scheduler.crash_policy));
    output.table_row("Data directory", &config.data_dir().display().to_string());
    Ok(())
}
