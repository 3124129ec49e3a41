//! Command-line interface for firmflow
//!
//! Parses arguments with clap, loads the layered configuration and hands off
//! to one of the command modules.

use crate::config::FirmflowConfig;
use anyhow::Result;
use clap::{ArgAction, CommandFactory, Parser, Subcommand, ValueEnum};

mod commands;
mod output;

pub use commands::unpack::UnpackArgs;
pub use output::Output;

/// firmflow - recursive firmware unpacking and analysis
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<String>,

    /// Enable verbose output (-v shows debug logs)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Enable quiet output (minimal)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Unpack a firmware image recursively and analyze every extracted file
    Unpack(UnpackArgs),
    /// List available analysis plugins
    Plugins,
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the merged configuration
    Show,
    /// Validate the merged configuration
    Validate,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let output = Output::new(self.verbose > 0, self.quiet);

        let Some(command) = self.command else {
            Cli::command().print_help()?;
            return Ok(());
        };

        let loaded = FirmflowConfig::load_with_custom_config(self.config.as_deref());
        let level = loaded.as_ref().map_or("info", |config| config.logging.level.as_str());
        setup_logging(self.verbose, self.quiet, level);

        match command {
            Commands::Unpack(args) => commands::unpack::execute(args, loaded?, self.format, &output),
            Commands::Plugins => commands::plugins::execute(&loaded?, self.format, &output),
            Commands::Config(ConfigCommands::Show) => commands::config::show(&loaded?, self.format),
            Commands::Config(ConfigCommands::Validate) => {
                commands::config::validate(loaded, self.config.as_deref(), self.format, &output)
            }
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match (quiet, verbose) {
            (true, _) => tracing_subscriber::EnvFilter::new("error"),
            (false, 0) => tracing_subscriber::EnvFilter::new(level),
            (false, 1) => tracing_subscriber::EnvFilter::new("debug,globset=warn"),
            _ => tracing_subscriber::EnvFilter::new("trace"),
        }
    });

    // a subscriber may already be installed when running inside tests
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
