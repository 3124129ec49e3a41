use anyhow::Result;
use clap::Parser;
use firmflow::Cli;

fn main() -> Result<()> {
    Cli::parse().run()
}
