use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = temporal_history_cli::Cli::parse();
    temporal_history_cli::run_cli(cli)
}
