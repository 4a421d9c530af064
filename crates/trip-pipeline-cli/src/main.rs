use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = trip_pipeline_cli::Cli::parse();
    trip_pipeline_cli::run_cli(cli)
}
