use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tree_transpile::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    let config = cli.load_config()?;
    tree_transpile::run(&config, &cli.inputs, cli.json)
}
