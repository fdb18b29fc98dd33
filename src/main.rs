mod pipeline;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{ExponentArgs, RunArgs, SearchArgs};

/// logcosh-vae: train a log-cosh VAE for one hyperparameter vector and print its score.
#[derive(Parser)]
#[command(
    name = "logcosh-vae",
    version,
    about,
    allow_negative_numbers = true,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    hyperparameters: ExponentArgs,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Bayesian optimisation over the hyperparameter exponents.
    Search(SearchArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Search(args)) => pipeline::run_search(args),
        None => pipeline::run_train(cli.hyperparameters, cli.run),
    }
}
