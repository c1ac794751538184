//! campus-sync - client-side data sync and session lifecycle engine

use clap::Parser;

mod cache;
mod cli;
mod client;
mod clock;
mod config;
mod error;
mod session;
mod sync;

use cli::{Cli, Commands, GlobalOptions};
use error::Result;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(err) = run(cli).await {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise warnings only, or debug with `--debug`
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
    log::debug!("Debug logging enabled");
}

async fn run(cli: Cli) -> Result<()> {
    let opts = GlobalOptions::from_cli(&cli);

    match cli.command {
        Commands::Init { force } => cli::init::run(&opts, force),
        Commands::Status => cli::status::run(&opts),
        Commands::Simulate(args) => cli::simulate::run(&opts, &args).await,
        Commands::Version => {
            println!("campus-sync version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
