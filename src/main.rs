//! patchgrade CLI entry point.

use clap::Parser;

use patchgrade::cli::commands::{report, run};
use patchgrade::cli::{handle_error, Cli, Commands};
use patchgrade::infrastructure::config::ConfigLoader;
use patchgrade::infrastructure::logging::LoggerImpl;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigLoader::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => std::process::exit(handle_error(&err.into(), cli.json)),
    };

    let logger = match LoggerImpl::init(&config.logging) {
        Ok(logger) => Some(logger),
        Err(err) => {
            eprintln!("warning: logging disabled: {err:#}");
            None
        }
    };

    let result = match cli.command {
        Commands::Run(args) => run::execute(args, config, cli.json).await,
        Commands::Report(args) => report::execute(args, config, cli.json).await,
    };

    if let Err(err) = result {
        let code = handle_error(&err, cli.json);
        // Flush file logs before exiting.
        drop(logger);
        std::process::exit(code);
    }
}
