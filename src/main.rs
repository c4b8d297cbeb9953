use clap::Parser;
use std::process::ExitCode;
use storyloom::cli::{Cli, Commands};
use storyloom::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    storyloom::cli::init_tracing(cli.verbose, &config);

    match cli.command {
        Commands::Simulate(args) => storyloom::cli::simulate(args, config).await,
        Commands::Config(args) => match storyloom::cli::config_command(&args) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}
