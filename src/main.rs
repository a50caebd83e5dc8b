//! fixloop CLI entry point.

use clap::Parser;

use fixloop::cli::{commands, handle_error, Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fix(args) => commands::fix::execute(args, cli.json).await,
        Commands::Init(args) => commands::init::execute(args, cli.json).await.map(|()| 0),
        Commands::Version => {
            commands::version::execute(cli.json);
            Ok(0)
        }
        Commands::Memory(args) => commands::memory::execute(args, cli.json).await.map(|()| 0),
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            handle_error(&err, cli.json);
            1
        }
    };
    std::process::exit(code);
}
