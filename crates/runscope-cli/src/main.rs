use anyhow::Result;
use clap::Parser;

mod args;
mod run;
mod server;

use args::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => server::start_server(&args).await,
        Command::Run(args) => {
            let code = run::run_program(args).await?;
            std::process::exit(code);
        }
    }
}
