//! umt-agent: run a marketing-team agent or talk to running ones.

use clap::Parser;
use std::process::ExitCode;

use umt_agents::cli::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
