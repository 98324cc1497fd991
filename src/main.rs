mod cli;
mod config;
mod engine;
mod model;
mod orchestrator;
mod pipeline;
mod registry;
mod source;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_headless = args.is_headless();

    match cli::run(args).await {
        Ok(()) => {
            // Background subscription and signal tasks must not keep a headless run alive.
            if is_headless {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if is_headless {
                eprintln!("error: {e:#}");
                std::process::exit(1);
            }
            Err(e)
        }
    }
}
