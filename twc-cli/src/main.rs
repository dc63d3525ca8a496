//! Torrent web cache - Command-line interface
//!
//! Runs the HTTP cache in front of an object store and a torrent origin.

mod commands;

use clap::Parser;

#[derive(Parser)]
#[command(name = "torrent-web-cache")]
#[command(about = "HTTP read-through cache for torrent content")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::handle_command(cli.command).await
}
