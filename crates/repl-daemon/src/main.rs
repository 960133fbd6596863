mod config;
mod server;
mod telemetry;

use clap::Parser;
use config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;
    let cli = Cli::parse();
    server::run(cli.listen_addr()).await
}
