use clap::Parser as _;
use oamcp_bridge::commands;
use oamcp_bridge::config::{Cli, Command};
use oamcp_bridge::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_level, cli.config.log_format);
    cli.config.validate()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => commands::serve(&cli.config).await,
        Command::List => commands::list(&cli.config).await,
        Command::Export { output } => commands::export(&cli.config, &output).await,
    }
}
