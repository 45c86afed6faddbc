use anyhow::Result;
use clap::{Parser, Subcommand};
use fe_waf::cli;

#[derive(Parser)]
#[command(name = "fe-waf")]
#[command(version = fe_waf::VERSION)]
#[command(about = "Web application firewall scan service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scan service
    Serve(cli::serve::ServeArgs),

    /// Configuration management
    Config(cli::config::ConfigArgs),

    /// WAF policy administration
    Waf(cli::waf::WafArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => cli::serve::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Waf(args) => cli::waf::run(args).await,
    }
}
