use crate::config::parser::save_config;
use crate::config::validator::has_fatal;
use crate::Config;
use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Check a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write a configuration file with every default filled in
    Generate {
        #[arg(short, long, default_value = "fe-waf.toml")]
        output: PathBuf,
    },
}

pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => {
            println!("Checking configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;
            let warnings = cfg.validate();

            if warnings.is_empty() {
                println!("[OK] Configuration is valid!");
                return Ok(());
            }

            println!("Configuration loaded with warnings:\n");
            for warning in &warnings {
                println!("{}", warning);
            }
            if has_fatal(&warnings) {
                bail!("Configuration has fatal errors");
            }
            Ok(())
        }

        ConfigCommand::Generate { output } => {
            save_config(&Config::default(), &output)?;
            println!("[OK] Default configuration written to {}", output.display());
            Ok(())
        }
    }
}
