use crate::config::StoreBackend;
use crate::geoip::{self, CountryTable};
use crate::notifier::ChangeNotifier;
use crate::store::RecordStore;
use crate::waf::{ConfigStore, RequestDescriptor, ScanEngine};
use crate::Config;
use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;

/// Administrative commands. They write to the configured record store, and
/// running instances converge through the change log.
#[derive(Args)]
pub struct WafArgs {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "fe-waf.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: WafCommand,
}

#[derive(Subcommand)]
pub enum WafCommand {
    /// Set the global mode: enabled, dryrun or disabled
    Mode { mode: String },

    /// Replace the allow list (comma separated CIDRs, empty to clear)
    Allowlist { networks: String },

    /// Replace the deny list (comma separated CIDRs, empty to clear)
    Denylist { networks: String },

    /// Toggle a scan plugin
    #[command(group(ArgGroup::new("state").required(true).args(["enable", "disable"])))]
    Plugin {
        name: String,

        #[arg(long)]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Replace the GeoIP country table (comma separated ISO codes)
    Countries {
        codes: String,

        /// Deny the listed countries instead of allowing only them
        #[arg(long)]
        deny: bool,
    },

    /// Print the stored WAF policy
    Show,

    /// Run one request through the scan pipeline
    Test {
        #[arg(long)]
        remote_addr: String,

        #[arg(long)]
        url: String,

        #[arg(long, default_value = "GET")]
        method: String,
    },
}

struct Admin {
    notifier: Arc<ChangeNotifier>,
    waf: Arc<ConfigStore>,
}

impl Admin {
    async fn open(config: &Config) -> Result<Self> {
        let (notifier, waf) = super::open_shared_state(&config.store).await?;
        Ok(Self { notifier, waf })
    }
}

impl WafCommand {
    /// Whether the command writes to the record store.
    fn is_mutating(&self) -> bool {
        !matches!(self, WafCommand::Show | WafCommand::Test { .. })
    }
}

pub async fn run(args: WafArgs) -> Result<()> {
    let config = Config::from_file(&args.config)?;
    if args.command.is_mutating() && config.store.backend() == Some(StoreBackend::Memory) {
        bail!(
            "The memory store only lives as long as this command, so the change would be lost. \
             Set [store] backend = \"redis\" in {} to share changes with running instances",
            args.config.display()
        );
    }
    let admin = Admin::open(&config).await?;

    match args.command {
        WafCommand::Mode { mode } => {
            admin.waf.set_mode(&mode)?;
            println!("[OK] WAF mode set to {}", mode);
        }

        WafCommand::Allowlist { networks } => {
            admin.waf.set_allow_list(&networks)?;
            println!("[OK] Allow list updated");
        }

        WafCommand::Denylist { networks } => {
            admin.waf.set_deny_list(&networks)?;
            println!("[OK] Deny list updated");
        }

        WafCommand::Plugin { name, enable, disable } => {
            let enabled = enable && !disable;
            admin.waf.enable_plugin(&name, enabled)?;
            println!(
                "[OK] Plugin {} {}",
                name,
                if enabled { "enabled" } else { "disabled" }
            );
        }

        WafCommand::Countries { codes, deny } => {
            let codes: Vec<String> = codes
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            geoip::set_countries(&admin.notifier, &codes, !deny)?;
            println!(
                "[OK] {} countries {}",
                codes.len(),
                if deny { "denied" } else { "allowed" }
            );
        }

        WafCommand::Show => show(&admin)?,

        WafCommand::Test { remote_addr, url, method } => {
            let url = Url::parse(&url).with_context(|| format!("Invalid URL: {}", url))?;
            let request = RequestDescriptor::new(remote_addr, url, method);

            let mut engine =
                ScanEngine::new(admin.waf.clone(), &config.waf.output, &config.waf.output_format)?;
            super::serve::register_plugins(&mut engine, &config, &admin.notifier).await;

            let result = engine.scan(&request);
            println!("Plugins: {}", engine.plugin_names().join(", "));
            println!("Result: {}", result.as_str());
        }
    }

    Ok(())
}

fn show(admin: &Admin) -> Result<()> {
    let policy = admin.waf.snapshot();
    let join = |list: &[ipnetwork::IpNetwork]| {
        list.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", ")
    };

    println!("=== WAF Policy ===");
    println!();
    println!("Mode: {}", policy.mode);
    println!("Allow list: {}", join(&policy.allow_list));
    println!("Deny list: {}", join(&policy.deny_list));

    let mut plugins: Vec<_> = policy.enabled_plugins.iter().collect();
    plugins.sort();
    println!("Plugins:");
    for (name, enabled) in plugins {
        println!("  {}: {}", name, if *enabled { "enabled" } else { "disabled" });
    }

    let rules = admin.notifier.store().geoip_country_rules()?;
    let table = CountryTable::from_rules(&rules);
    let mut countries: Vec<_> = table.countries.keys().cloned().collect();
    countries.sort();
    println!(
        "GeoIP countries ({}): {}",
        if table.allow_mode { "allow" } else { "deny" },
        countries.join(", ")
    );
    Ok(())
}
