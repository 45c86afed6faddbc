use crate::config::validator::has_fatal;
use crate::geoip::GeoipPlugin;
use crate::notifier::ChangeNotifier;
use crate::server::{self, ShutdownCoordinator};
use crate::waf::{ScanEngine, SignaturePlugin};
use crate::Config;
use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Args)]
pub struct ServeArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "fe-waf.toml")]
    pub config: PathBuf,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let config = Config::from_file(&args.config)?;

    crate::logging::init_logging(&config.logging)?;

    info!("Starting fe-waf v{}", crate::VERSION);
    info!("Loading configuration from: {}", args.config.display());

    let warnings = config.validate();
    for warning in &warnings {
        warn!("{}", warning);
    }
    if has_fatal(&warnings) {
        bail!("Configuration has fatal errors");
    }

    crate::metrics::init_metrics();

    let (notifier, waf_config) = super::open_shared_state(&config.store).await?;

    let mut engine = ScanEngine::new(waf_config, &config.waf.output, &config.waf.output_format)
        .context("Failed to set up WAF audit output")?;
    register_plugins(&mut engine, &config, &notifier).await;
    let engine = Arc::new(engine);

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let watcher = tokio::spawn(notifier.clone().watch(coordinator.subscribe()));

    let signals = coordinator.clone();
    tokio::spawn(async move { server::shutdown::wait_for_signal(&signals).await });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let served = server::serve(listener, engine, coordinator.subscribe()).await;

    // make sure the watcher stops even if the server failed on its own
    coordinator.shutdown();
    if let Err(e) = watcher.await {
        error!("Change log watcher task failed: {}", e);
    }

    served
}

/// `geoip` first when it could be set up, then `axsi`.
pub async fn register_plugins(engine: &mut ScanEngine, config: &Config, notifier: &Arc<ChangeNotifier>) {
    if config.geoip.enable {
        match GeoipPlugin::new(notifier.clone(), &config.geoip_source()).await {
            Ok(plugin) => engine.register_plugin(plugin),
            Err(e) => error!("GeoIP plugin disabled: {}", e),
        }
    }
    engine.register_plugin(Arc::new(SignaturePlugin::new()));
}
