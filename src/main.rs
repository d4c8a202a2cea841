// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::info;
use update_engine::config::is_truthy;
use update_engine::{BarProgress, EngineConfig, LogProgress, UpdateEngine};

#[derive(Parser, Debug)]
#[command(name = "update-engine")]
#[command(author, version, about = "A/B slot over-the-air update engine", long_about = None)]
struct Cli {
    /// Bundle URL, local bundle path, or `auto` for the automatic update URL
    #[arg(env = "UPDATE_ENGINE_URL", default_value = "auto")]
    url: String,

    /// Verbose logging and a terminal progress bar
    #[arg(short, long)]
    verbose: bool,

    /// Same as --verbose when truthy (True, true, on, 1)
    #[arg(long, env = "UPDATE_ENGINE_DEBUG", value_name = "BOOL", hide = true)]
    debug: Option<String>,

    /// Configuration file
    #[arg(short, long, env = "UPDATE_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL for automatic updates
    #[arg(long, env = "UPDATE_ENGINE_BASE_URL")]
    base_url: Option<String>,

    /// Base URL for automatic updates on development devices
    #[arg(long, env = "UPDATE_ENGINE_ANKIDEV_BASE_URL")]
    ankidev_base_url: Option<String>,

    /// Bundle flavor in the automatic update URL (default: diff)
    #[arg(long, env = "UPDATE_ENGINE_OTA_TYPE")]
    ota_type: Option<String>,

    /// Insert a per-device shard into the automatic update URL
    #[arg(long, env = "UPDATE_ENGINE_USE_SHARDING", value_name = "BOOL")]
    use_sharding: Option<String>,

    /// Fixed shard instead of one derived from the serial number
    #[arg(long, env = "UPDATE_ENGINE_SHARD")]
    shard: Option<String>,

    /// Permit downgrades on development devices when version policy is on
    #[arg(long, env = "UPDATE_ENGINE_ALLOW_DOWNGRADE", value_name = "BOOL")]
    allow_downgrade: Option<String>,
}

impl Cli {
    fn is_verbose(&self) -> bool {
        self.verbose || self.debug.as_deref().is_some_and(is_truthy)
    }

    /// Configuration file (or defaults) with command-line overrides applied
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };

        if let Some(url) = &self.base_url {
            config.auto.base_url = Some(url.clone());
        }
        if let Some(url) = &self.ankidev_base_url {
            config.auto.dev_base_url = Some(url.clone());
        }
        if let Some(ota_type) = &self.ota_type {
            config.auto.ota_type = ota_type.clone();
        }
        if let Some(value) = &self.use_sharding {
            config.auto.use_sharding = is_truthy(value);
        }
        if let Some(shard) = &self.shard {
            config.auto.shard = Some(shard.clone());
        }
        if let Some(value) = &self.allow_downgrade {
            config.policy.allow_downgrade = is_truthy(value);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.is_verbose();

    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.engine_config()?;
    let mut engine = UpdateEngine::new(config).context("Failed to initialize update engine")?;
    if verbose {
        engine = if std::io::stderr().is_terminal() {
            engine.with_progress(Box::new(BarProgress::new()))
        } else {
            engine.with_progress(Box::new(LogProgress::new("update")))
        };
    }

    info!("Installing from {}", cli.url);
    let code = engine.run(&cli.url);
    std::process::exit(code);
}
