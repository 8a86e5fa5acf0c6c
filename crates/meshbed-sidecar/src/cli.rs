//! Command-line interface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use meshbed_common::paths::SIDECAR_CONFIG;
use meshbed_network::{CniInvoker, ExecPlugin, RetryPolicy};
use tokio::io::BufReader;

use crate::config::SidecarConfig;
use crate::status::LogSink;
use crate::supervisor::{NetnsFactory, Supervisor};

/// meshbed network sidecar
#[derive(Parser, Debug)]
#[command(name = "meshbed-sidecar")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: $MESHBED_CONFIG or /etc/meshbed/sidecar.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Read events from this file instead of stdin
    #[arg(short, long)]
    pub events: Option<PathBuf>,

    /// Override the managed data network name
    #[arg(long, env = "MESHBED_DATA_NETWORK")]
    pub data_network: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Resolve the effective configuration.
    ///
    /// An explicitly given file must exist; the default location is optional.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded.
    pub fn load_config(&self) -> Result<SidecarConfig> {
        let config = match &self.config {
            Some(path) => SidecarConfig::load(path)
                .wrap_err_with(|| format!("Failed to load config {}", path.display()))?,
            None => SidecarConfig::load_or_default(&SIDECAR_CONFIG)?,
        };

        Ok(match &self.data_network {
            Some(network) => config.with_data_network(network),
            None => config,
        })
    }

    /// Run the sidecar until end of input or Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or the event source is unusable.
    pub async fn execute(self) -> Result<()> {
        let config = self.load_config()?;
        tracing::info!(
            network = %config.data_network,
            interface = %config.interface_name,
            subnet = %config.subnet,
            plugin = %config.plugin.plugin_type,
            "Starting meshbed sidecar"
        );

        let paths = config.paths();
        let cni = CniInvoker::new(
            Arc::new(ExecPlugin::new(paths.clone())),
            config.plugin.clone(),
            RetryPolicy::from(config.retry),
        );
        let mut supervisor = Supervisor::new(
            config.configurator_settings(),
            cni,
            Arc::new(NetnsFactory),
            Arc::new(LogSink),
        )
        .with_queue_depth(config.queue_depth);

        let shutdown = supervisor.cancellation();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received interrupt, shutting down");
                signal.cancel();
            }
        });

        match &self.events {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .wrap_err_with(|| format!("Failed to open events file {}", path.display()))?;
                crate::serve(BufReader::new(file), &mut supervisor, &paths, shutdown).await?;
            }
            None => {
                let stdin = BufReader::new(tokio::io::stdin());
                crate::serve(stdin, &mut supervisor, &paths, shutdown).await?;
            }
        }

        tracing::info!("Sidecar stopped");
        Ok(())
    }
}
