//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::builder::BoolishValueParser;
use clap::{Args, Subcommand};
use tracing::{info, warn};
use twc_core::CacheServices;
use twc_core::config::CacheConfig;
use twc_core::streaming::parse_byte_size;
use twc_core::tracing_setup::{CliLogLevel, init_tracing};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the web cache
    Serve(ServeArgs),
}

/// Flags of the `serve` command. Unset flags keep the environment or
/// built-in defaults.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,
    /// Port to bind to, 8080 unless configured otherwise
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Origin URL used for every request, overriding X-Source-Url
    #[arg(long, env = "SOURCE_URL")]
    pub source_url: Option<String>,
    /// Response rate such as "50M", overridden by X-Download-Rate
    #[arg(long, env = "DOWNLOAD_RATE", value_parser = parse_rate)]
    pub download_rate: Option<u64>,
    /// Object store access key
    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub aws_access_key_id: Option<String>,
    /// Object store secret key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,
    /// Endpoint of an S3-compatible object store
    #[arg(long, env = "AWS_ENDPOINT")]
    pub aws_endpoint: Option<String>,
    /// Object store region
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,
    /// Bucket holding torrents, records and pieces
    #[arg(long, env = "AWS_BUCKET")]
    pub aws_bucket: Option<String>,
    /// Spread pieces over per-prefix buckets
    #[arg(long, env = "AWS_BUCKET_SPREAD", value_parser = BoolishValueParser::new())]
    pub aws_bucket_spread: bool,
    /// Directory of the on-disk preload cache
    #[arg(long)]
    pub preload_dir: Option<PathBuf>,
    /// Size cap of the preload cache such as "10G"
    #[arg(long, value_parser = parse_rate)]
    pub preload_max_size: Option<u64>,
    /// Keep the preload directory on shutdown
    #[arg(long)]
    pub keep_preload_dir: bool,
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    pub log_level: CliLogLevel,
    /// Write a trace-level log of this run into this directory
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,
}

impl ServeArgs {
    /// Applies the flags on top of `config`.
    pub fn apply(&self, config: &mut CacheConfig) {
        if let Some(host) = &self.host {
            config.web.host = host.clone();
        }
        if let Some(port) = self.port {
            config.web.port = port;
        }
        if let Some(source_url) = &self.source_url {
            config.web.source_url = Some(source_url.clone());
        }
        if let Some(rate) = self.download_rate {
            config.web.download_rate = Some(rate);
        }

        if let Some(key) = &self.aws_access_key_id {
            config.store.access_key_id = Some(key.clone());
        }
        if let Some(secret) = &self.aws_secret_access_key {
            config.store.secret_access_key = Some(secret.clone());
        }
        if let Some(endpoint) = &self.aws_endpoint {
            config.store.endpoint = Some(endpoint.clone());
        }
        if let Some(region) = &self.aws_region {
            config.store.region = region.clone();
        }
        if let Some(bucket) = &self.aws_bucket {
            config.store.bucket = bucket.clone();
        }
        if self.aws_bucket_spread {
            config.store.bucket_spread = true;
        }

        if let Some(dir) = &self.preload_dir {
            config.preload.dir = dir.clone();
        }
        if let Some(max_size) = self.preload_max_size {
            config.preload.max_size = max_size;
        }
        if self.keep_preload_dir {
            config.preload.remove_on_shutdown = false;
        }
    }
}

fn parse_rate(value: &str) -> Result<u64, String> {
    parse_byte_size(value).map_err(|e| e.to_string())
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => serve(args).await,
    }
}

/// Runs the web cache until Ctrl-C, then drains requests and shuts the
/// pipeline down.
///
/// # Errors
/// - Tracing could not be initialized
/// - The object store client or preload directory could not be set up
/// - The listener could not be bound
pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    init_tracing(args.log_level.as_tracing_level(), args.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let mut config = CacheConfig::from_env();
    args.apply(&mut config);

    let services = Arc::new(
        CacheServices::new(config)
            .await
            .context("Failed to set up cache services")?,
    );

    let served = twc_web::run_server(Arc::clone(&services), shutdown_signal()).await;
    services.shutdown().await;
    served.context("Web server failed")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, shutting down");
}
