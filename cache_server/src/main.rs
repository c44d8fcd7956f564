use anyhow::Context;
use cache_server::config::Config;
use cache_server::CacheServer;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file, defaults to $XDG_CONFIG_HOME/cache-server/config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every configured cache instance
    Run,
    /// Validate the configuration and exit
    Check,
}

fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("cache-server").join("config.yaml")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = args.config.unwrap_or_else(default_config_path);
    info!("Loading configuration from {}", path.display());
    let config = Config::from_file(&path).with_context(|| format!("loading {}", path.display()))?;

    match args.command.unwrap_or(Command::Run) {
        Command::Check => {
            println!(
                "Configuration OK: {} caches, {}",
                config.caches.len(),
                if config.server.standalone { "standalone" } else { "networked" }
            );
        }
        Command::Run => {
            let server = CacheServer::bind(config).await.context("starting cache server")?;
            info!("Server API on {}", server.server_addr()?);
            server
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Cannot listen for ctrl-c: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
        }
    }
    Ok(())
}
