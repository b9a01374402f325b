//! Concord relay server binary

use clap::{Parser, Subcommand};
use concord_server::{http, ServerConfig, ServerContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "concord-server")]
#[command(about = "Concord collaboration relay server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Server bind address (overrides the config file)
        #[arg(short, long)]
        addr: Option<String>,

        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { addr, config } => serve(addr, config).await,
    }
}

async fn serve(addr: Option<String>, config_path: Option<String>) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => toml::from_str::<ServerConfig>(&std::fs::read_to_string(&path)?)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = addr {
        config.bind_addr = addr;
    }
    config.validate();

    let ctx = ServerContext::new(config);
    ctx.start_background_tasks();

    let listener = tokio::net::TcpListener::bind(&ctx.config.bind_addr).await?;
    info!(
        "concord-server v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );
    axum::serve(listener, http::router(ctx)).await?;
    Ok(())
}
