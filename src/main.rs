use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use webdriver_hub::{Config, DriverPool, ProxyState, proxy};

#[derive(Parser)]
#[command(name = "webdriver-hub")]
#[command(about = "WebDriver hub - spawns browser drivers on demand and proxies sessions to them")]
#[command(version)]
struct Cli {
    /// Proxy bind address
    #[arg(long, default_value = "127.0.0.1:4444")]
    bind: String,

    /// Path prefix the proxy serves under
    #[arg(long, default_value = "/wd/hub")]
    prefix: String,

    /// First port handed to spawned driver processes
    #[arg(long, default_value_t = 9515)]
    base_port: u16,

    /// Directory downloaded driver artifacts are installed into
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// New-session retries against one driver process
    #[arg(long, default_value_t = 3)]
    connect_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut config = Config::from_env();
    config.bind = cli.bind;
    config.path_prefix = cli.prefix;
    config.base_port = cli.base_port;
    config.max_connect_attempts = cli.connect_attempts;
    if let Some(dir) = cli.install_dir {
        config.install_dir = dir;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let client = reqwest::Client::new();
    let pool = Arc::new(DriverPool::new(config.clone(), client));
    let state = ProxyState::new(pool, &config);
    proxy::serve(state, &config.bind).await?;
    Ok(())
}
