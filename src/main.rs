use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trojan_tunnel::cli::{execute_command, resolve_log_level, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = resolve_log_level(&cli);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level.to_lowercase()))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Trojan Tunnel v{}", env!("CARGO_PKG_VERSION"));

    execute_command(&cli).await
}
