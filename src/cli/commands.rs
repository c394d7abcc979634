use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::proxy::Proxy;

use super::cert;
use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// 日志级别：命令行优先，其次是 `run` 配置文件中的 log_level
pub fn resolve_log_level(cli: &super::Cli) -> String {
    use super::Commands;

    if let Some(level) = &cli.log_level {
        return level.clone();
    }
    if let Commands::Run { config } = &cli.command {
        if let Ok(config) = expand_path(config).and_then(Config::from_file) {
            return config.log_level;
        }
    }
    "info".to_string()
}

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run(config).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
    }

    Ok(())
}

/// 运行代理直到 Ctrl+C
async fn run(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading configuration from: {}", config_path);
    let config = Config::from_file(&config_path)?;

    let cancel = CancellationToken::new();
    let proxy = Proxy::from_config(config, cancel.clone()).await?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    proxy.run().await?;
    Ok(())
}
