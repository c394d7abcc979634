use anyhow::{bail, Context, Result};
use tracing::warn;

use super::{Config, RouterConfig, RunType};
use crate::router::RuleSpec;

/// 单个 mux 会话允许的最大并发上限
const MAX_MUX_CONCURRENCY: usize = 1024;

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_address(&config.local_addr, "local_addr")?;
        Self::validate_port(config.local_port, "local_port")?;
        Self::validate_address(&config.remote_addr, "remote_addr")?;
        Self::validate_port(config.remote_port, "remote_port")?;

        if !LOG_LEVELS.contains(&config.log_level.to_lowercase().as_str()) {
            bail!(
                "log_level must be one of {:?} (current: {})",
                LOG_LEVELS,
                config.log_level
            );
        }

        if config.password.iter().any(|p| p.is_empty()) {
            bail!("password entries cannot be empty");
        }

        match config.run_type {
            RunType::Client => Self::validate_client(config)?,
            RunType::Server => Self::validate_server(config)?,
        }

        Self::validate_mux(config)?;
        Self::validate_router(&config.router)?;

        if config.trojan.auth_timeout == 0 {
            bail!("trojan.auth_timeout must be greater than 0");
        }
        if config.udp_timeout == 0 {
            bail!("udp_timeout must be greater than 0");
        }

        Ok(())
    }

    /// 验证客户端配置
    fn validate_client(config: &Config) -> Result<()> {
        if config.password.is_empty() {
            bail!("client requires at least one password");
        }
        if config.tls.enabled && !config.tls.verify {
            warn!("tls.verify is disabled, the server certificate will not be checked");
        }
        Ok(())
    }

    /// 验证服务器配置
    fn validate_server(config: &Config) -> Result<()> {
        if config.password.is_empty() {
            warn!("No passwords configured, every connection will be redirected to the fallback backend");
        }

        if config.tls.enabled {
            match (&config.tls.cert, &config.tls.key) {
                (Some(_), Some(_)) => {}
                _ => bail!("tls.cert and tls.key must both be set when TLS is enabled"),
            }
        }

        if let Some(port) = config.tls.fallback_port {
            Self::validate_port(port, "tls.fallback_port")?;
        } else if config.tls.fallback_addr.is_some() {
            bail!("tls.fallback_addr requires tls.fallback_port");
        }

        if config.websocket.enabled && !config.websocket.path.starts_with('/') {
            bail!(
                "websocket.path must start with '/' (current: {})",
                config.websocket.path
            );
        }

        Ok(())
    }

    /// 验证多路复用配置
    fn validate_mux(config: &Config) -> Result<()> {
        if !config.mux.enabled {
            return Ok(());
        }
        if config.mux.concurrency > MAX_MUX_CONCURRENCY {
            bail!(
                "mux.concurrency cannot exceed {} (current: {})",
                MAX_MUX_CONCURRENCY,
                config.mux.concurrency
            );
        }
        if config.mux.idle_timeout == 0 {
            bail!("mux.idle_timeout must be greater than 0");
        }
        Ok(())
    }

    /// 验证路由规则语法
    pub fn validate_router(router: &RouterConfig) -> Result<()> {
        for (bucket, rules) in [
            ("block", &router.block),
            ("bypass", &router.bypass),
            ("proxy", &router.proxy),
        ] {
            for rule in rules {
                rule.parse::<RuleSpec>()
                    .with_context(|| format!("Invalid router.{} rule '{}'", bucket, rule))?;
            }
        }
        Ok(())
    }
}
