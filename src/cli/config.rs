use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{Config, RunType};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // o+r = 0o004, g+r = 0o040
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}), \
             it contains trojan passwords. RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

impl CheckResult {
    fn print_json(&self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 需要提示但不阻止启动的问题
fn collect_warnings(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut check_file = |label: &str, path: &Option<PathBuf>| {
        if let Some(path) = path {
            if !path.exists() {
                warnings.push(format!("{} file not found: {:?}", label, path));
            }
        }
    };
    match config.run_type {
        RunType::Server => {
            if config.tls.enabled {
                check_file("Certificate", &config.tls.cert);
                check_file("Key", &config.tls.key);
            }
        }
        RunType::Client => check_file("CA certificate", &config.tls.ca),
    }
    if let Some(dir) = &config.router.geodata_dir {
        if config.router.enabled && !dir.is_dir() {
            warnings.push(format!("Geodata directory not found: {:?}", dir));
        }
    }
    if config.run_type == RunType::Server && config.password.is_empty() {
        warnings.push("No passwords configured, all traffic goes to the fallback backend".to_string());
    }
    if config.run_type == RunType::Client && config.tls.enabled && !config.tls.verify {
        warnings.push("tls.verify is disabled".to_string());
    }
    warnings
}

fn details(config: &Config) -> serde_json::Value {
    serde_json::json!({
        "local": config.local_address(),
        "remote": config.remote_address(),
        "passwords": config.password.len(),
        "tls": config.tls.enabled,
        "websocket": config.websocket.enabled.then_some(&config.websocket.path),
        "mux": config.mux.enabled.then_some(config.mux.concurrency),
        "router": config.router.enabled,
        "fallback": config.tls_fallback_address(),
    })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            CheckResult {
                valid: false,
                config_type: "unknown".to_string(),
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            }
            .print_json()?;
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let config = match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                CheckResult {
                    valid: false,
                    config_type: "unknown".to_string(),
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                }
                .print_json()?;
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Ensure local_port, remote_addr and remote_port are present");
                println!("  3. Clients need at least one password");
                println!("  4. Servers with TLS need both tls.cert and tls.key");
                println!("  5. Router rules use prefixes such as domain:, full:, cidr:, geoip:");
            }
            return Err(e);
        }
    };

    let warnings = collect_warnings(&config);
    if format == "json" {
        return CheckResult {
            valid: true,
            config_type: config.run_type.to_string(),
            warnings,
            error: None,
            details: details(&config),
        }
        .print_json();
    }

    println!("✓ Run type: {}", config.run_type);
    println!("✓ Local address: {}", config.local_address());
    println!("✓ Remote address: {}", config.remote_address());
    println!("✓ Passwords: {}", config.password.len());
    println!("✓ TLS: {}", if config.tls.enabled { "enabled" } else { "disabled" });
    if config.websocket.enabled {
        println!("✓ WebSocket path: {}", config.websocket.path);
    }
    if config.mux.enabled {
        println!(
            "✓ Mux: concurrency {}, idle timeout {}s",
            config.mux.concurrency, config.mux.idle_timeout
        );
    }
    if config.router.enabled {
        println!(
            "✓ Router: {} block, {} bypass, {} proxy rule(s), default {:?}",
            config.router.block.len(),
            config.router.bypass.len(),
            config.router.proxy.len(),
            config.router.default_policy
        );
    }
    for warning in &warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ Configuration is valid!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_relative_path() {
        let expanded = expand_path("config.toml").unwrap();
        assert!(Path::new(&expanded).is_absolute());
        assert!(expanded.ends_with("config.toml"));
    }

    #[test]
    fn test_warnings_for_missing_files() {
        let config: Config = toml::from_str(
            r#"
run_type = "server"
local_port = 443
remote_addr = "127.0.0.1"
remote_port = 80

[tls]
cert = "/nonexistent/cert.pem"
key = "/nonexistent/key.pem"
"#,
        )
        .unwrap();
        let warnings = collect_warnings(&config);
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("Certificate"));
        assert!(warnings[2].contains("No passwords"));
    }
}
