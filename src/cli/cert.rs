use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::tls;

/// 展开 `~` 并创建缺失的父目录，模板中的默认证书位置在 `~/.config/trojan-tunnel` 下
fn prepare_output(path: &str) -> Result<PathBuf> {
    let path = PathBuf::from(shellexpand::tilde(path).as_ref());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    Ok(path)
}

#[cfg(unix)]
fn restrict_key_permissions(key: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(key, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions of {:?}", key))
}

#[cfg(not(unix))]
fn restrict_key_permissions(_key: &Path) -> Result<()> {
    Ok(())
}

/// 生成服务端使用的自签名证书，私钥仅属主可读
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let cert_path = prepare_output(cert_out)?;
    let key_path = prepare_output(key_out)?;

    tls::generate_self_signed_cert(common_name, alt_names, &cert_path, &key_path)?;
    restrict_key_permissions(&key_path)?;
    info!(
        "Generated certificate for {} ({} extra SAN)",
        common_name,
        alt_names.len()
    );

    println!("Generated self-signed certificate: {}", cert_path.display());
    println!("Generated private key: {}", key_path.display());
    println!("Clients must set `verify = false` or trust this certificate explicitly.");

    Ok(())
}
