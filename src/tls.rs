use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;

use crate::config::TlsConfig;

/// 读取 PEM 证书链
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {:?}", path);
    }
    Ok(certs)
}

/// 读取 PEM 私钥
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key in {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))
}

fn alpn_protocols(config: &TlsConfig) -> Vec<Vec<u8>> {
    config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// 根据 `[tls]` 段构建服务端配置
pub fn server_config(config: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    let cert_path = config.cert.as_deref().context("tls.cert is required")?;
    let key_path = config.key.as_deref().context("tls.key is required")?;

    let mut server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert_path)?, load_key(key_path)?)
        .context("Failed to create server config")?;
    server.alpn_protocols = alpn_protocols(config);
    Ok(Arc::new(server))
}

/// 根据 `[tls]` 段构建客户端配置
pub fn client_config(config: &TlsConfig) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca_path) = config.ca.as_deref() {
        for cert in load_certs(ca_path)? {
            roots.add(cert).context("Failed to add CA certificate")?;
        }
    } else if config.verify {
        // 使用系统 CA 证书
        for cert in rustls_native_certs::load_native_certs().certs {
            roots.add(cert).ok();
        }
    }

    let mut client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !config.verify {
        client
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }
    client.alpn_protocols = alpn_protocols(config);
    Ok(Arc::new(client))
}

/// 解析 SNI
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).with_context(|| format!("Invalid server name: {}", name))
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names = alt_names.to_vec();
    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let certified =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    std::fs::write(cert_out, certified.cert.pem())
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, certified.signing_key.serialize_pem())
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;
    Ok(())
}

/// 不验证证书的验证器（仅用于测试或自签名部署）
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            ED25519,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        (
            dir.join(format!("trojan-tunnel-{}-{}-cert.pem", tag, pid)),
            dir.join(format!("trojan-tunnel-{}-{}-key.pem", tag, pid)),
        )
    }

    #[test]
    fn test_generate_and_load() {
        let (cert, key) = temp_paths("tls-unit");
        generate_self_signed_cert("localhost", &[], &cert, &key).unwrap();

        let config = TlsConfig {
            cert: Some(cert.clone()),
            key: Some(key.clone()),
            ..Default::default()
        };
        let server = server_config(&config).unwrap();
        assert_eq!(server.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let client = client_config(&TlsConfig {
            ca: Some(cert.clone()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.alpn_protocols.len(), 1);

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }

    #[test]
    fn test_missing_files() {
        assert!(load_certs(Path::new("/nonexistent/cert.pem")).is_err());
        assert!(server_config(&TlsConfig::default()).is_err());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("").is_err());
    }
}
