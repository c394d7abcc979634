#![allow(dead_code)]
// Common utilities for integration tests

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use trojan_tunnel::{Config, Proxy};

/// 伪装后端返回的固定响应
pub const FALLBACK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nfallback";

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::{AtomicU64, Ordering};
    use trojan_tunnel::tls;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

/// UDP 回显服务
pub async fn start_udp_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let socket = UdpSocket::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind udp echo server");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            if socket.send_to(&buf[..n], from).await.is_err() {
                break;
            }
        }
    })
}

/// 模拟真实网站的伪装后端：读到请求头后返回固定响应并关闭
pub async fn start_fallback_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind fallback server");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(FALLBACK_RESPONSE).await;
                let _ = socket.shutdown().await;
            });
        }
    })
}

/// 服务端配置
pub fn server_config(port: u16, fallback_port: u16, cert: &Path, key: &Path, extra: &str) -> Config {
    let content = format!(
        r#"
run_type = "server"
local_addr = "127.0.0.1"
local_port = {port}
remote_addr = "127.0.0.1"
remote_port = {fallback_port}
password = ["correct horse", "battery staple"]
log_level = "debug"

[tls]
cert = "{cert}"
key = "{key}"
{extra}
"#,
        cert = cert.display(),
        key = key.display(),
    );
    Config::parse(&content).expect("invalid server config")
}

/// 客户端配置（跳过证书校验）
pub fn client_config(port: u16, server_port: u16, password: &str, extra: &str) -> Config {
    let content = format!(
        r#"
run_type = "client"
local_addr = "127.0.0.1"
local_port = {port}
remote_addr = "127.0.0.1"
remote_port = {server_port}
password = ["{password}"]
log_level = "debug"

[tls]
sni = "localhost"
verify = false
{extra}
"#
    );
    Config::parse(&content).expect("invalid client config")
}

/// 在后台运行代理，返回用于停止的令牌
pub async fn spawn_proxy(config: Config) -> CancellationToken {
    let cancel = CancellationToken::new();
    let proxy = Proxy::from_config(config, cancel.clone())
        .await
        .expect("Failed to build proxy");
    tokio::spawn(async move {
        let _ = proxy.run().await;
    });
    cancel
}

/// 完成 SOCKS5 无认证握手并发出 CONNECT，返回已可收发负载的连接
pub async fn socks5_connect(proxy_port: u16, host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", proxy_port)).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(std::io::Error::other(format!("socks5 reply {}", reply[1])));
    }
    Ok(stream)
}

/// 写入数据并读回同样长度的响应
pub async fn echo_roundtrip(stream: &mut TcpStream, data: &[u8], timeout_duration: Duration) -> Result<Vec<u8>, String> {
    timeout(timeout_duration, async {
        stream
            .write_all(data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;
        let mut response = vec![0u8; data.len()];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;
        Ok::<_, String>(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// 读到 EOF
pub async fn read_to_end(stream: &mut (impl AsyncReadExt + Unpin), timeout_duration: Duration) -> Vec<u8> {
    let mut response = Vec::new();
    let _ = timeout(timeout_duration, stream.read_to_end(&mut response)).await;
    response
}

/// Wait for server to be ready
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}
