// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use crate::router::{DomainStrategy, Policy};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// 本地 SOCKS5/HTTP 入口，经隧道转发
    #[default]
    Client,
    /// 隧道服务端，解包后直连目标
    Server,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::Client => write!(f, "client"),
            RunType::Server => write!(f, "server"),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 运行模式
    #[serde(default)]
    pub run_type: RunType,
    /// 本地监听地址
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// 本地监听端口
    pub local_port: u16,
    /// 客户端：服务器地址；服务端：伪装用的 HTTP 后端地址
    pub remote_addr: String,
    /// 客户端：服务器端口；服务端：伪装用的 HTTP 后端端口
    pub remote_port: u16,
    /// 密码列表（客户端使用第一个）
    #[serde(default)]
    pub password: Vec<String>,
    /// 日志级别 (off, error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// SOCKS5 UDP 映射的空闲超时（秒）
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout: u64,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub trojan: TrojanConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_udp_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// TLS 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// 是否启用 TLS 层
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 服务端证书路径
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// 服务端私钥路径
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// 客户端自定义 CA 证书
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// 客户端 SNI（默认使用 remote_addr）
    #[serde(default)]
    pub sni: Option<String>,
    /// ALPN 协议列表
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
    /// 客户端是否验证服务端证书
    #[serde(default = "default_true")]
    pub verify: bool,
    /// 服务端：非 TLS 流量的转发地址
    #[serde(default)]
    pub fallback_addr: Option<String>,
    /// 服务端：非 TLS 流量的转发端口
    #[serde(default)]
    pub fallback_port: Option<u16>,
}

fn default_alpn() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert: None,
            key: None,
            ca: None,
            sni: None,
            alpn: default_alpn(),
            verify: true,
            fallback_addr: None,
            fallback_port: None,
        }
    }
}

/// WebSocket 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 升级请求路径
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// 客户端 Host 头（默认使用 remote_addr）
    #[serde(default)]
    pub host: Option<String>,
}

fn default_ws_path() -> String {
    "/".to_string()
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_ws_path(),
            host: None,
        }
    }
}

/// 多路复用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 单个会话的最大并发流数（0 表示不限制）
    #[serde(default = "default_mux_concurrency")]
    pub concurrency: usize,
    /// 空闲会话的回收超时（秒）
    #[serde(default = "default_mux_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_mux_concurrency() -> usize {
    8
}

fn default_mux_idle_timeout() -> u64 {
    30
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_mux_concurrency(),
            idle_timeout: default_mux_idle_timeout(),
        }
    }
}

impl MuxConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

/// 路由配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 拒绝规则
    #[serde(default)]
    pub block: Vec<String>,
    /// 直连规则
    #[serde(default)]
    pub bypass: Vec<String>,
    /// 代理规则
    #[serde(default)]
    pub proxy: Vec<String>,
    /// 未命中任何规则时的策略
    #[serde(default)]
    pub default_policy: Policy,
    /// 域名解析策略
    #[serde(default)]
    pub domain_strategy: DomainStrategy,
    /// geoip/geosite 文本数据目录
    #[serde(default)]
    pub geodata_dir: Option<PathBuf>,
}

/// Trojan 协议配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrojanConfig {
    /// 读取协议头的超时（秒）
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,
    /// 单个用户允许的并发来源 IP 数（0 表示不限制）
    #[serde(default)]
    pub ip_limit: usize,
}

fn default_auth_timeout() -> u64 {
    8
}

impl Default for TrojanConfig {
    fn default() -> Self {
        Self {
            auth_timeout: default_auth_timeout(),
            ip_limit: 0,
        }
    }
}

impl TrojanConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout)
    }
}

/// TCP 选项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub no_delay: bool,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// 直连与隧道拨号的超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: true,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl TcpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Config {
    /// 从 TOML 文本解析并验证
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse configuration")?;
        config.expand_paths();
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content)
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate(self)
    }

    /// 展开路径中的 `~` 与环境变量
    fn expand_paths(&mut self) {
        for path in [
            &mut self.tls.cert,
            &mut self.tls.key,
            &mut self.tls.ca,
            &mut self.router.geodata_dir,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand_path(path);
        }
    }

    /// 本地监听地址
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    /// 远端地址
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.remote_addr, self.remote_port)
    }

    /// 非 TLS 流量的转发目标
    pub fn tls_fallback_address(&self) -> Option<String> {
        match (&self.tls.fallback_addr, self.tls.fallback_port) {
            (Some(addr), Some(port)) => Some(format!("{}:{}", addr, port)),
            (None, Some(port)) => Some(format!("127.0.0.1:{}", port)),
            _ => None,
        }
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = r#"
run_type = "client"
local_addr = "127.0.0.1"
local_port = 1080
remote_addr = "proxy.example.com"
remote_port = 443
password = ["secret"]

[mux]
enabled = true
concurrency = 4
"#;

    #[test]
    fn test_parse_client_with_defaults() {
        let config = Config::parse(CLIENT).unwrap();
        assert_eq!(config.run_type, RunType::Client);
        assert!(config.tls.enabled);
        assert!(config.tls.verify);
        assert_eq!(config.tls.alpn, vec!["http/1.1"]);
        assert!(config.mux.enabled);
        assert_eq!(config.mux.concurrency, 4);
        assert_eq!(config.mux.idle_timeout(), Duration::from_secs(30));
        assert!(!config.websocket.enabled);
        assert_eq!(config.remote_address(), "proxy.example.com:443");
    }

    #[test]
    fn test_parse_server() {
        let content = r#"
run_type = "server"
local_addr = "0.0.0.0"
local_port = 443
remote_addr = "127.0.0.1"
remote_port = 80
password = ["a", "b"]

[tls]
cert = "/tmp/cert.pem"
key = "/tmp/key.pem"
fallback_port = 8080

[router]
enabled = true
block = ["geosite:ads", "cidr:10.0.0.0/8"]
default_policy = "bypass"
domain_strategy = "ip_on_demand"
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(config.run_type, RunType::Server);
        assert_eq!(config.password.len(), 2);
        assert_eq!(config.tls_fallback_address().as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(config.router.default_policy, Policy::Bypass);
        assert_eq!(config.router.domain_strategy, DomainStrategy::IpOnDemand);
    }

    #[test]
    fn test_missing_required_field() {
        assert!(Config::parse("run_type = \"client\"").is_err());
    }

    #[test]
    fn test_expand_home_path() {
        std::env::set_var("TROJAN_TUNNEL_TEST_DIR", "/opt/certs");
        let expanded = expand_path(Path::new("$TROJAN_TUNNEL_TEST_DIR/cert.pem"));
        assert_eq!(expanded, PathBuf::from("/opt/certs/cert.pem"));
    }
}
