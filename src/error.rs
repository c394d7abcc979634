/// 自定义错误类型
///
/// 使用 thiserror 定义隧道各层共享的错误类型，替代泛型的 anyhow::Error，
/// 调用者可以据此区分取消、超时与其他失败
use std::io;
use thiserror::Error;

use crate::common::Address;

/// 隧道的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 未注册的隧道名称
    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 传输层错误
    #[error("Transport error: {0}")]
    TransportError(String),

    /// 协议错误
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 路由规则拒绝
    #[error("Destination {0} is blocked by router")]
    Blocked(Address),

    /// 所属上下文已取消
    #[error("Operation cancelled")]
    Cancelled,

    /// 该层不支持的操作
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建协议错误
    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建传输层错误
    pub fn transport_error(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建不支持错误
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否因取消而结束（属于正常关闭路径）
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            TunnelError::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
            TunnelError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, err),
            other => io::Error::other(other),
        }
    }
}
