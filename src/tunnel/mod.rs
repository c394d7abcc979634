//! 隧道抽象：每个协议层都实现 [`Tunnel`]，由下层 Client/Server 构造本层的 Client/Server，
//! 按名称列表逐层叠加即得到完整的协议栈。
#[cfg(test)]
pub(crate) mod pipe;
mod registry;
mod stack;

pub use registry::TunnelRegistry;
pub use stack::{build_client_stack, build_server_stack, StackTree};

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::common::{HeaderConn, Metadata, MetadataConn, RewindConn};
use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::redirector::Redirector;
use crate::trojan::{Authenticator, MemoryAuthenticator};

/// 协议层类型，同时作为上层调用下层时的 overlay 提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    Transport,
    Tls,
    Websocket,
    Trojan,
    Mux,
    Simplesocks,
    Router,
    Freedom,
    Adapter,
    Socks,
    Http,
}

impl TunnelKind {
    pub const ALL: [TunnelKind; 11] = [
        TunnelKind::Transport,
        TunnelKind::Tls,
        TunnelKind::Websocket,
        TunnelKind::Trojan,
        TunnelKind::Mux,
        TunnelKind::Simplesocks,
        TunnelKind::Router,
        TunnelKind::Freedom,
        TunnelKind::Adapter,
        TunnelKind::Socks,
        TunnelKind::Http,
    ];

    /// 注册表中使用的名称
    pub fn name(self) -> &'static str {
        match self {
            TunnelKind::Transport => "TRANSPORT",
            TunnelKind::Tls => "TLS",
            TunnelKind::Websocket => "WEBSOCKET",
            TunnelKind::Trojan => "TROJAN",
            TunnelKind::Mux => "MUX",
            TunnelKind::Simplesocks => "SIMPLESOCKS",
            TunnelKind::Router => "ROUTER",
            TunnelKind::Freedom => "FREEDOM",
            TunnelKind::Adapter => "ADAPTER",
            TunnelKind::Socks => "SOCKS",
            TunnelKind::Http => "HTTP",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TunnelKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        TunnelKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TunnelError::UnknownTunnel(s.to_string()))
    }
}

/// 流式连接
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {
    /// 该连接携带的目标信息，纯传输层连接返回 None
    fn metadata(&self) -> Option<&Metadata> {
        None
    }

    /// 对端地址（若可知）
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub type BoxConn = Box<dyn Conn>;

impl Conn for BoxConn {
    fn metadata(&self) -> Option<&Metadata> {
        (**self).metadata()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

impl Conn for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl Conn for tokio::io::DuplexStream {}

impl<S: Conn> Conn for RewindConn<S> {
    fn metadata(&self) -> Option<&Metadata> {
        self.get_ref().metadata()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().peer_addr()
    }
}

impl<S: Conn> Conn for HeaderConn<S> {
    fn metadata(&self) -> Option<&Metadata> {
        HeaderConn::metadata(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().peer_addr()
    }
}

impl<S: Conn> Conn for MetadataConn<S> {
    fn metadata(&self) -> Option<&Metadata> {
        Some(MetadataConn::metadata(self))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().peer_addr()
    }
}

impl<S: Conn> Conn for tokio_rustls::server::TlsStream<S> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

impl<S: Conn> Conn for tokio_rustls::client::TlsStream<S> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

/// 数据报连接，每个数据报都带有目标元数据
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// 读取一个数据报，返回长度与其来源/目标
    async fn read_with_metadata(&self, buf: &mut [u8]) -> io::Result<(usize, Metadata)>;

    /// 按元数据中的地址写出一个数据报
    async fn write_with_metadata(&self, buf: &[u8], metadata: &Metadata) -> io::Result<usize>;

    /// 关闭连接
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

pub type SharedPacketConn = Arc<dyn PacketConn>;

/// 主动拨号的一端
#[async_trait]
pub trait TunnelClient: Send + Sync {
    async fn dial_conn(
        &self,
        addr: Option<&crate::common::Address>,
        overlay: Option<TunnelKind>,
    ) -> Result<BoxConn>;

    async fn dial_packet(&self, overlay: Option<TunnelKind>) -> Result<SharedPacketConn>;

    async fn close(&self) -> Result<()>;
}

/// 被动接受的一端
#[async_trait]
pub trait TunnelServer: Send + Sync {
    async fn accept_conn(&self, overlay: Option<TunnelKind>) -> Result<BoxConn>;

    async fn accept_packet(&self, overlay: Option<TunnelKind>) -> Result<SharedPacketConn>;

    async fn close(&self) -> Result<()>;
}

/// 协议层工厂
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn kind(&self) -> TunnelKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>>;

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>>;
}

/// 构造协议层时共享的上下文
#[derive(Clone)]
pub struct TunnelContext {
    pub config: Arc<Config>,
    pub cancel: CancellationToken,
    pub redirector: Redirector,
    pub authenticator: Arc<dyn Authenticator>,
}

impl TunnelContext {
    /// 根据配置创建上下文，需在 tokio 运行时内调用
    pub fn new(config: Arc<Config>, cancel: CancellationToken) -> Self {
        let authenticator: Arc<dyn Authenticator> = Arc::new(MemoryAuthenticator::from_passwords(
            &config.password,
            config.trojan.ip_limit,
        ));
        Self::with_authenticator(config, cancel, authenticator)
    }

    pub fn with_authenticator(
        config: Arc<Config>,
        cancel: CancellationToken,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let redirector = Redirector::new(cancel.child_token());
        Self {
            config,
            cancel,
            redirector,
            authenticator,
        }
    }

    /// 绑定到子取消令牌的上下文
    pub fn child(&self) -> Self {
        Self {
            config: self.config.clone(),
            cancel: self.cancel.child_token(),
            redirector: self.redirector.clone(),
            authenticator: self.authenticator.clone(),
        }
    }
}

/// 需要下层的协议层在下层缺失时返回的错误
pub(crate) fn missing_underlay(kind: TunnelKind) -> TunnelError {
    TunnelError::config_error(format!("{} requires an underlying tunnel", kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in TunnelKind::ALL {
            assert_eq!(kind.name().parse::<TunnelKind>().unwrap(), kind);
        }
        assert_eq!("websocket".parse::<TunnelKind>().unwrap(), TunnelKind::Websocket);
    }

    #[test]
    fn test_unknown_kind() {
        let err = "SHADOW".parse::<TunnelKind>().unwrap_err();
        assert!(matches!(err, TunnelError::UnknownTunnel(name) if name == "SHADOW"));
    }
}
