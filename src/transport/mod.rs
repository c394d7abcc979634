//! 最底层的 TCP 传输以及其上的 TLS、WebSocket 伪装层
mod tls;
mod websocket;

pub use tls::{TlsClient, TlsServer, TlsTunnel};
pub use websocket::{WebsocketClient, WebsocketServer, WebsocketTunnel, WsConn};

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{handshake_timeout, Address, RewindConn};
use crate::config::TcpConfig;
use crate::error::{Result, TunnelError};
use crate::sniff::{looks_like_http_get, Dispatcher};
use crate::tunnel::{
    BoxConn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext, TunnelKind, TunnelServer,
};

/// Keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
/// Keepalive 探测间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// accept 出错后的重试间隔
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 设置 TCP_NODELAY 与 keepalive
pub fn apply_tcp_options(stream: &TcpStream, config: &TcpConfig) {
    if config.no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
    }
    if config.keep_alive {
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);
        let sock_ref = SockRef::from(stream);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!(
                "Failed to set TCP keepalive on {}: {}",
                stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".into()),
                e
            );
        }
    }
}

/// 带超时地建立 TCP 连接
pub async fn connect_tcp(addr: &str, config: &TcpConfig) -> Result<TcpStream> {
    let timeout = config.connect_timeout();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::timeout(timeout))?
        .map_err(|e| TunnelError::connection_failed(addr, e))?;
    apply_tcp_options(&stream, config);
    Ok(stream)
}

/// TCP 传输客户端，总是连接到配置的远端
pub struct TransportClient {
    remote: String,
    tcp: TcpConfig,
}

impl TransportClient {
    pub fn new(remote: String, tcp: TcpConfig) -> Self {
        Self { remote, tcp }
    }
}

#[async_trait]
impl TunnelClient for TransportClient {
    async fn dial_conn(&self, _addr: Option<&Address>, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let stream = connect_tcp(&self.remote, &self.tcp).await?;
        debug!("Transport connected to {}", self.remote);
        Ok(Box::new(stream))
    }

    async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("transport does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 连接分类方式
#[derive(Debug, Clone, Copy)]
enum Classify {
    /// 全部交给 TLS 层，不预读
    Tls,
    /// 预读 `GET `，区分 WebSocket 升级与原始 Trojan 流
    Sniff { websocket: bool },
}

/// TCP 传输服务端
pub struct TransportServer {
    local_addr: std::net::SocketAddr,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
}

impl TransportServer {
    pub async fn bind(
        addr: &str,
        tcp: TcpConfig,
        tls_enabled: bool,
        websocket: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TunnelError::transport_error(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        info!("Transport server listening on {}", local_addr);

        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Tls, TunnelKind::Trojan, TunnelKind::Websocket],
            TunnelKind::Trojan,
            cancel.clone(),
        ));
        let classify = if tls_enabled {
            Classify::Tls
        } else {
            Classify::Sniff { websocket }
        };
        tokio::spawn(accept_loop(listener, tcp, classify, conns.clone(), cancel.clone()));

        Ok(Self {
            local_addr,
            conns,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    tcp: TcpConfig,
    classify: Classify,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };
        debug!("Accepted TCP connection from {}", peer);
        apply_tcp_options(&stream, &tcp);

        let conns = conns.clone();
        tokio::spawn(async move {
            match classify {
                Classify::Tls => {
                    conns.dispatch(TunnelKind::Tls, Box::new(stream)).await;
                }
                Classify::Sniff { websocket } => {
                    let mut conn = RewindConn::new(stream);
                    // 超时未凑齐的连接按已到达的字节分类，交给默认的 Trojan 层
                    let head = match conn.peek_timeout(4, handshake_timeout()).await {
                        Ok(head) => head,
                        Err(e) => {
                            debug!("Failed to sniff {}: {}", peer, e);
                            return;
                        }
                    };
                    conn.stop_buffering();
                    let kind = if websocket && looks_like_http_get(&head) {
                        TunnelKind::Websocket
                    } else {
                        TunnelKind::Trojan
                    };
                    conns.dispatch(kind, Box::new(conn)).await;
                }
            }
        });
    }
    debug!("Transport accept loop stopped");
}

#[async_trait]
impl TunnelServer for TransportServer {
    async fn accept_conn(&self, overlay: Option<TunnelKind>) -> Result<BoxConn> {
        self.conns.accept(overlay).await
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("transport does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

pub struct TransportTunnel;

#[async_trait]
impl Tunnel for TransportTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Transport
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        Ok(Arc::new(TransportClient::new(
            ctx.config.remote_address(),
            ctx.config.tcp.clone(),
        )))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let server = TransportServer::bind(
            &ctx.config.local_address(),
            ctx.config.tcp.clone(),
            ctx.config.tls.enabled,
            ctx.config.websocket.enabled,
            ctx.cancel.child_token(),
        )
        .await?;
        Ok(Arc::new(server))
    }
}
