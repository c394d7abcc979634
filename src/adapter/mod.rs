//! 客户端本地入口：同一端口同时接受 SOCKS5 与 HTTP 代理请求
mod http;
mod socks;

pub use http::{HttpServer, HttpTunnel};
pub use socks::{SocksPacketConn, SocksServer, SocksTunnel};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{handshake_timeout, RewindConn};
use crate::config::TcpConfig;
use crate::error::{Result, TunnelError};
use crate::sniff::Dispatcher;
use crate::transport::apply_tcp_options;
use crate::tunnel::{
    BoxConn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext, TunnelKind, TunnelServer,
};

/// SOCKS5 握手的版本字节
pub const SOCKS_VERSION: u8 = 0x05;

/// 本地监听器，按首字节分流到 SOCKS5 或 HTTP 队列
pub struct AdapterServer {
    local_addr: SocketAddr,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
}

impl AdapterServer {
    pub async fn bind(addr: &str, tcp: TcpConfig, cancel: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TunnelError::transport_error(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        info!("Adapter listening on {} (socks5/http)", local_addr);

        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Socks, TunnelKind::Http],
            TunnelKind::Http,
            cancel.clone(),
        ));
        tokio::spawn(accept_loop(listener, tcp, conns.clone(), cancel.clone()));
        Ok(Self {
            local_addr,
            conns,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    tcp: TcpConfig,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept local connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        apply_tcp_options(&stream, &tcp);

        let conns = conns.clone();
        tokio::spawn(async move {
            let mut conn = RewindConn::new(stream);
            let head = match tokio::time::timeout(handshake_timeout(), conn.peek(1)).await {
                Ok(Ok(head)) if !head.is_empty() => head,
                Ok(Ok(_)) => return,
                Ok(Err(e)) => {
                    debug!("Failed to sniff local connection {}: {}", peer, e);
                    return;
                }
                Err(_) => {
                    debug!("Timed out sniffing local connection {}", peer);
                    return;
                }
            };
            conn.stop_buffering();
            let kind = if head[0] == SOCKS_VERSION {
                TunnelKind::Socks
            } else {
                TunnelKind::Http
            };
            debug!("Local connection {} classified as {}", peer, kind);
            conns.dispatch(kind, Box::new(conn)).await;
        });
    }
    debug!("Adapter accept loop stopped");
}

#[async_trait]
impl TunnelServer for AdapterServer {
    async fn accept_conn(&self, overlay: Option<TunnelKind>) -> Result<BoxConn> {
        self.conns.accept(overlay).await
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("adapter does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

pub struct AdapterTunnel;

#[async_trait]
impl Tunnel for AdapterTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Adapter
    }

    async fn new_client(
        &self,
        _ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        Err(TunnelError::not_supported("adapter has no client side"))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let server = AdapterServer::bind(
            &ctx.config.local_address(),
            ctx.config.tcp.clone(),
            ctx.cancel.child_token(),
        )
        .await?;
        Ok(Arc::new(server))
    }
}
