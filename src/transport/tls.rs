use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{handshake_timeout, Address, RewindConn};
use crate::error::{Result, TunnelError};
use crate::redirector::Redirector;
use crate::sniff::{looks_like_http_get, Dispatcher, TLS_HANDSHAKE};
use crate::tls;
use crate::tunnel::{
    missing_underlay, BoxConn, Conn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext,
    TunnelKind, TunnelServer,
};

/// TLS 客户端
pub struct TlsClient {
    underlay: Arc<dyn TunnelClient>,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    pub fn new(
        underlay: Arc<dyn TunnelClient>,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        Self {
            underlay,
            connector: TlsConnector::from(config),
            server_name,
        }
    }
}

#[async_trait]
impl TunnelClient for TlsClient {
    async fn dial_conn(&self, _addr: Option<&Address>, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let inner = self.underlay.dial_conn(None, Some(TunnelKind::Tls)).await?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), inner)
            .await
            .map_err(|e| TunnelError::transport_error(format!("TLS handshake failed: {}", e)))?;
        debug!("TLS connection established");
        Ok(Box::new(stream))
    }

    async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("tls does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        self.underlay.close().await
    }
}

/// 服务端每个连接的处理参数
#[derive(Clone)]
struct Handshaker {
    acceptor: TlsAcceptor,
    fallback: Option<String>,
    redirector: Redirector,
    websocket: bool,
    conns: Arc<Dispatcher<BoxConn>>,
}

/// TLS 服务端
///
/// 首字节不是 TLS 握手记录的连接被转交给 `tls.fallback_*`；
/// 握手完成后再预读明文，`GET ` 开头的进入 WebSocket 队列，其余进入 Trojan 队列。
pub struct TlsServer {
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
}

impl TlsServer {
    pub fn new(
        underlay: Arc<dyn TunnelServer>,
        config: Arc<rustls::ServerConfig>,
        fallback: Option<String>,
        redirector: Redirector,
        websocket: bool,
        cancel: CancellationToken,
    ) -> Self {
        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Trojan, TunnelKind::Websocket],
            TunnelKind::Trojan,
            cancel.clone(),
        ));
        let handshaker = Handshaker {
            acceptor: TlsAcceptor::from(config),
            fallback,
            redirector,
            websocket,
            conns: conns.clone(),
        };
        tokio::spawn(accept_loop(underlay.clone(), handshaker, cancel.clone()));
        Self {
            underlay,
            conns,
            cancel,
        }
    }
}

async fn accept_loop(underlay: Arc<dyn TunnelServer>, handshaker: Handshaker, cancel: CancellationToken) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = underlay.accept_conn(Some(TunnelKind::Tls)) => match result {
                Ok(conn) => conn,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    debug!("TLS underlay accept failed: {}", e);
                    tokio::time::sleep(super::ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };
        let handshaker = handshaker.clone();
        tokio::spawn(async move {
            let peer = conn.peer_addr();
            if let Err(e) = handshaker.handle(conn).await {
                debug!("TLS connection from {:?} dropped: {}", peer, e);
            }
        });
    }
    debug!("TLS accept loop stopped");
}

impl Handshaker {
    async fn handle(self, conn: BoxConn) -> Result<()> {
        let timeout = handshake_timeout();
        let mut conn = RewindConn::new(conn);
        let first = tokio::time::timeout(timeout, conn.peek(1))
            .await
            .map_err(|_| TunnelError::timeout(timeout))??;
        conn.stop_buffering();

        if first.first() != Some(&TLS_HANDSHAKE) {
            return match &self.fallback {
                Some(target) => {
                    info!("Non-TLS connection from {:?}, redirecting to {}", conn.peer_addr(), target);
                    self.redirector.redirect(Box::new(conn), target.clone()).await
                }
                None => Err(TunnelError::protocol_error("not a TLS connection")),
            };
        }

        let started = tokio::time::Instant::now();
        let stream = tokio::time::timeout(timeout, self.acceptor.accept(conn))
            .await
            .map_err(|_| TunnelError::timeout(timeout))?
            .map_err(|e| TunnelError::transport_error(format!("TLS handshake failed: {}", e)))?;

        // 握手后不足 4 字节的连接在剩余时间耗尽后交给默认的 Trojan 层
        let mut stream = RewindConn::new(stream);
        let head = stream
            .peek_timeout(4, timeout.saturating_sub(started.elapsed()))
            .await?;
        stream.stop_buffering();

        let kind = if self.websocket && looks_like_http_get(&head) {
            TunnelKind::Websocket
        } else {
            TunnelKind::Trojan
        };
        debug!("TLS handshake completed, dispatching to {}", kind);
        self.conns.dispatch(kind, Box::new(stream)).await;
        Ok(())
    }
}

#[async_trait]
impl TunnelServer for TlsServer {
    async fn accept_conn(&self, overlay: Option<TunnelKind>) -> Result<BoxConn> {
        match overlay {
            Some(TunnelKind::Websocket) => self.conns.accept(Some(TunnelKind::Websocket)).await,
            _ => self.conns.accept(Some(TunnelKind::Trojan)).await,
        }
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("tls does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.underlay.close().await
    }
}

pub struct TlsTunnel;

#[async_trait]
impl Tunnel for TlsTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Tls
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Tls))?;
        let config = &ctx.config;
        let sni = config.tls.sni.as_deref().unwrap_or(&config.remote_addr);
        Ok(Arc::new(TlsClient::new(
            underlay,
            tls::client_config(&config.tls)?,
            tls::server_name(sni)?,
        )))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Tls))?;
        let config = &ctx.config;
        Ok(Arc::new(TlsServer::new(
            underlay,
            tls::server_config(&config.tls)?,
            config.tls_fallback_address(),
            ctx.redirector.clone(),
            config.websocket.enabled,
            ctx.cancel.child_token(),
        )))
    }
}
