use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{handshake_timeout, Address, RewindConn};
use crate::error::{Result, TunnelError};
use crate::redirector::Redirector;
use crate::sniff::Dispatcher;
use crate::tunnel::{
    missing_underlay, BoxConn, Conn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext,
    TunnelKind, TunnelServer,
};

/// HTTP 升级请求头的最大长度
const MAX_REQUEST_HEAD: usize = 4096;

/// 把 WebSocket 消息流适配为字节流
///
/// 读取时拆开二进制帧，写入时每次写操作发送一个二进制帧。收到 Close 帧视为 EOF。
pub struct WsConn {
    inner: WebSocketStream<BoxConn>,
    pending: Bytes,
    peer: Option<SocketAddr>,
}

impl WsConn {
    pub fn new(inner: WebSocketStream<BoxConn>) -> Self {
        let peer = inner.get_ref().peer_addr();
        Self {
            inner,
            pending: Bytes::new(),
            peer,
        }
    }
}

impl AsyncRead for WsConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => self.pending = data,
                    Message::Text(text) => {
                        self.pending = Bytes::copy_from_slice(text.as_str().as_bytes());
                    }
                    Message::Close(_) => {
                        debug!("WebSocket close frame received");
                        return Poll::Ready(Ok(()));
                    }
                    // tungstenite 自动应答 Ping
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                },
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(format!("WebSocket error: {}", e))))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => {
                let msg = Message::Binary(Bytes::copy_from_slice(buf));
                match self.inner.start_send_unpin(msg) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(format!(
                        "WebSocket send error: {}",
                        e
                    )))),
                }
            }
            Poll::Ready(Err(e)) => {
                Poll::Ready(Err(io::Error::other(format!("WebSocket error: {}", e))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner
            .poll_flush_unpin(cx)
            .map_err(|e| io::Error::other(format!("WebSocket flush error: {}", e)))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner
            .poll_close_unpin(cx)
            .map_err(|e| io::Error::other(format!("WebSocket close error: {}", e)))
    }
}

impl Conn for WsConn {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// WebSocket 客户端
pub struct WebsocketClient {
    underlay: Arc<dyn TunnelClient>,
    url: String,
}

impl WebsocketClient {
    pub fn new(underlay: Arc<dyn TunnelClient>, host: &str, path: &str) -> Self {
        Self {
            underlay,
            url: format!("ws://{}{}", host, path),
        }
    }
}

#[async_trait]
impl TunnelClient for WebsocketClient {
    async fn dial_conn(&self, _addr: Option<&Address>, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let inner = self
            .underlay
            .dial_conn(None, Some(TunnelKind::Websocket))
            .await?;
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::config_error(format!("Invalid websocket url {}: {}", self.url, e)))?;
        let (stream, _response) = tokio_tungstenite::client_async(request, inner)
            .await
            .map_err(|e| TunnelError::transport_error(format!("WebSocket handshake failed: {}", e)))?;
        debug!("WebSocket connected to {}", self.url);
        Ok(Box::new(WsConn::new(stream)))
    }

    async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("websocket does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        self.underlay.close().await
    }
}

/// 解析出的升级请求关键字段
#[derive(Debug, PartialEq, Eq)]
struct UpgradeRequest {
    path: String,
    upgrade: bool,
}

/// 解析请求行与 `Upgrade` 头，请求头不完整时返回 None
fn parse_request_head(head: &[u8]) -> Option<UpgradeRequest> {
    let end = head.windows(4).position(|w| w == b"\r\n\r\n")?;
    let text = std::str::from_utf8(&head[..end]).ok()?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    if request_line.next()? != "GET" {
        return None;
    }
    // 只比较路径部分，查询串（如 `?ed=2048`）不参与匹配
    let target = request_line.next()?.parse::<http::Uri>().ok()?;
    let path = target.path().to_string();
    let upgrade = lines.filter_map(|line| line.split_once(':')).any(|(name, value)| {
        name.trim().eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket")
    });
    Some(UpgradeRequest { path, upgrade })
}

#[derive(Clone)]
struct Upgrader {
    path: String,
    fallback: String,
    redirector: Redirector,
    conns: Arc<Dispatcher<BoxConn>>,
}

impl Upgrader {
    async fn handle(self, conn: BoxConn) -> Result<()> {
        let timeout = handshake_timeout();
        let mut conn = RewindConn::new(conn);
        conn.set_buffer_size(MAX_REQUEST_HEAD);

        // 超时未收到完整请求头的连接同样交给回落后端
        let request = tokio::time::timeout(timeout, read_request_head(&mut conn))
            .await
            .ok()
            .flatten();
        conn.rewind()?;
        conn.stop_buffering();

        let accepted = matches!(&request, Some(req) if req.upgrade && req.path == self.path);
        if !accepted {
            info!(
                "Non-websocket request {:?} from {:?}, redirecting to {}",
                request.map(|r| r.path),
                conn.peer_addr(),
                self.fallback
            );
            return self.redirector.redirect(Box::new(conn), self.fallback.clone()).await;
        }

        let inner: BoxConn = Box::new(conn);
        let stream = tokio::time::timeout(timeout, tokio_tungstenite::accept_async(inner))
            .await
            .map_err(|_| TunnelError::timeout(timeout))?
            .map_err(|e| TunnelError::transport_error(format!("WebSocket handshake failed: {}", e)))?;
        debug!("WebSocket upgrade accepted on {}", self.path);
        self.conns.dispatch(TunnelKind::Trojan, Box::new(WsConn::new(stream))).await;
        Ok(())
    }
}

/// 读取请求头直到空行、EOF 或超过缓冲上限
async fn read_request_head(conn: &mut RewindConn<BoxConn>) -> Option<UpgradeRequest> {
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    while head.len() < MAX_REQUEST_HEAD {
        let want = chunk.len().min(MAX_REQUEST_HEAD - head.len());
        match conn.read(&mut chunk[..want]).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => head.extend_from_slice(&chunk[..n]),
        }
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return parse_request_head(&head);
        }
    }
    None
}

/// WebSocket 服务端
pub struct WebsocketServer {
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
}

impl WebsocketServer {
    pub fn new(
        underlay: Arc<dyn TunnelServer>,
        path: String,
        fallback: String,
        redirector: Redirector,
        cancel: CancellationToken,
    ) -> Self {
        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Trojan],
            TunnelKind::Trojan,
            cancel.clone(),
        ));
        let upgrader = Upgrader {
            path,
            fallback,
            redirector,
            conns: conns.clone(),
        };
        tokio::spawn(accept_loop(underlay.clone(), upgrader, cancel.clone()));
        Self {
            underlay,
            conns,
            cancel,
        }
    }
}

async fn accept_loop(underlay: Arc<dyn TunnelServer>, upgrader: Upgrader, cancel: CancellationToken) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = underlay.accept_conn(Some(TunnelKind::Websocket)) => match result {
                Ok(conn) => conn,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!("WebSocket underlay accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let upgrader = upgrader.clone();
        tokio::spawn(async move {
            if let Err(e) = upgrader.handle(conn).await {
                debug!("WebSocket connection dropped: {}", e);
            }
        });
    }
    debug!("WebSocket accept loop stopped");
}

#[async_trait]
impl TunnelServer for WebsocketServer {
    async fn accept_conn(&self, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        self.conns.accept(None).await
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("websocket does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.underlay.close().await
    }
}

pub struct WebsocketTunnel;

#[async_trait]
impl Tunnel for WebsocketTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Websocket
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Websocket))?;
        let config = &ctx.config;
        let host = config.websocket.host.as_deref().unwrap_or(&config.remote_addr);
        Ok(Arc::new(WebsocketClient::new(underlay, host, &config.websocket.path)))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Websocket))?;
        Ok(Arc::new(WebsocketServer::new(
            underlay,
            ctx.config.websocket.path.clone(),
            ctx.config.remote_address(),
            ctx.redirector.clone(),
            ctx.cancel.child_token(),
        )))
    }
}
