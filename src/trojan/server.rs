use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{Authenticator, User};
use super::codec::{read_crlf, StreamPacketConn};
use super::HASH_LEN;
use crate::common::{Command, Metadata, RewindConn};
use crate::error::{Result, TunnelError};
use crate::redirector::Redirector;
use crate::sniff::Dispatcher;
use crate::tunnel::{BoxConn, Conn, SharedPacketConn, TunnelKind, TunnelServer};

/// 协议头最大长度：hash + CRLF + cmd + 域名地址 + CRLF
const MAX_HEADER_LEN: usize = HASH_LEN + 2 + 1 + 1 + 1 + 255 + 2 + 2;

/// 协议头格式错误同样按认证失败处理
fn malformed(e: io::Error) -> TunnelError {
    TunnelError::auth_failed(format!("malformed header: {}", e))
}

/// 释放用户来源 IP 的守卫
struct IpGuard {
    user: Arc<dyn User>,
    ip: Option<std::net::IpAddr>,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.user.del_ip(ip);
        }
    }
}

/// 已认证的入站连接，读写时累计用户流量
pub struct InboundConn {
    inner: RewindConn<BoxConn>,
    metadata: Metadata,
    guard: IpGuard,
}

impl InboundConn {
    pub fn user(&self) -> &Arc<dyn User> {
        &self.guard.user
    }
}

impl AsyncRead for InboundConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = (buf.filled().len() - before) as u64;
            self.guard.user.add_traffic(0, n);
        }
        res
    }
}

impl AsyncWrite for InboundConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.guard.user.add_traffic(n as u64, 0);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Conn for InboundConn {
    fn metadata(&self) -> Option<&Metadata> {
        Some(&self.metadata)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

/// Trojan 服务端
pub struct TrojanServer {
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    packets: Arc<Dispatcher<SharedPacketConn>>,
    cancel: CancellationToken,
}

/// 处理单个入站连接所需的共享状态
#[derive(Clone)]
struct Handler {
    authenticator: Arc<dyn Authenticator>,
    redirector: Redirector,
    fallback: String,
    auth_timeout: Duration,
    conns: Arc<Dispatcher<BoxConn>>,
    packets: Arc<Dispatcher<SharedPacketConn>>,
}

impl TrojanServer {
    pub fn new(
        underlay: Arc<dyn TunnelServer>,
        authenticator: Arc<dyn Authenticator>,
        redirector: Redirector,
        fallback: String,
        auth_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Trojan, TunnelKind::Mux],
            TunnelKind::Trojan,
            cancel.clone(),
        ));
        let packets = Arc::new(Dispatcher::new(
            &[TunnelKind::Trojan],
            TunnelKind::Trojan,
            cancel.clone(),
        ));
        let handler = Handler {
            authenticator,
            redirector,
            fallback,
            auth_timeout,
            conns: conns.clone(),
            packets: packets.clone(),
        };
        tokio::spawn(accept_loop(underlay.clone(), handler, cancel.clone()));
        Self {
            underlay,
            conns,
            packets,
            cancel,
        }
    }
}

async fn accept_loop(underlay: Arc<dyn TunnelServer>, handler: Handler, cancel: CancellationToken) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = underlay.accept_conn(Some(TunnelKind::Trojan)) => match result {
                Ok(conn) => conn,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    debug!("Trojan underlay accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let handler = handler.clone();
        tokio::spawn(async move { handler.handle(conn).await });
    }
    debug!("Trojan accept loop stopped");
}

impl Handler {
    async fn handle(self, conn: BoxConn) {
        let peer = conn.peer_addr();
        let mut conn = RewindConn::new(conn);
        conn.set_buffer_size(MAX_HEADER_LEN);

        let outcome = tokio::time::timeout(
            self.auth_timeout,
            authenticate(&mut conn, self.authenticator.as_ref(), peer),
        )
        .await
        .unwrap_or_else(|_| Err(TunnelError::timeout(self.auth_timeout)));
        let peer = peer.map(|a| a.to_string()).unwrap_or_default();

        match outcome {
            Ok((metadata, guard)) => {
                conn.stop_buffering();
                self.dispatch(conn, metadata, guard).await;
            }
            Err(e) => {
                // 超时只记调试日志，认证失败需要关注
                if e.is_timeout() {
                    debug!(
                        "Trojan header from {} incomplete: {}, redirecting to {}",
                        peer, e, self.fallback
                    );
                } else {
                    warn!("Trojan {} from {}, redirecting to {}", e, peer, self.fallback);
                }
                if let Err(e) = conn.rewind() {
                    debug!("Cannot rewind failed connection: {}", e);
                    return;
                }
                conn.stop_buffering();
                if let Err(e) = self.redirector.redirect(Box::new(conn), self.fallback.clone()).await {
                    debug!("Redirect rejected: {}", e);
                }
            }
        }
    }

    async fn dispatch(&self, conn: RewindConn<BoxConn>, metadata: Metadata, guard: IpGuard) {
        info!("Trojan {} from {:?}", metadata, conn.peer_addr());
        let command = metadata.command;
        let inbound = InboundConn {
            inner: conn,
            metadata,
            guard,
        };
        let queued = match command {
            Command::Connect => self.conns.dispatch(TunnelKind::Trojan, Box::new(inbound)).await,
            Command::Mux => self.conns.dispatch(TunnelKind::Mux, Box::new(inbound)).await,
            Command::Associate => {
                let packet: SharedPacketConn = Arc::new(StreamPacketConn::new(Box::new(inbound)));
                self.packets.dispatch(TunnelKind::Trojan, packet).await
            }
        };
        if !queued {
            debug!("Dropped authenticated {} connection during shutdown", command);
        }
    }
}

/// 读取并校验协议头；不会读取协议头之后的任何字节
async fn authenticate(
    conn: &mut RewindConn<BoxConn>,
    authenticator: &dyn Authenticator,
    peer: Option<SocketAddr>,
) -> Result<(Metadata, IpGuard)> {
    let mut hash = [0u8; HASH_LEN];
    let mut filled = 0;
    while filled < HASH_LEN {
        let n = conn
            .read(&mut hash[filled..])
            .await
            .map_err(malformed)?;
        if n == 0 {
            return Err(malformed(io::ErrorKind::UnexpectedEof.into()));
        }
        if !hash[filled..filled + n].iter().all(is_lower_hex) {
            return Err(malformed(io::Error::new(
                io::ErrorKind::InvalidData,
                "non-hex byte in hash",
            )));
        }
        filled += n;
    }
    // 已校验为 ASCII
    let hash = String::from_utf8_lossy(&hash).into_owned();

    let user = authenticator
        .auth_user(&hash)
        .ok_or_else(|| TunnelError::auth_failed("unknown hash"))?;

    read_crlf(conn).await.map_err(malformed)?;
    let metadata = Metadata::read_from(conn).await.map_err(malformed)?;
    read_crlf(conn).await.map_err(malformed)?;

    let ip = peer.map(|addr| addr.ip());
    if let Some(ip) = ip {
        if !user.add_ip(ip) {
            return Err(TunnelError::auth_failed(format!(
                "ip limit reached for {}",
                ip
            )));
        }
    }
    Ok((metadata, IpGuard { user, ip }))
}

fn is_lower_hex(b: &u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(b)
}

#[async_trait]
impl TunnelServer for TrojanServer {
    async fn accept_conn(&self, overlay: Option<TunnelKind>) -> Result<BoxConn> {
        match overlay {
            None | Some(TunnelKind::Trojan) => self.conns.accept(Some(TunnelKind::Trojan)).await,
            Some(TunnelKind::Mux) => self.conns.accept(Some(TunnelKind::Mux)).await,
            Some(other) => Err(TunnelError::not_supported(format!(
                "trojan server has no {} connections",
                other
            ))),
        }
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        self.packets.accept(None).await
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.underlay.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trojan::{password_hash, MemoryAuthenticator};
    use tokio::io::AsyncWriteExt;

    async fn run(
        input: &[u8],
        peer: Option<SocketAddr>,
        auth: &MemoryAuthenticator,
    ) -> Result<(Metadata, IpGuard)> {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(input).await.unwrap();
        let mut conn = RewindConn::new(Box::new(server) as BoxConn);
        conn.set_buffer_size(MAX_HEADER_LEN);
        authenticate(&mut conn, auth, peer).await
    }

    #[tokio::test]
    async fn test_failures_are_authentication_errors() {
        let auth = MemoryAuthenticator::from_passwords(&["p".to_string()], 1);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let mut header = password_hash("p").into_bytes();
        header.extend_from_slice(b"\r\n\x01\x03\x0bexample.com\x00\x50\r\n");
        // 守卫存活期间占用唯一的 IP 名额
        let (metadata, _guard) = run(&header, Some(peer), &auth).await.unwrap();
        assert_eq!(metadata.command, Command::Connect);

        let err = run(&header, Some("10.0.0.2:4000".parse().unwrap()), &auth)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::AuthenticationFailed(_)));
        assert!(err.to_string().contains("ip limit"));

        let mut unknown = password_hash("q").into_bytes();
        unknown.extend_from_slice(b"\r\n");
        let err = run(&unknown, None, &auth).await.err().unwrap();
        assert!(err.to_string().contains("unknown hash"));

        let mut bad_type = password_hash("p").into_bytes();
        bad_type.extend_from_slice(b"\r\n\x01\x09\x00\x50\r\n");
        let err = run(&bad_type, None, &auth).await.err().unwrap();
        assert!(matches!(err, TunnelError::AuthenticationFailed(_)));
        assert!(!err.is_timeout());
    }
}
