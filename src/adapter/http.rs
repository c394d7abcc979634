//! HTTP 代理入口：`CONNECT` 隧道与绝对 URI 的普通请求
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{handshake_timeout, Address, Metadata, MetadataConn, RewindConn};
use crate::error::{Result, TunnelError};
use crate::sniff::Dispatcher;
use crate::tunnel::{
    missing_underlay, BoxConn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext,
    TunnelKind, TunnelServer,
};

/// 请求头的最大长度
const MAX_REQUEST_HEAD: usize = 8 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

#[derive(Debug, PartialEq, Eq)]
struct ProxyRequest {
    connect: bool,
    target: Address,
}

/// 读取到空行为止，返回请求头长度（含结尾的空行）
async fn read_head(conn: &mut RewindConn<BoxConn>) -> Result<(Vec<u8>, usize)> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok((head, pos + 4));
        }
        if head.len() >= MAX_REQUEST_HEAD {
            return Err(TunnelError::protocol_error("HTTP request head too long"));
        }
        let want = chunk.len().min(MAX_REQUEST_HEAD - head.len());
        let n = conn.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(TunnelError::protocol_error(
                "Unexpected EOF while reading HTTP request",
            ));
        }
        head.extend_from_slice(&chunk[..n]);
    }
}

/// `host` 或 `host:port`，IPv6 可带方括号
fn host_to_address(host: &str, default_port: u16) -> Result<Address> {
    if let Ok(addr) = host.parse::<Address>() {
        return Ok(addr);
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.is_empty() {
        return Err(TunnelError::protocol_error("Empty host in HTTP request"));
    }
    Ok(match bare.parse::<IpAddr>() {
        Ok(ip) => Address::ip_addr(ip, default_port),
        Err(_) => Address::domain(bare, default_port),
    })
}

fn parse_request(head: &[u8]) -> Result<ProxyRequest> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TunnelError::protocol_error("HTTP request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(TunnelError::protocol_error(format!(
            "Invalid HTTP request line: {:?}",
            request_line
        )));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = target
            .parse::<Address>()
            .map_err(|e| TunnelError::protocol_error(format!("Invalid CONNECT target: {}", e)))?;
        return Ok(ProxyRequest {
            connect: true,
            target,
        });
    }

    let uri = target
        .parse::<http::Uri>()
        .map_err(|e| TunnelError::protocol_error(format!("Invalid request URI: {}", e)))?;
    let target = match uri.host() {
        Some(host) => host_to_address(host, uri.port_u16().unwrap_or(80))?,
        None => {
            let host = lines
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
                .map(|(_, value)| value.trim())
                .ok_or_else(|| TunnelError::protocol_error("Cannot determine target from HTTP request"))?;
            host_to_address(host, 80)?
        }
    };
    Ok(ProxyRequest {
        connect: false,
        target,
    })
}

#[derive(Clone)]
struct Handler {
    conns: Arc<Dispatcher<BoxConn>>,
}

impl Handler {
    async fn handle(self, conn: BoxConn) -> Result<()> {
        let timeout = handshake_timeout();
        let mut conn = RewindConn::new(conn);
        conn.set_buffer_size(MAX_REQUEST_HEAD);

        let (head, head_len) = tokio::time::timeout(timeout, read_head(&mut conn))
            .await
            .map_err(|_| TunnelError::timeout(timeout))??;
        let request = match parse_request(&head[..head_len]) {
            Ok(request) => request,
            Err(e) => {
                let _ = conn.write_all(BAD_REQUEST).await;
                return Err(e);
            }
        };
        conn.rewind()?;

        if request.connect {
            // 丢弃 CONNECT 请求头，之后的字节属于隧道负载
            let mut consumed = vec![0u8; head_len];
            conn.read_exact(&mut consumed).await?;
            conn.stop_buffering();
            conn.write_all(CONNECT_ESTABLISHED).await?;
            conn.flush().await?;
            debug!("HTTP CONNECT {}", request.target);
        } else {
            conn.stop_buffering();
            debug!("HTTP request for {}", request.target);
        }

        let conn: BoxConn = Box::new(MetadataConn::new(conn, Metadata::connect(request.target)));
        self.conns.dispatch(TunnelKind::Http, conn).await;
        Ok(())
    }
}

/// HTTP 代理服务端，从 Adapter 的 HTTP 队列取连接
pub struct HttpServer {
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
}

impl HttpServer {
    pub fn new(underlay: Arc<dyn TunnelServer>, cancel: CancellationToken) -> Self {
        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Http],
            TunnelKind::Http,
            cancel.clone(),
        ));
        let handler = Handler {
            conns: conns.clone(),
        };
        tokio::spawn(accept_loop(underlay.clone(), handler, cancel.clone()));
        Self {
            underlay,
            conns,
            cancel,
        }
    }
}

async fn accept_loop(underlay: Arc<dyn TunnelServer>, handler: Handler, cancel: CancellationToken) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = underlay.accept_conn(Some(TunnelKind::Http)) => match result {
                Ok(conn) => conn,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    debug!("HTTP underlay accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(conn).await {
                debug!("HTTP proxy connection dropped: {}", e);
            }
        });
    }
    debug!("HTTP accept loop stopped");
}

#[async_trait]
impl TunnelServer for HttpServer {
    async fn accept_conn(&self, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        self.conns.accept(None).await
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("http proxy does not carry packets"))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.underlay.close().await
    }
}

pub struct HttpTunnel;

#[async_trait]
impl Tunnel for HttpTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Http
    }

    async fn new_client(
        &self,
        _ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        Err(TunnelError::not_supported("http has no client side"))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Http))?;
        Ok(Arc::new(HttpServer::new(underlay, ctx.cancel.child_token())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::pipe::Pipe;
    use crate::tunnel::Conn;

    #[test]
    fn test_parse_requests() {
        let req = parse_request(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap();
        assert!(req.connect);
        assert_eq!(req.target, Address::domain("example.com", 443));

        let req = parse_request(b"GET http://example.com:8080/a?b HTTP/1.1\r\n\r\n").unwrap();
        assert!(!req.connect);
        assert_eq!(req.target, Address::domain("example.com", 8080));

        let req = parse_request(b"GET http://[::1]/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.target, Address::ip_addr("::1".parse().unwrap(), 80));

        let req = parse_request(b"GET /x HTTP/1.1\r\nHost: example.org\r\n\r\n").unwrap();
        assert_eq!(req.target, Address::domain("example.org", 80));

        assert!(parse_request(b"CONNECT example.com HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request(b"GET /x HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request(b"garbage\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_connect_keeps_early_data() {
        let cancel = CancellationToken::new();
        let pipe = Pipe::new();
        let server = HttpServer::new(pipe.clone(), cancel.child_token());

        let mut client = pipe.dial_conn(None, None).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly")
            .await
            .unwrap();
        let mut response = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, CONNECT_ESTABLISHED);

        let mut inbound = server.accept_conn(None).await.unwrap();
        assert_eq!(
            inbound.metadata().unwrap().address,
            Address::domain("example.com", 443)
        );
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_plain_request_forwarded_verbatim() {
        let cancel = CancellationToken::new();
        let pipe = Pipe::new();
        let server = HttpServer::new(pipe.clone(), cancel.child_token());

        let request = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut client = pipe.dial_conn(None, None).await.unwrap();
        client.write_all(request).await.unwrap();

        let mut inbound = server.accept_conn(None).await.unwrap();
        assert_eq!(
            inbound.metadata().unwrap().address,
            Address::domain("example.com", 80)
        );
        let mut buf = vec![0u8; request.len()];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &request[..]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bad_request() {
        let cancel = CancellationToken::new();
        let pipe = Pipe::new();
        let _server = HttpServer::new(pipe.clone(), cancel.child_token());

        let mut client = pipe.dial_conn(None, None).await.unwrap();
        client.write_all(b"nonsense\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));
        cancel.cancel();
    }
}
