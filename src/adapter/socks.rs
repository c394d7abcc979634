//! SOCKS5 入口（RFC 1928），支持无认证的 CONNECT 与 UDP ASSOCIATE
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SOCKS_VERSION;
use crate::common::{handshake_timeout, Address, Command, Metadata, MetadataConn};
use crate::error::{Result, TunnelError};
use crate::sniff::Dispatcher;
use crate::trojan::MAX_PACKET_SIZE;
use crate::tunnel::{
    missing_underlay, BoxConn, PacketConn, SharedPacketConn, Tunnel, TunnelClient,
    TunnelContext, TunnelKind, TunnelServer,
};

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// UDP 请求头 `RSV(2) | FRAG | ATYP | ADDR | PORT` 的最大长度
const MAX_UDP_HEADER: usize = 3 + 1 + 1 + 255 + 2;

/// 协商认证方式，只接受无认证
async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(TunnelError::protocol_error(format!(
            "Unsupported SOCKS version: {}",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
        return Err(TunnelError::protocol_error(
            "SOCKS5 client does not offer no-auth method",
        ));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

/// 读取 `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u8, Address)> {
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(TunnelError::protocol_error("Invalid SOCKS5 request version"));
    }
    let address = Address::read_from(stream).await?;
    Ok((head[1], address))
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8, bound: &Address) -> io::Result<()> {
    let mut reply = Vec::with_capacity(3 + bound.encoded_len());
    reply.extend_from_slice(&[SOCKS_VERSION, rep, 0x00]);
    bound.write_to(&mut reply)?;
    stream.write_all(&reply).await?;
    stream.flush().await
}

fn unspecified() -> Address {
    Address::ip_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// 解析 SOCKS5 UDP 请求头，返回目标地址与负载偏移；分片数据报返回 None
fn parse_udp_header(packet: &[u8]) -> io::Result<Option<(Address, usize)>> {
    if packet.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short socks udp packet"));
    }
    if packet[2] != 0 {
        return Ok(None);
    }
    match Address::decode(&packet[3..])? {
        Some((address, used)) => Ok(Some((address, 3 + used))),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated socks udp header",
        )),
    }
}

/// UDP ASSOCIATE 建立的中继套接字
///
/// 第一个数据报的来源被记为客户端地址，此后只接受该地址的数据报。
/// 空闲超过 `timeout` 或控制连接关闭后读取返回错误。
pub struct SocksPacketConn {
    socket: UdpSocket,
    client: Mutex<Option<SocketAddr>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SocksPacketConn {
    pub fn new(socket: UdpSocket, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            socket,
            client: Mutex::new(None),
            timeout,
            cancel,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn recv(&self, packet: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "socks udp association closed",
            )),
            result = tokio::time::timeout(self.timeout, self.socket.recv_from(packet)) => {
                result.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socks udp association idle"))?
            }
        }
    }
}

#[async_trait]
impl PacketConn for SocksPacketConn {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> io::Result<(usize, Metadata)> {
        let mut packet = vec![0u8; MAX_UDP_HEADER + MAX_PACKET_SIZE];
        loop {
            let (n, from) = self.recv(&mut packet).await?;
            {
                let mut client = self.client.lock();
                match *client {
                    Some(addr) if addr != from => {
                        debug!("Dropping socks datagram from unexpected peer {}", from);
                        continue;
                    }
                    Some(_) => {}
                    None => *client = Some(from),
                }
            }
            let (address, offset) = match parse_udp_header(&packet[..n]) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => {
                    debug!("Dropping fragmented socks datagram from {}", from);
                    continue;
                }
                Err(e) => {
                    debug!("Dropping malformed socks datagram from {}: {}", from, e);
                    continue;
                }
            };
            let payload = &packet[offset..n];
            if payload.len() > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("datagram of {} bytes exceeds buffer of {}", payload.len(), buf.len()),
                ));
            }
            buf[..payload.len()].copy_from_slice(payload);
            return Ok((payload.len(), Metadata::new(Command::Associate, address)));
        }
    }

    async fn write_with_metadata(&self, buf: &[u8], metadata: &Metadata) -> io::Result<usize> {
        let client = (*self.client.lock()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "socks udp client address unknown")
        })?;
        let mut packet = Vec::with_capacity(3 + metadata.address.encoded_len() + buf.len());
        packet.extend_from_slice(&[0, 0, 0]);
        metadata.address.write_to(&mut packet)?;
        packet.extend_from_slice(buf);
        self.socket.send_to(&packet, client).await?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[derive(Clone)]
struct Handler {
    udp_ip: IpAddr,
    udp_timeout: Duration,
    conns: Arc<Dispatcher<BoxConn>>,
    packets: Arc<Dispatcher<SharedPacketConn>>,
    cancel: CancellationToken,
}

impl Handler {
    async fn handle(self, mut conn: BoxConn) -> Result<()> {
        let timeout = handshake_timeout();
        let (cmd, address) = tokio::time::timeout(timeout, async {
            negotiate(&mut conn).await?;
            read_request(&mut conn).await
        })
        .await
        .map_err(|_| TunnelError::timeout(timeout))??;

        match cmd {
            CMD_CONNECT => {
                write_reply(&mut conn, REP_SUCCEEDED, &unspecified()).await?;
                debug!("SOCKS5 connect {}", address);
                let conn: BoxConn = Box::new(MetadataConn::new(conn, Metadata::connect(address)));
                self.conns.dispatch(TunnelKind::Socks, conn).await;
                Ok(())
            }
            CMD_UDP_ASSOCIATE => self.associate(conn).await,
            other => {
                write_reply(&mut conn, REP_COMMAND_NOT_SUPPORTED, &unspecified()).await?;
                Err(TunnelError::protocol_error(format!(
                    "Unsupported SOCKS5 command: {}",
                    other
                )))
            }
        }
    }

    async fn associate(self, mut conn: BoxConn) -> Result<()> {
        let socket = match UdpSocket::bind(SocketAddr::new(self.udp_ip, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                write_reply(&mut conn, REP_GENERAL_FAILURE, &unspecified()).await?;
                return Err(e.into());
            }
        };
        let bound = socket.local_addr()?;
        write_reply(&mut conn, REP_SUCCEEDED, &Address::from_socket_addr(bound)).await?;
        info!("SOCKS5 UDP association on {}", bound);

        let cancel = self.cancel.child_token();
        let packet: SharedPacketConn =
            Arc::new(SocksPacketConn::new(socket, self.udp_timeout, cancel.clone()));

        // 控制连接关闭即结束关联
        tokio::spawn(async move {
            let mut sink = [0u8; 64];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = conn.read(&mut sink) => match result {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    },
                }
            }
            debug!("SOCKS5 UDP association on {} ended", bound);
            cancel.cancel();
        });

        self.packets.dispatch(TunnelKind::Socks, packet).await;
        Ok(())
    }
}

/// SOCKS5 服务端，从 Adapter 的 SOCKS 队列取连接
pub struct SocksServer {
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    packets: Arc<Dispatcher<SharedPacketConn>>,
    cancel: CancellationToken,
}

impl SocksServer {
    /// UDP 中继套接字绑定在 `udp_ip` 上
    pub fn new(
        underlay: Arc<dyn TunnelServer>,
        udp_ip: IpAddr,
        udp_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Socks],
            TunnelKind::Socks,
            cancel.clone(),
        ));
        let packets = Arc::new(Dispatcher::new(
            &[TunnelKind::Socks],
            TunnelKind::Socks,
            cancel.clone(),
        ));
        let handler = Handler {
            udp_ip,
            udp_timeout,
            conns: conns.clone(),
            packets: packets.clone(),
            cancel: cancel.clone(),
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
            result = underlay.accept_conn(Some(TunnelKind::Socks)) => match result {
                Ok(conn) => conn,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    debug!("SOCKS5 underlay accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(conn).await {
                debug!("SOCKS5 connection dropped: {}", e);
            }
        });
    }
    debug!("SOCKS5 accept loop stopped");
}

#[async_trait]
impl TunnelServer for SocksServer {
    async fn accept_conn(&self, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        self.conns.accept(None).await
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        self.packets.accept(None).await
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.underlay.close().await
    }
}

pub struct SocksTunnel;

#[async_trait]
impl Tunnel for SocksTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Socks
    }

    async fn new_client(
        &self,
        _ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        Err(TunnelError::not_supported("socks has no client side"))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Socks))?;
        let udp_ip = ctx
            .config
            .local_addr
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Ok(Arc::new(SocksServer::new(
            underlay,
            udp_ip,
            Duration::from_secs(ctx.config.udp_timeout),
            ctx.cancel.child_token(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::pipe::Pipe;
    use crate::tunnel::Conn;

    fn server(pipe: Arc<Pipe>, udp_timeout: Duration, cancel: &CancellationToken) -> SocksServer {
        SocksServer::new(
            pipe,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_timeout,
            cancel.child_token(),
        )
    }

    async fn handshake(client: &mut BoxConn, request: &[u8]) -> Vec<u8> {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client.write_all(request).await.unwrap();
        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        let mut rest = vec![0u8; if head[3] == 0x04 { 18 } else { 6 }];
        client.read_exact(&mut rest).await.unwrap();
        [head.to_vec(), rest].concat()
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let cancel = CancellationToken::new();
        let pipe = Pipe::new();
        let server = server(pipe.clone(), Duration::from_secs(5), &cancel);

        let mut client = pipe.dial_conn(None, None).await.unwrap();
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        let reply = handshake(&mut client, &request).await;
        assert_eq!(reply[1], REP_SUCCEEDED);

        client.write_all(b"hello").await.unwrap();
        let mut inbound = server.accept_conn(None).await.unwrap();
        assert_eq!(
            inbound.metadata().unwrap().address,
            Address::domain("example.com", 443)
        );
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_rejects_auth_only_client() {
        let cancel = CancellationToken::new();
        let pipe = Pipe::new();
        let _server = server(pipe.clone(), Duration::from_secs(5), &cancel);

        let mut client = pipe.dial_conn(None, None).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, METHOD_UNACCEPTABLE]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let cancel = CancellationToken::new();
        let pipe = Pipe::new();
        let _server = server(pipe.clone(), Duration::from_secs(5), &cancel);

        let mut client = pipe.dial_conn(None, None).await.unwrap();
        let reply = handshake(&mut client, &[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).await;
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_associate() {
        let cancel = CancellationToken::new();
        let pipe = Pipe::new();
        let server = server(pipe.clone(), Duration::from_secs(5), &cancel);

        let mut control = pipe.dial_conn(None, None).await.unwrap();
        let reply = handshake(&mut control, &[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await;
        assert_eq!(reply[1], REP_SUCCEEDED);
        let (relay, _) = Address::decode(&reply[3..]).unwrap().unwrap();
        let relay = relay.to_socket_addr().await.unwrap();

        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut datagram = vec![0, 0, 0, 0x01, 8, 8, 8, 8, 0, 53];
        datagram.extend_from_slice(b"query");
        local.send_to(&datagram, relay).await.unwrap();

        let packet = server.accept_packet(None).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, meta) = packet.read_with_metadata(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(meta.address, Address::ip_addr([8, 8, 8, 8].into(), 53));

        packet.write_with_metadata(b"answer", &meta).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = local.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..10], &datagram[..10]);
        assert_eq!(&buf[10..n], b"answer");

        // 关闭控制连接后关联随之结束
        drop(control);
        let mut buf = [0u8; 64];
        let result = tokio::time::timeout(Duration::from_secs(2), packet.read_with_metadata(&mut buf))
            .await
            .unwrap();
        assert!(result.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_idle_expiry() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = SocksPacketConn::new(socket, Duration::from_millis(50), CancellationToken::new());
        let mut buf = [0u8; 16];
        let err = packet.read_with_metadata(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_fragmented_datagram_dropped() {
        assert!(parse_udp_header(&[0, 0, 1, 0x01, 1, 2, 3, 4, 0, 80]).unwrap().is_none());
        assert!(parse_udp_header(&[0, 0, 0, 0x03, 10, b'a']).is_err());
    }
}
