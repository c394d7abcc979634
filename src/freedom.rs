//! 直连出站
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::{Address, Command, Metadata};
use crate::config::TcpConfig;
use crate::error::{Result, TunnelError};
use crate::transport::connect_tcp;
use crate::tunnel::{
    BoxConn, PacketConn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext, TunnelKind,
    TunnelServer,
};

/// 直接连接目标地址的客户端
pub struct FreedomClient {
    tcp: TcpConfig,
}

impl FreedomClient {
    pub fn new(tcp: TcpConfig) -> Self {
        Self { tcp }
    }
}

#[async_trait]
impl TunnelClient for FreedomClient {
    async fn dial_conn(&self, addr: Option<&Address>, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let addr = addr.ok_or_else(|| TunnelError::protocol_error("freedom requires a destination"))?;
        let target = addr
            .to_socket_addr()
            .await
            .map_err(|e| TunnelError::connection_failed(addr.to_string(), e))?;
        let stream = connect_tcp(&target.to_string(), &self.tcp).await?;
        debug!("Freedom connected to {} ({})", addr, target);
        Ok(Box::new(stream))
    }

    async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Ok(Arc::new(FreedomPacketConn::bind().await?))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 直连 UDP，按每个数据报的元数据收发
pub struct FreedomPacketConn {
    v4: UdpSocket,
    v6: Option<UdpSocket>,
}

impl FreedomPacketConn {
    pub async fn bind() -> io::Result<Self> {
        let v4 = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        // 没有 IPv6 的环境下只使用 IPv4
        let v6 = UdpSocket::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))).await.ok();
        Ok(Self { v4, v6 })
    }
}

#[async_trait]
impl PacketConn for FreedomPacketConn {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> io::Result<(usize, Metadata)> {
        let (n, from) = match &self.v6 {
            Some(v6) => {
                let mut buf6 = vec![0u8; buf.len()];
                tokio::select! {
                    r = self.v4.recv_from(buf) => r?,
                    r = v6.recv_from(&mut buf6) => {
                        let (n, from) = r?;
                        buf[..n].copy_from_slice(&buf6[..n]);
                        (n, from)
                    }
                }
            }
            None => self.v4.recv_from(buf).await?,
        };
        Ok((n, Metadata::new(Command::Associate, Address::from_socket_addr(from))))
    }

    async fn write_with_metadata(&self, buf: &[u8], metadata: &Metadata) -> io::Result<usize> {
        let target = metadata.address.to_socket_addr().await?;
        match (&self.v6, target) {
            (Some(v6), SocketAddr::V6(_)) => v6.send_to(buf, target).await,
            (None, SocketAddr::V6(_)) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPv6 is not available",
            )),
            (_, SocketAddr::V4(_)) => self.v4.send_to(buf, target).await,
        }
    }
}

pub struct FreedomTunnel;

#[async_trait]
impl Tunnel for FreedomTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Freedom
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        Ok(Arc::new(FreedomClient::new(ctx.config.tcp.clone())))
    }

    async fn new_server(
        &self,
        _ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        Err(TunnelError::not_supported("freedom has no server side"))
    }
}
