//! Simplesocks：Mux 子流内使用的精简请求头 `CMD | ATYP | ADDR | PORT`，之后直接是负载
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{handshake_timeout, Address, Command, HeaderConn, Metadata, MetadataConn};
use crate::error::{Result, TunnelError};
use crate::sniff::Dispatcher;
use crate::trojan::StreamPacketConn;
use crate::tunnel::{
    missing_underlay, BoxConn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext,
    TunnelKind, TunnelServer,
};

fn encode_header(metadata: &Metadata) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(1 + metadata.address.encoded_len());
    metadata.write_to(&mut header)?;
    Ok(header)
}

pub struct SimplesocksClient {
    underlay: Arc<dyn TunnelClient>,
}

impl SimplesocksClient {
    pub fn new(underlay: Arc<dyn TunnelClient>) -> Self {
        Self { underlay }
    }

    async fn dial_with(&self, metadata: Metadata) -> Result<BoxConn> {
        let inner = self
            .underlay
            .dial_conn(None, Some(TunnelKind::Simplesocks))
            .await?;
        let header = encode_header(&metadata)?;
        debug!("Simplesocks dial {}", metadata);
        Ok(Box::new(HeaderConn::new(inner, header, Some(metadata))))
    }
}

#[async_trait]
impl TunnelClient for SimplesocksClient {
    async fn dial_conn(&self, addr: Option<&Address>, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let addr = addr
            .ok_or_else(|| TunnelError::protocol_error("simplesocks connect requires a destination"))?;
        self.dial_with(Metadata::connect(addr.clone())).await
    }

    async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        let placeholder = Address::ip_addr([0, 0, 0, 0].into(), 0);
        let conn = self
            .dial_with(Metadata::new(Command::Associate, placeholder))
            .await?;
        Ok(Arc::new(StreamPacketConn::new(conn)))
    }

    async fn close(&self) -> Result<()> {
        self.underlay.close().await
    }
}

pub struct SimplesocksServer {
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    packets: Arc<Dispatcher<SharedPacketConn>>,
    cancel: CancellationToken,
}

impl SimplesocksServer {
    pub fn new(underlay: Arc<dyn TunnelServer>, cancel: CancellationToken) -> Self {
        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Simplesocks],
            TunnelKind::Simplesocks,
            cancel.clone(),
        ));
        let packets = Arc::new(Dispatcher::new(
            &[TunnelKind::Simplesocks],
            TunnelKind::Simplesocks,
            cancel.clone(),
        ));
        tokio::spawn(accept_loop(
            underlay.clone(),
            conns.clone(),
            packets.clone(),
            cancel.clone(),
        ));
        Self {
            underlay,
            conns,
            packets,
            cancel,
        }
    }
}

async fn accept_loop(
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    packets: Arc<Dispatcher<SharedPacketConn>>,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = underlay.accept_conn(Some(TunnelKind::Simplesocks)) => match result {
                Ok(conn) => conn,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    debug!("Simplesocks underlay accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let conns = conns.clone();
        let packets = packets.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(conn, &conns, &packets).await {
                debug!("Simplesocks stream dropped: {}", e);
            }
        });
    }
    debug!("Simplesocks accept loop stopped");
}

async fn handle(
    mut conn: BoxConn,
    conns: &Dispatcher<BoxConn>,
    packets: &Dispatcher<SharedPacketConn>,
) -> Result<()> {
    let timeout = handshake_timeout();
    let metadata = tokio::time::timeout(timeout, Metadata::read_from(&mut conn))
        .await
        .map_err(|_| TunnelError::timeout(timeout))??;
    debug!("Simplesocks {}", metadata);
    match metadata.command {
        Command::Connect => {
            conns
                .dispatch(
                    TunnelKind::Simplesocks,
                    Box::new(MetadataConn::new(conn, metadata)),
                )
                .await;
        }
        Command::Associate => {
            let packet: SharedPacketConn = Arc::new(StreamPacketConn::new(conn));
            packets.dispatch(TunnelKind::Simplesocks, packet).await;
        }
        Command::Mux => {
            return Err(TunnelError::protocol_error("nested mux is not supported"));
        }
    }
    Ok(())
}

#[async_trait]
impl TunnelServer for SimplesocksServer {
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

pub struct SimplesocksTunnel;

#[async_trait]
impl Tunnel for SimplesocksTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Simplesocks
    }

    async fn new_client(
        &self,
        _ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Simplesocks))?;
        Ok(Arc::new(SimplesocksClient::new(underlay)))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Simplesocks))?;
        Ok(Arc::new(SimplesocksServer::new(underlay, ctx.cancel.child_token())))
    }
}
