use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::codec::{encode_request, StreamPacketConn};
use crate::common::{Address, Command, HeaderConn, Metadata};
use crate::error::{Result, TunnelError};
use crate::tunnel::{BoxConn, SharedPacketConn, TunnelClient, TunnelKind};

/// Trojan 客户端
pub struct TrojanClient {
    underlay: Arc<dyn TunnelClient>,
    hash: String,
}

impl TrojanClient {
    pub fn new(underlay: Arc<dyn TunnelClient>, hash: String) -> Self {
        Self { underlay, hash }
    }

    async fn dial_with(&self, metadata: Metadata) -> Result<BoxConn> {
        let inner = self
            .underlay
            .dial_conn(None, Some(TunnelKind::Trojan))
            .await?;
        let header = encode_request(&self.hash, &metadata)?;
        debug!("Trojan dial {}", metadata);
        Ok(Box::new(HeaderConn::new(inner, header, Some(metadata))))
    }
}

#[async_trait]
impl TunnelClient for TrojanClient {
    async fn dial_conn(&self, addr: Option<&Address>, overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let metadata = match overlay {
            Some(TunnelKind::Mux) => Metadata::mux(),
            _ => {
                let addr = addr.ok_or_else(|| {
                    TunnelError::protocol_error("trojan connect requires a destination")
                })?;
                Metadata::connect(addr.clone())
            }
        };
        self.dial_with(metadata).await
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
