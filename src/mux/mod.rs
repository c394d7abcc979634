//! 基于 yamux 的连接复用层
//!
//! 客户端把多个逻辑连接复用到少量经过 Trojan 认证的底层连接上，
//! 服务端把每个 Mux 命令的连接拆回子流。
mod client;
mod server;
mod session;
mod sticky;

pub use client::MuxClient;
pub use server::MuxServer;
pub use session::{MuxSession, MuxStream};
pub use sticky::{FrameHeader, StickyConn, FRAME_HEADER_LEN, MAX_PADDING};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::tunnel::{missing_underlay, Tunnel, TunnelClient, TunnelContext, TunnelKind, TunnelServer};

pub struct MuxTunnel;

#[async_trait]
impl Tunnel for MuxTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Mux
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Mux))?;
        let mux = &ctx.config.mux;
        Ok(Arc::new(MuxClient::new(
            underlay,
            mux.concurrency,
            mux.idle_timeout(),
            ctx.cancel.child_token(),
        )))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Mux))?;
        Ok(Arc::new(MuxServer::new(underlay, ctx.cancel.child_token())))
    }
}
