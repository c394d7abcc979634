//! Trojan 协议层
//!
//! 请求头 `hex(SHA224(password)) CRLF cmd addr CRLF` 之后直接跟随负载。
//! 服务端认证失败时不断开连接，而是把收到的原始字节转交给真实的 HTTP 后端。
mod auth;
mod client;
mod codec;
mod server;

pub use auth::{password_hash, Authenticator, MemoryAuthenticator, MemoryUser, User};
pub use client::TrojanClient;
pub use codec::{encode_packet, encode_request, read_packet, StreamPacketConn, MAX_PACKET_SIZE};
pub use server::{InboundConn, TrojanServer};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Result, TunnelError};
use crate::tunnel::{missing_underlay, Tunnel, TunnelClient, TunnelContext, TunnelKind, TunnelServer};

/// 十六进制摘要长度
pub const HASH_LEN: usize = 56;

pub struct TrojanTunnel;

#[async_trait]
impl Tunnel for TrojanTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Trojan
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Trojan))?;
        let password = ctx
            .config
            .password
            .first()
            .ok_or_else(|| TunnelError::config_error("trojan client requires a password"))?;
        Ok(Arc::new(TrojanClient::new(underlay, password_hash(password))))
    }

    async fn new_server(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Trojan))?;
        Ok(Arc::new(TrojanServer::new(
            underlay,
            ctx.authenticator.clone(),
            ctx.redirector.clone(),
            ctx.config.remote_address(),
            ctx.config.trojan.auth_timeout(),
            ctx.cancel.child_token(),
        )))
    }
}
