use std::collections::HashMap;
use std::sync::Arc;

use super::{Tunnel, TunnelKind};
use crate::adapter::{AdapterTunnel, HttpTunnel, SocksTunnel};
use crate::error::{Result, TunnelError};
use crate::freedom::FreedomTunnel;
use crate::mux::MuxTunnel;
use crate::router::RouterTunnel;
use crate::simplesocks::SimplesocksTunnel;
use crate::transport::{TlsTunnel, TransportTunnel, WebsocketTunnel};
use crate::trojan::TrojanTunnel;

/// 名称到协议层工厂的注册表
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: HashMap<&'static str, Arc<dyn Tunnel>>,
}

impl TunnelRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置协议层
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TransportTunnel));
        registry.register(Arc::new(TlsTunnel));
        registry.register(Arc::new(WebsocketTunnel));
        registry.register(Arc::new(TrojanTunnel));
        registry.register(Arc::new(MuxTunnel));
        registry.register(Arc::new(SimplesocksTunnel));
        registry.register(Arc::new(RouterTunnel));
        registry.register(Arc::new(FreedomTunnel));
        registry.register(Arc::new(AdapterTunnel));
        registry.register(Arc::new(SocksTunnel));
        registry.register(Arc::new(HttpTunnel));
        registry
    }

    /// 注册协议层，同名时覆盖
    pub fn register(&mut self, tunnel: Arc<dyn Tunnel>) {
        self.tunnels.insert(tunnel.name(), tunnel);
    }

    /// 按名称查找协议层
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tunnel>> {
        self.tunnels
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, tunnel)| tunnel.clone())
            .ok_or_else(|| TunnelError::UnknownTunnel(name.to_string()))
    }

    pub fn get_kind(&self, kind: TunnelKind) -> Result<Arc<dyn Tunnel>> {
        self.get(kind.name())
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tunnels.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
