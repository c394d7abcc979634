//! 按目标地址选择代理、直连或拒绝的路由层
//!
//! 规则按 block、bypass、proxy 的顺序匹配，先命中者生效，全部未命中时使用默认策略。
mod geodata;
mod rules;

pub use geodata::{GeoData, TextGeoData};
pub use rules::{parse_cidr, DomainMatcher, RuleSet, RuleSpec};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{Address, Host, Metadata};
use crate::config::RouterConfig;
use crate::error::{Result, TunnelError};
use crate::freedom::FreedomClient;
use crate::trojan::MAX_PACKET_SIZE;
use crate::tunnel::{
    missing_underlay, BoxConn, PacketConn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext,
    TunnelKind, TunnelServer,
};

/// 路由策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    #[default]
    Proxy,
    Bypass,
    Block,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Proxy => write!(f, "proxy"),
            Policy::Bypass => write!(f, "bypass"),
            Policy::Block => write!(f, "block"),
        }
    }
}

/// 域名解析策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    /// 只按域名规则匹配，从不解析
    #[default]
    AsIs,
    /// 没有域名规则命中时解析并匹配 CIDR 规则
    IpIfNonMatch,
    /// 先解析并匹配 CIDR 规则，再匹配域名规则
    IpOnDemand,
}

/// 路由规则集合，构造后只读
#[derive(Debug, Clone, Default)]
pub struct Router {
    buckets: Vec<(Policy, RuleSet)>,
    default_policy: Policy,
    strategy: DomainStrategy,
}

impl Router {
    pub fn new(
        block: RuleSet,
        bypass: RuleSet,
        proxy: RuleSet,
        default_policy: Policy,
        strategy: DomainStrategy,
    ) -> Self {
        Self {
            buckets: vec![
                (Policy::Block, block),
                (Policy::Bypass, bypass),
                (Policy::Proxy, proxy),
            ],
            default_policy,
            strategy,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let geodata = TextGeoData::new(config.geodata_dir.clone());
        let router = Self::new(
            RuleSet::from_rules(&config.block, &geodata)?,
            RuleSet::from_rules(&config.bypass, &geodata)?,
            RuleSet::from_rules(&config.proxy, &geodata)?,
            config.default_policy,
            config.domain_strategy,
        );
        info!(
            "Router loaded, default policy {}, strategy {:?}",
            router.default_policy, router.strategy
        );
        Ok(router)
    }

    fn match_ip(&self, ip: IpAddr) -> Option<Policy> {
        self.buckets
            .iter()
            .find(|(_, rules)| rules.match_ip(ip))
            .map(|(policy, _)| *policy)
    }

    fn match_domain(&self, domain: &str) -> Option<Policy> {
        self.buckets
            .iter()
            .find(|(_, rules)| rules.match_domain(domain))
            .map(|(policy, _)| *policy)
    }

    fn has_cidrs(&self) -> bool {
        self.buckets.iter().any(|(_, rules)| rules.has_cidrs())
    }

    /// 决定目标地址的策略；域名解析失败不会中断匹配
    pub async fn route(&self, address: &Address) -> Policy {
        let domain = match &address.host {
            Host::Ipv4(_) | Host::Ipv6(_) => {
                let ip = address.ip();
                return ip.and_then(|ip| self.match_ip(ip)).unwrap_or(self.default_policy);
            }
            Host::Domain(domain) => domain.as_str(),
        };

        let policy = match self.strategy {
            DomainStrategy::AsIs => self.match_domain(domain),
            DomainStrategy::IpIfNonMatch => match self.match_domain(domain) {
                Some(policy) => Some(policy),
                None => self.resolve(address).await.and_then(|ip| self.match_ip(ip)),
            },
            DomainStrategy::IpOnDemand => {
                let ip = self.resolve(address).await;
                self.buckets
                    .iter()
                    .find(|(_, rules)| {
                        ip.is_some_and(|ip| rules.match_ip(ip)) || rules.match_domain(domain)
                    })
                    .map(|(policy, _)| *policy)
            }
        };
        policy.unwrap_or(self.default_policy)
    }

    async fn resolve(&self, address: &Address) -> Option<IpAddr> {
        if !self.has_cidrs() {
            return None;
        }
        match address.resolve().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("Router failed to resolve {}: {}", address, e);
                None
            }
        }
    }
}

/// 路由客户端：代理走下层，直连走 freedom，拒绝直接返回错误
pub struct RouterClient {
    underlay: Arc<dyn TunnelClient>,
    direct: Arc<dyn TunnelClient>,
    router: Arc<Router>,
    cancel: CancellationToken,
}

impl RouterClient {
    pub fn new(
        underlay: Arc<dyn TunnelClient>,
        direct: Arc<dyn TunnelClient>,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            underlay,
            direct,
            router,
            cancel,
        }
    }
}

#[async_trait]
impl TunnelClient for RouterClient {
    async fn dial_conn(&self, addr: Option<&Address>, overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let addr = addr.ok_or_else(|| TunnelError::protocol_error("router requires a destination"))?;
        let policy = self.router.route(addr).await;
        debug!("Route {} -> {}", addr, policy);
        match policy {
            Policy::Proxy => self.underlay.dial_conn(Some(addr), overlay).await,
            Policy::Bypass => self.direct.dial_conn(Some(addr), overlay).await,
            Policy::Block => Err(TunnelError::Blocked(addr.clone())),
        }
    }

    async fn dial_packet(&self, overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        let proxy = self.underlay.dial_packet(overlay).await?;
        let direct = self.direct.dial_packet(overlay).await?;
        Ok(Arc::new(RouterPacketConn::new(
            proxy,
            direct,
            self.router.clone(),
            self.cancel.child_token(),
        )))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.underlay.close().await
    }
}

/// 按数据报目标分流的数据报连接，两路回包合并读取
pub struct RouterPacketConn {
    proxy: SharedPacketConn,
    direct: SharedPacketConn,
    router: Arc<Router>,
    incoming: Mutex<mpsc::Receiver<(Vec<u8>, Metadata)>>,
    cancel: CancellationToken,
}

impl RouterPacketConn {
    pub fn new(
        proxy: SharedPacketConn,
        direct: SharedPacketConn,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        for source in [proxy.clone(), direct.clone()] {
            tokio::spawn(pump(source, tx.clone(), cancel.clone()));
        }
        Self {
            proxy,
            direct,
            router,
            incoming: Mutex::new(rx),
            cancel,
        }
    }
}

async fn pump(
    source: SharedPacketConn,
    tx: mpsc::Sender<(Vec<u8>, Metadata)>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, metadata) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.read_with_metadata(&mut buf) => match result {
                Ok(read) => read,
                Err(e) => {
                    debug!("Router packet source closed: {}", e);
                    break;
                }
            },
        };
        if tx.send((buf[..n].to_vec(), metadata)).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl PacketConn for RouterPacketConn {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> io::Result<(usize, Metadata)> {
        let (payload, metadata) = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, metadata))
    }

    async fn write_with_metadata(&self, buf: &[u8], metadata: &Metadata) -> io::Result<usize> {
        match self.router.route(&metadata.address).await {
            Policy::Proxy => self.proxy.write_with_metadata(buf, metadata).await,
            Policy::Bypass => self.direct.write_with_metadata(buf, metadata).await,
            Policy::Block => {
                debug!("Dropped datagram to blocked {}", metadata.address);
                Ok(buf.len())
            }
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.cancel.cancel();
        let _ = self.direct.close().await;
        self.proxy.close().await
    }
}

pub struct RouterTunnel;

#[async_trait]
impl Tunnel for RouterTunnel {
    fn kind(&self) -> TunnelKind {
        TunnelKind::Router
    }

    async fn new_client(
        &self,
        ctx: &TunnelContext,
        underlay: Option<Arc<dyn TunnelClient>>,
    ) -> Result<Arc<dyn TunnelClient>> {
        let underlay = underlay.ok_or_else(|| missing_underlay(TunnelKind::Router))?;
        let router = Router::from_config(&ctx.config.router)?;
        Ok(Arc::new(RouterClient::new(
            underlay,
            Arc::new(FreedomClient::new(ctx.config.tcp.clone())),
            Arc::new(router),
            ctx.cancel.child_token(),
        )))
    }

    async fn new_server(
        &self,
        _ctx: &TunnelContext,
        _underlay: Option<Arc<dyn TunnelServer>>,
    ) -> Result<Arc<dyn TunnelServer>> {
        Err(TunnelError::not_supported("router has no server side"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::pipe::Pipe;

    fn rules(list: &[&str]) -> RuleSet {
        let list: Vec<String> = list.iter().map(|s| s.to_string()).collect();
        RuleSet::from_rules(&list, &TextGeoData::default()).unwrap()
    }

    #[tokio::test]
    async fn test_precedence() {
        let router = Router::new(
            rules(&["domain:example.com"]),
            rules(&["domain:example.com", "domain:example.org"]),
            rules(&["domain:example.com", "domain:example.org", "domain:example.net"]),
            Policy::Bypass,
            DomainStrategy::AsIs,
        );
        assert_eq!(router.route(&Address::domain("a.example.com", 443)).await, Policy::Block);
        assert_eq!(router.route(&Address::domain("example.org", 443)).await, Policy::Bypass);
        assert_eq!(router.route(&Address::domain("example.net", 443)).await, Policy::Proxy);
        assert_eq!(router.route(&Address::domain("example.edu", 443)).await, Policy::Bypass);
    }

    #[tokio::test]
    async fn test_ip_rules() {
        let router = Router::new(
            rules(&["cidr:10.0.0.0/8"]),
            rules(&["geoip:private"]),
            RuleSet::default(),
            Policy::Proxy,
            DomainStrategy::AsIs,
        );
        assert_eq!(router.route(&Address::ip_addr("10.1.1.1".parse().unwrap(), 80)).await, Policy::Block);
        assert_eq!(router.route(&Address::ip_addr("192.168.1.1".parse().unwrap(), 80)).await, Policy::Bypass);
        assert_eq!(router.route(&Address::ip_addr("8.8.8.8".parse().unwrap(), 80)).await, Policy::Proxy);
        assert_eq!(router.route(&Address::ip_addr("::1".parse().unwrap(), 80)).await, Policy::Bypass);
    }

    #[tokio::test]
    async fn test_domain_strategies() {
        let build = |strategy| {
            Router::new(
                rules(&["cidr:127.0.0.0/8"]),
                rules(&["full:localhost"]),
                RuleSet::default(),
                Policy::Proxy,
                strategy,
            )
        };
        let localhost = Address::domain("localhost", 80);

        // 不解析：只看域名规则
        assert_eq!(build(DomainStrategy::AsIs).route(&localhost).await, Policy::Bypass);
        // 域名规则已命中，不再解析
        assert_eq!(build(DomainStrategy::IpIfNonMatch).route(&localhost).await, Policy::Bypass);

        // 未命中域名规则时才解析
        let unmatched = Router::new(
            rules(&["cidr:127.0.0.0/8", "cidr:::1"]),
            RuleSet::default(),
            RuleSet::default(),
            Policy::Proxy,
            DomainStrategy::IpIfNonMatch,
        );
        assert_eq!(unmatched.route(&Address::domain("localhost", 80)).await, Policy::Block);

        // 解析失败不影响结果
        let missing = Address::domain("does-not-exist.invalid", 80);
        assert_eq!(build(DomainStrategy::IpOnDemand).route(&missing).await, Policy::Proxy);
    }

    #[tokio::test]
    async fn test_block_returns_error() {
        let router = Router::new(
            rules(&["keyword:ads"]),
            RuleSet::default(),
            RuleSet::default(),
            Policy::Proxy,
            DomainStrategy::AsIs,
        );
        let pipe = Pipe::new();
        let client = RouterClient::new(
            pipe.clone(),
            Arc::new(FreedomClient::new(Default::default())),
            Arc::new(router),
            CancellationToken::new(),
        );

        let err = client
            .dial_conn(Some(&Address::domain("ads.example.com", 80)), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Blocked(_)));
        assert_eq!(pipe.dialed(), 0);

        client
            .dial_conn(Some(&Address::domain("example.com", 80)), None)
            .await
            .unwrap();
        assert_eq!(pipe.dialed(), 1);
    }
}
