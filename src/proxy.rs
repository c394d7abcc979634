//! 代理引擎：由配置构建入口协议树与出口协议栈，并在两者之间转发连接与数据报
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::relay;
use crate::config::{Config, RunType};
use crate::error::{Result, TunnelError};
use crate::trojan::MAX_PACKET_SIZE;
use crate::tunnel::{
    build_client_stack, BoxConn, SharedPacketConn, StackTree, TunnelClient, TunnelContext,
    TunnelRegistry, TunnelServer,
};

/// 客户端出口协议栈（自底向上）
pub fn client_stack(config: &Config) -> Vec<&'static str> {
    let mut names = vec!["TRANSPORT"];
    if config.tls.enabled {
        names.push("TLS");
    }
    if config.websocket.enabled {
        names.push("WEBSOCKET");
    }
    names.push("TROJAN");
    if config.mux.enabled {
        names.extend(["MUX", "SIMPLESOCKS"]);
    }
    if config.router.enabled {
        names.push("ROUTER");
    }
    names
}

/// 服务端入口协议树的全部路径
///
/// 原始 Trojan 与 Mux 子流总是同时接受，由客户端决定是否复用。
pub fn server_paths(config: &Config) -> Vec<Vec<&'static str>> {
    let mut bases = Vec::new();
    let mut base = vec!["TRANSPORT"];
    if config.tls.enabled {
        base.push("TLS");
    }
    if config.websocket.enabled {
        let mut ws = base.clone();
        ws.push("WEBSOCKET");
        bases.push(ws);
    }
    bases.insert(0, base);

    let mut paths = Vec::new();
    for base in bases {
        let mut trojan = base;
        trojan.push("TROJAN");
        let mut mux = trojan.clone();
        mux.extend(["MUX", "SIMPLESOCKS"]);
        paths.push(trojan);
        paths.push(mux);
    }
    paths
}

/// 服务端出口协议栈
pub fn server_sink(config: &Config) -> Vec<&'static str> {
    if config.router.enabled {
        vec!["FREEDOM", "ROUTER"]
    } else {
        vec!["FREEDOM"]
    }
}

pub struct Proxy {
    sources: Vec<Arc<dyn TunnelServer>>,
    servers: Vec<Arc<dyn TunnelServer>>,
    sink: Arc<dyn TunnelClient>,
    cancel: CancellationToken,
}

impl Proxy {
    /// 组装入口与出口，监听器在此时已开始接受连接
    pub async fn from_config(config: Config, cancel: CancellationToken) -> Result<Self> {
        let registry = TunnelRegistry::with_defaults();
        let run_type = config.run_type;
        let ctx = TunnelContext::new(Arc::new(config), cancel.child_token());

        let (paths, sink_names): (Vec<Vec<&str>>, Vec<&str>) = match run_type {
            RunType::Client => (
                vec![vec!["ADAPTER", "SOCKS"], vec!["ADAPTER", "HTTP"]],
                client_stack(&ctx.config),
            ),
            RunType::Server => (server_paths(&ctx.config), server_sink(&ctx.config)),
        };
        let root = paths
            .first()
            .and_then(|path| path.first())
            .ok_or_else(|| TunnelError::config_error("no inbound stack"))?;

        let mut tree = StackTree::new(&registry, ctx.clone(), root).await?;
        for path in &paths {
            tree.build_path(path).await?;
            debug!("Inbound path {}", path.join(" -> "));
        }
        let sink = build_client_stack(&registry, &ctx, &sink_names).await?;
        info!(
            "Proxy ready as {}: {} inbound endpoint(s), outbound {}",
            run_type,
            tree.endpoints().len(),
            sink_names.join(" -> ")
        );

        Ok(Self::new(tree.endpoints(), tree.servers(), sink, cancel))
    }

    /// `sources` 中的每个服务端都会被轮询，`servers` 为退出时需要关闭的全部服务端
    pub fn new(
        sources: Vec<Arc<dyn TunnelServer>>,
        servers: Vec<Arc<dyn TunnelServer>>,
        sink: Arc<dyn TunnelClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sources,
            servers,
            sink,
            cancel,
        }
    }

    /// 运行直到取消
    pub async fn run(&self) -> Result<()> {
        for source in &self.sources {
            tokio::spawn(conn_loop(
                source.clone(),
                self.sink.clone(),
                self.cancel.clone(),
            ));
            tokio::spawn(packet_loop(
                source.clone(),
                self.sink.clone(),
                self.cancel.clone(),
            ));
        }
        self.cancel.cancelled().await;
        info!("Proxy shutting down");
        self.close().await
    }

    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        for server in &self.servers {
            if let Err(e) = server.close().await {
                debug!("Failed to close inbound layer: {}", e);
            }
        }
        self.sink.close().await
    }
}

/// 入口不再产生连接时返回 true
fn is_terminal(e: &TunnelError) -> bool {
    e.is_cancelled() || matches!(e, TunnelError::NotSupported(_))
}

async fn conn_loop(
    source: Arc<dyn TunnelServer>,
    sink: Arc<dyn TunnelClient>,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.accept_conn(None) => match result {
                Ok(conn) => conn,
                Err(e) if is_terminal(&e) => break,
                Err(e) => {
                    debug!("Inbound accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let sink = sink.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = forward_conn(conn, sink) => {}
            }
        });
    }
    debug!("Connection loop stopped");
}

async fn forward_conn(inbound: BoxConn, sink: Arc<dyn TunnelClient>) {
    let Some(metadata) = inbound.metadata().cloned() else {
        warn!("Inbound connection carries no destination, dropping");
        return;
    };
    let outbound = match sink.dial_conn(Some(&metadata.address), None).await {
        Ok(conn) => conn,
        Err(TunnelError::Blocked(addr)) => {
            info!("Blocked connection to {}", addr);
            return;
        }
        Err(e) => {
            warn!("Failed to dial {}: {}", metadata.address, e);
            return;
        }
    };
    info!("Relaying connection to {}", metadata.address);
    match relay(inbound, outbound).await {
        Ok((up, down)) => debug!(
            "Relay to {} finished ({} up, {} down)",
            metadata.address, up, down
        ),
        Err(e) => debug!("Relay to {} ended: {}", metadata.address, e),
    }
}

async fn packet_loop(
    source: Arc<dyn TunnelServer>,
    sink: Arc<dyn TunnelClient>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.accept_packet(None) => match result {
                Ok(packet) => packet,
                Err(e) if is_terminal(&e) => break,
                Err(e) => {
                    debug!("Inbound packet accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let sink = sink.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outbound = match sink.dial_packet(None).await {
                Ok(outbound) => outbound,
                Err(e) => {
                    warn!("Failed to open outbound packet connection: {}", e);
                    let _ = packet.close().await;
                    return;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = copy_packets(&packet, &outbound) => {}
                _ = copy_packets(&outbound, &packet) => {}
            }
            let _ = packet.close().await;
            let _ = outbound.close().await;
            debug!("Packet relay finished");
        });
    }
    debug!("Packet loop stopped");
}

/// 从 `from` 读取数据报并按原元数据写入 `to`，任一端出错时返回
async fn copy_packets(from: &SharedPacketConn, to: &SharedPacketConn) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, metadata) = match from.read_with_metadata(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                debug!("Packet read ended: {}", e);
                return;
            }
        };
        if let Err(e) = to.write_with_metadata(&buf[..n], &metadata).await {
            debug!("Packet write to {} failed: {}", metadata.address, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Command, Metadata, MetadataConn};
    use crate::freedom::FreedomClient;
    use crate::tunnel::{PacketConn, TunnelKind};
    use crate::config::TcpConfig;
    use async_trait::async_trait;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::sync::{mpsc, Mutex};

    fn parse(content: &str) -> Config {
        toml::from_str(content).unwrap()
    }

    const BASE: &str = "local_port = 1\nremote_addr = \"127.0.0.1\"\nremote_port = 2\npassword = [\"p\"]\n";

    #[test]
    fn test_client_stack_layout() {
        let config = parse(BASE);
        assert_eq!(client_stack(&config), ["TRANSPORT", "TLS", "TROJAN"]);

        let config = parse(&format!(
            "{}[websocket]\nenabled = true\n[mux]\nenabled = true\n[router]\nenabled = true\n",
            BASE
        ));
        assert_eq!(
            client_stack(&config),
            ["TRANSPORT", "TLS", "WEBSOCKET", "TROJAN", "MUX", "SIMPLESOCKS", "ROUTER"]
        );
    }

    #[test]
    fn test_server_paths() {
        let config = parse(&format!("{}[tls]\nenabled = false\n", BASE));
        assert_eq!(
            server_paths(&config),
            vec![
                vec!["TRANSPORT", "TROJAN"],
                vec!["TRANSPORT", "TROJAN", "MUX", "SIMPLESOCKS"],
            ]
        );

        let config = parse(&format!("{}[websocket]\nenabled = true\n", BASE));
        let paths = server_paths(&config);
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[2], ["TRANSPORT", "TLS", "WEBSOCKET", "TROJAN"]);
        assert_eq!(server_sink(&config), ["FREEDOM"]);
    }

    /// 由测试直接投递连接与数据报的入口
    struct Inbound {
        conns: Mutex<mpsc::Receiver<BoxConn>>,
        packets: Mutex<mpsc::Receiver<SharedPacketConn>>,
    }

    #[async_trait]
    impl TunnelServer for Inbound {
        async fn accept_conn(&self, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
            self.conns.lock().await.recv().await.ok_or(TunnelError::Cancelled)
        }

        async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
            self.packets.lock().await.recv().await.ok_or(TunnelError::Cancelled)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// 由 mpsc 承载的数据报连接，`peer` 侧可读写对应的数据报
    struct ChannelPacketConn {
        rx: Mutex<mpsc::Receiver<(Vec<u8>, Metadata)>>,
        tx: mpsc::Sender<(Vec<u8>, Metadata)>,
    }

    #[async_trait]
    impl PacketConn for ChannelPacketConn {
        async fn read_with_metadata(&self, buf: &mut [u8]) -> io::Result<(usize, Metadata)> {
            let (data, meta) = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            buf[..data.len()].copy_from_slice(&data);
            Ok((data.len(), meta))
        }

        async fn write_with_metadata(&self, buf: &[u8], metadata: &Metadata) -> io::Result<usize> {
            self.tx
                .send((buf.to_vec(), metadata.clone()))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn test_relays_conns_and_packets_to_sink() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });
        let udp_echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp_echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = udp_echo.recv_from(&mut buf).await.unwrap();
            udp_echo.send_to(&buf[..n], from).await.unwrap();
        });

        let (conn_tx, conn_rx) = mpsc::channel(4);
        let (packet_tx, packet_rx) = mpsc::channel(4);
        let inbound: Arc<dyn TunnelServer> = Arc::new(Inbound {
            conns: Mutex::new(conn_rx),
            packets: Mutex::new(packet_rx),
        });
        let cancel = CancellationToken::new();
        let proxy = Arc::new(Proxy::new(
            vec![inbound.clone()],
            vec![inbound],
            Arc::new(FreedomClient::new(TcpConfig::default())),
            cancel.clone(),
        ));
        let task = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run().await })
        };

        let (mut local, remote) = tokio::io::duplex(1024);
        let meta = Metadata::connect(Address::from_socket_addr(echo_addr));
        conn_tx
            .send(Box::new(MetadataConn::new(remote, meta)))
            .await
            .unwrap();
        local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let (to_proxy, proxy_rx) = mpsc::channel(4);
        let (proxy_tx, mut from_proxy) = mpsc::channel(4);
        packet_tx
            .send(Arc::new(ChannelPacketConn {
                rx: Mutex::new(proxy_rx),
                tx: proxy_tx,
            }))
            .await
            .unwrap();
        let dst = Metadata::new(Command::Associate, Address::from_socket_addr(udp_addr));
        to_proxy.send((b"dgram".to_vec(), dst.clone())).await.unwrap();
        let (data, from) = tokio::time::timeout(Duration::from_secs(5), from_proxy.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"dgram");
        assert_eq!(from.address, dst.address);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_conn_without_destination_dropped() {
        let (conn_tx, conn_rx) = mpsc::channel(4);
        let (_packet_tx, packet_rx) = mpsc::channel(4);
        let inbound: Arc<dyn TunnelServer> = Arc::new(Inbound {
            conns: Mutex::new(conn_rx),
            packets: Mutex::new(packet_rx),
        });
        let cancel = CancellationToken::new();
        let proxy = Arc::new(Proxy::new(
            vec![inbound],
            vec![],
            Arc::new(FreedomClient::new(TcpConfig::default())),
            cancel.clone(),
        ));
        let task = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run().await })
        };

        let (mut local, remote) = tokio::io::duplex(1024);
        conn_tx.send(Box::new(remote)).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), local.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
