use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{TunnelClient, TunnelContext, TunnelRegistry, TunnelServer};
use crate::error::{Result, TunnelError};

/// 按名称列表自底向上构建客户端协议栈
pub async fn build_client_stack(
    registry: &TunnelRegistry,
    ctx: &TunnelContext,
    names: &[&str],
) -> Result<Arc<dyn TunnelClient>> {
    let mut current: Option<Arc<dyn TunnelClient>> = None;
    for name in names {
        let tunnel = registry.get(name)?;
        debug!("Building client layer {}", tunnel.name());
        current = Some(tunnel.new_client(ctx, current).await?);
    }
    current.ok_or_else(|| TunnelError::config_error("empty client stack"))
}

/// 按名称列表自底向上构建服务端协议栈
pub async fn build_server_stack(
    registry: &TunnelRegistry,
    ctx: &TunnelContext,
    names: &[&str],
) -> Result<Arc<dyn TunnelServer>> {
    let mut current: Option<Arc<dyn TunnelServer>> = None;
    for name in names {
        let tunnel = registry.get(name)?;
        debug!("Building server layer {}", tunnel.name());
        current = Some(tunnel.new_server(ctx, current).await?);
    }
    current.ok_or_else(|| TunnelError::config_error("empty server stack"))
}

struct Node {
    name: String,
    server: Arc<dyn TunnelServer>,
    children: HashMap<String, usize>,
    endpoint: bool,
}

/// 分支服务端协议栈
///
/// 节点存放在数组中并以下标引用，同一父节点下同名的子节点只构建一次，
/// 因此多条路径可以共享同一个监听器。
pub struct StackTree<'a> {
    registry: &'a TunnelRegistry,
    ctx: TunnelContext,
    nodes: Vec<Node>,
}

impl<'a> StackTree<'a> {
    /// 以底层协议构建根节点
    pub async fn new(registry: &'a TunnelRegistry, ctx: TunnelContext, root: &str) -> Result<Self> {
        let tunnel = registry.get(root)?;
        let server = tunnel.new_server(&ctx, None).await?;
        Ok(Self {
            registry,
            ctx,
            nodes: vec![Node {
                name: tunnel.name().to_string(),
                server,
                children: HashMap::new(),
                endpoint: false,
            }],
        })
    }

    pub fn root(&self) -> usize {
        0
    }

    /// 在 `parent` 下构建名为 `name` 的子节点，已存在则直接复用
    pub async fn build_next(&mut self, parent: usize, name: &str) -> Result<usize> {
        let tunnel = self.registry.get(name)?;
        let key = tunnel.name().to_string();
        let parent_node = self
            .nodes
            .get(parent)
            .ok_or_else(|| TunnelError::config_error(format!("no stack node #{}", parent)))?;
        if let Some(&existing) = parent_node.children.get(&key) {
            return Ok(existing);
        }

        debug!("Building server layer {} on top of {}", key, parent_node.name);
        let server = tunnel
            .new_server(&self.ctx, Some(parent_node.server.clone()))
            .await?;
        let index = self.nodes.len();
        self.nodes.push(Node {
            name: key.clone(),
            server,
            children: HashMap::new(),
            endpoint: false,
        });
        self.nodes[parent].children.insert(key, index);
        Ok(index)
    }

    /// 从根节点开始沿 `names` 构建一条路径，并把末端标记为端点
    ///
    /// `names` 的第一个元素必须是根节点的名称。
    pub async fn build_path(&mut self, names: &[&str]) -> Result<usize> {
        let (first, rest) = names
            .split_first()
            .ok_or_else(|| TunnelError::config_error("empty stack path"))?;
        if !self.nodes[0].name.eq_ignore_ascii_case(first) {
            return Err(TunnelError::config_error(format!(
                "stack path must start at {}, got {}",
                self.nodes[0].name, first
            )));
        }
        let mut current = self.root();
        for name in rest {
            current = self.build_next(current, name).await?;
        }
        self.nodes[current].endpoint = true;
        Ok(current)
    }

    pub fn server(&self, index: usize) -> Option<Arc<dyn TunnelServer>> {
        self.nodes.get(index).map(|node| node.server.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 需要上层轮询的全部端点（去重）
    pub fn endpoints(&self) -> Vec<Arc<dyn TunnelServer>> {
        let mut result: Vec<Arc<dyn TunnelServer>> = Vec::new();
        for node in &self.nodes {
            if node.endpoint && !result.iter().any(|s| Arc::ptr_eq(s, &node.server)) {
                result.push(node.server.clone());
            }
        }
        result
    }

    /// 所有已构建的服务端（自顶向下的关闭顺序）
    pub fn servers(&self) -> Vec<Arc<dyn TunnelServer>> {
        self.nodes.iter().rev().map(|node| node.server.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::config::Config;
    use crate::tunnel::{BoxConn, SharedPacketConn, Tunnel, TunnelKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Layer {
        depth: usize,
    }

    #[async_trait]
    impl TunnelServer for Layer {
        async fn accept_conn(&self, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
            Err(TunnelError::not_supported("test layer"))
        }

        async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
            Err(TunnelError::not_supported("test layer"))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TunnelClient for Layer {
        async fn dial_conn(
            &self,
            _addr: Option<&Address>,
            _overlay: Option<TunnelKind>,
        ) -> Result<BoxConn> {
            Err(TunnelError::not_supported("test layer"))
        }

        async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
            Err(TunnelError::not_supported("test layer"))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct CountingTunnel {
        name: &'static str,
        built: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tunnel for CountingTunnel {
        fn kind(&self) -> TunnelKind {
            TunnelKind::Transport
        }

        fn name(&self) -> &'static str {
            self.name
        }

        async fn new_client(
            &self,
            _ctx: &TunnelContext,
            underlay: Option<Arc<dyn TunnelClient>>,
        ) -> Result<Arc<dyn TunnelClient>> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Layer {
                depth: usize::from(underlay.is_some()),
            }))
        }

        async fn new_server(
            &self,
            _ctx: &TunnelContext,
            underlay: Option<Arc<dyn TunnelServer>>,
        ) -> Result<Arc<dyn TunnelServer>> {
            self.built.fetch_add(1, Ordering::SeqCst);
            let layer = Layer {
                depth: usize::from(underlay.is_some()),
            };
            assert!(layer.depth <= 1);
            Ok(Arc::new(layer))
        }
    }

    fn setup() -> (TunnelRegistry, Arc<AtomicUsize>, TunnelContext) {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = TunnelRegistry::new();
        for name in ["A", "B", "C", "D"] {
            registry.register(Arc::new(CountingTunnel {
                name,
                built: built.clone(),
            }));
        }
        let config: Config = toml::from_str(
            "local_port = 1\nremote_addr = \"127.0.0.1\"\nremote_port = 2\npassword = [\"p\"]",
        )
        .unwrap();
        let ctx = TunnelContext::new(Arc::new(config), CancellationToken::new());
        (registry, built, ctx)
    }

    #[tokio::test]
    async fn test_linear_stack() {
        let (registry, built, ctx) = setup();
        build_client_stack(&registry, &ctx, &["A", "B", "C"])
            .await
            .unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 3);

        match build_server_stack(&registry, &ctx, &["A", "X"]).await {
            Err(TunnelError::UnknownTunnel(name)) => assert_eq!(name, "X"),
            _ => panic!("expected UnknownTunnel"),
        }
    }

    #[tokio::test]
    async fn test_tree_reuses_shared_prefix() {
        let (registry, built, ctx) = setup();
        let mut tree = StackTree::new(&registry, ctx, "A").await.unwrap();

        let c = tree.build_path(&["A", "B", "C"]).await.unwrap();
        let d = tree.build_path(&["A", "B", "D"]).await.unwrap();
        let c_again = tree.build_path(&["A", "B", "C"]).await.unwrap();

        assert_eq!(c, c_again);
        assert_ne!(c, d);
        // A, B, C, D
        assert_eq!(built.load(Ordering::SeqCst), 4);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.endpoints().len(), 2);
    }

    #[tokio::test]
    async fn test_tree_path_must_start_at_root() {
        let (registry, _, ctx) = setup();
        let mut tree = StackTree::new(&registry, ctx, "A").await.unwrap();
        assert!(tree.build_path(&["B", "C"]).await.is_err());
        assert!(tree.endpoints().is_empty());
    }
}
