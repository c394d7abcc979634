//! 协议嗅探分发器
//!
//! 一个监听器上承载多种上层协议时，后台任务对每个连接预读几个字节进行分类，
//! 再把未消费的连接放入对应 overlay 的有界队列；`accept` 按 overlay 提示取连接。
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::tunnel::TunnelKind;

/// 每个 overlay 队列的容量
pub const QUEUE_CAPACITY: usize = 32;

/// 按 overlay 分流的连接队列
pub struct Dispatcher<T> {
    senders: HashMap<TunnelKind, mpsc::Sender<T>>,
    receivers: HashMap<TunnelKind, Mutex<mpsc::Receiver<T>>>,
    default: TunnelKind,
    cancel: CancellationToken,
}

impl<T: Send> Dispatcher<T> {
    /// 为 `kinds` 中每种 overlay 建立队列，`default` 必须在其中
    pub fn new(kinds: &[TunnelKind], default: TunnelKind, cancel: CancellationToken) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for &kind in kinds.iter().chain(std::iter::once(&default)) {
            if senders.contains_key(&kind) {
                continue;
            }
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            senders.insert(kind, tx);
            receivers.insert(kind, Mutex::new(rx));
        }
        Self {
            senders,
            receivers,
            default,
            cancel,
        }
    }

    pub fn default_kind(&self) -> TunnelKind {
        self.default
    }

    pub fn handles(&self, kind: TunnelKind) -> bool {
        self.senders.contains_key(&kind)
    }

    /// 放入对应队列；未知 overlay 进入默认队列。队列满时等待，取消时返回 false
    pub async fn dispatch(&self, kind: TunnelKind, item: T) -> bool {
        let kind = if self.handles(kind) { kind } else { self.default };
        let Some(tx) = self.senders.get(&kind) else {
            return false;
        };
        tokio::select! {
            result = tx.send(item) => result.is_ok(),
            _ = self.cancel.cancelled() => {
                debug!("Dispatcher cancelled while queueing {} connection", kind);
                false
            }
        }
    }

    /// 取出一个 overlay 的连接，`None` 表示默认 overlay
    pub async fn accept(&self, overlay: Option<TunnelKind>) -> Result<T> {
        let kind = overlay.unwrap_or(self.default);
        let rx = self.receivers.get(&kind).ok_or_else(|| {
            TunnelError::not_supported(format!("no {} connections on this layer", kind))
        })?;
        let mut rx = tokio::select! {
            guard = rx.lock() => guard,
            _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
        };
        tokio::select! {
            item = rx.recv() => item.ok_or(TunnelError::Cancelled),
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
        }
    }
}

/// 预读的内容是否像 HTTP 请求（用于区分 WebSocket 升级与原始 Trojan 流）
pub fn looks_like_http_get(head: &[u8]) -> bool {
    head.starts_with(b"GET ")
}

/// TLS 握手记录的首字节
pub const TLS_HANDSHAKE: u8 = 0x16;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_routes_by_kind() {
        let d = Dispatcher::new(
            &[TunnelKind::Trojan, TunnelKind::Websocket],
            TunnelKind::Trojan,
            CancellationToken::new(),
        );
        assert!(d.dispatch(TunnelKind::Websocket, "ws").await);
        assert!(d.dispatch(TunnelKind::Trojan, "raw").await);
        assert!(d.dispatch(TunnelKind::Socks, "garbage").await);

        assert_eq!(d.accept(Some(TunnelKind::Websocket)).await.unwrap(), "ws");
        assert_eq!(d.accept(None).await.unwrap(), "raw");
        assert_eq!(d.accept(Some(TunnelKind::Trojan)).await.unwrap(), "garbage");
    }

    #[tokio::test]
    async fn test_wrong_overlay_blocks_until_cancel() {
        let cancel = CancellationToken::new();
        let d = Arc::new(Dispatcher::<u32>::new(
            &[TunnelKind::Trojan, TunnelKind::Websocket],
            TunnelKind::Trojan,
            cancel.clone(),
        ));
        d.dispatch(TunnelKind::Trojan, 1).await;

        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.accept(Some(TunnelKind::Websocket)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TunnelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unsupported_overlay() {
        let d = Dispatcher::<u8>::new(&[], TunnelKind::Trojan, CancellationToken::new());
        assert!(d.accept(Some(TunnelKind::Mux)).await.is_err());
        assert!(d.handles(TunnelKind::Trojan));
    }

    #[test]
    fn test_http_detection() {
        assert!(looks_like_http_get(b"GET / HTTP/1.1\r\n"));
        assert!(!looks_like_http_get(b"e3b0c442"));
    }
}
