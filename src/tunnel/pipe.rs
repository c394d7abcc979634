//! 内存管道形式的底层协议，供各层单元测试使用
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{BoxConn, SharedPacketConn, TunnelClient, TunnelKind, TunnelServer};
use crate::common::Address;
use crate::error::{Result, TunnelError};

/// 每次拨号创建一对 duplex 流，另一端交给 `accept_conn`
pub(crate) struct Pipe {
    tx: mpsc::Sender<BoxConn>,
    rx: Mutex<mpsc::Receiver<BoxConn>>,
    dialed: AtomicUsize,
}

impl Pipe {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            dialed: AtomicUsize::new(0),
        })
    }

    pub(crate) fn dialed(&self) -> usize {
        self.dialed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelClient for Pipe {
    async fn dial_conn(&self, _addr: Option<&Address>, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        self.tx
            .send(Box::new(b))
            .await
            .map_err(|_| TunnelError::Cancelled)?;
        self.dialed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(a))
    }

    async fn dial_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("pipe packets"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TunnelServer for Pipe {
    async fn accept_conn(&self, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        self.rx.lock().await.recv().await.ok_or(TunnelError::Cancelled)
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("pipe packets"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
