use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yamux::Mode as YamuxMode;

use super::session::MuxSession;
use crate::error::{Result, TunnelError};
use crate::sniff::Dispatcher;
use crate::tunnel::{BoxConn, SharedPacketConn, TunnelKind, TunnelServer};

/// Mux 服务端：每个 Mux 命令的连接成为一个会话，子流汇入同一个接收队列
pub struct MuxServer {
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
}

impl MuxServer {
    pub fn new(underlay: Arc<dyn TunnelServer>, cancel: CancellationToken) -> Self {
        let conns = Arc::new(Dispatcher::new(
            &[TunnelKind::Simplesocks],
            TunnelKind::Simplesocks,
            cancel.clone(),
        ));
        tokio::spawn(accept_loop(underlay.clone(), conns.clone(), cancel.clone()));
        Self {
            underlay,
            conns,
            cancel,
        }
    }
}

async fn accept_loop(
    underlay: Arc<dyn TunnelServer>,
    conns: Arc<Dispatcher<BoxConn>>,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            result = underlay.accept_conn(Some(TunnelKind::Mux)) => match result {
                Ok(conn) => conn,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    debug!("Mux underlay accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        tokio::spawn(serve_session(conn, conns.clone(), cancel.child_token()));
    }
    debug!("Mux accept loop stopped");
}

async fn serve_session(conn: BoxConn, conns: Arc<Dispatcher<BoxConn>>, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::channel(16);
    let id = rand::rng().random::<u32>();
    let session = MuxSession::spawn(id, conn, YamuxMode::Server, Some(tx), cancel.clone());
    // 驱动任务结束时 tx 随之释放，rx 返回 None
    while let Some(stream) = rx.recv().await {
        let stream = session.adopt(stream);
        if !conns.dispatch(TunnelKind::Simplesocks, Box::new(stream)).await {
            break;
        }
    }
    session.close();
}

#[async_trait]
impl TunnelServer for MuxServer {
    async fn accept_conn(&self, _overlay: Option<TunnelKind>) -> Result<BoxConn> {
        self.conns.accept(None).await
    }

    async fn accept_packet(&self, _overlay: Option<TunnelKind>) -> Result<SharedPacketConn> {
        Err(TunnelError::not_supported("mux carries packets through simplesocks"))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.underlay.close().await
    }
}
