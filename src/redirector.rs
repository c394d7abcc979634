//! 把无法识别的连接原样转交给另一个上游（伪装回落）
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::relay;
use crate::error::{Result, TunnelError};
use crate::tunnel::{BoxConn, Conn};

/// 转交队列容量
const QUEUE_CAPACITY: usize = 64;

/// 连接回落目标的超时
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct Redirection {
    inbound: BoxConn,
    target: String,
}

/// 回落转发器句柄，可在各协议层之间共享
#[derive(Clone)]
pub struct Redirector {
    tx: mpsc::Sender<Redirection>,
}

impl Redirector {
    /// 启动后台转发任务，取消令牌结束时所有进行中的转发一并关闭
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_worker(rx, cancel));
        Self { tx }
    }

    /// 把 `inbound` 转交到 `target`，队列满时等待
    pub async fn redirect(&self, inbound: BoxConn, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        self.tx
            .send(Redirection { inbound, target })
            .await
            .map_err(|_| TunnelError::Cancelled)
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Redirection>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Redirector stopped");
                break;
            }
            item = rx.recv() => {
                let Some(redirection) = item else { break };
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = splice(redirection) => {}
                    }
                });
            }
        }
    }
}

async fn splice(redirection: Redirection) {
    let Redirection { inbound, target } = redirection;
    let peer = inbound
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let outbound = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Failed to connect to redirect target {}: {}", target, e);
            return;
        }
        Err(_) => {
            warn!("Timed out connecting to redirect target {}", target);
            return;
        }
    };
    let _ = outbound.set_nodelay(true);

    info!("Redirecting {} to {}", peer, target);
    match relay(inbound, outbound).await {
        Ok(_) => debug!("Redirection {} -> {} closed", peer, target),
        Err(e) => debug!("Redirection {} -> {} ended: {}", peer, target, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_redirect_splices_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let redirector = Redirector::new(CancellationToken::new());
        let (client, inbound) = tokio::io::duplex(1024);
        redirector.redirect(Box::new(inbound), target).await.unwrap();

        let (mut r, mut w) = tokio::io::split(client);
        w.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_cancel_closes_redirections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accepted_tx.send(());
            // 保持连接不关闭
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let cancel = CancellationToken::new();
        let redirector = Redirector::new(cancel.clone());
        let (mut client, inbound) = tokio::io::duplex(1024);
        redirector.redirect(Box::new(inbound), target).await.unwrap();
        accepted_rx.await.unwrap();

        cancel.cancel();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
