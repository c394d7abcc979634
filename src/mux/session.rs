use futures::future::poll_fn;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

use crate::error::{Result, TunnelError};
use crate::tunnel::Conn;

type OpenReply = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

/// 一条底层连接上的 yamux 会话
///
/// 会话由后台驱动任务持有 yamux 连接；打开子流通过通道请求驱动任务完成。
/// 驱动任务结束（底层连接断开或被强制关闭）后会话即视为失效。
pub struct MuxSession {
    id: u32,
    requests: mpsc::Sender<OpenReply>,
    live: AtomicUsize,
    last_active: Mutex<Instant>,
    cancel: CancellationToken,
}

impl MuxSession {
    /// 在 `io` 上启动会话；服务端模式下入站子流送入 `inbound`
    pub fn spawn<T>(
        id: u32,
        io: T,
        mode: YamuxMode,
        inbound: Option<mpsc::Sender<yamux::Stream>>,
        cancel: CancellationToken,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, rx) = mpsc::channel(16);
        let connection = YamuxConnection::new(
            TokioAsyncReadCompatExt::compat(io),
            YamuxConfig::default(),
            mode,
        );
        tokio::spawn(drive(id, connection, rx, inbound, cancel.clone()));
        Arc::new(Self {
            id,
            requests,
            live: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
            cancel,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 当前打开的子流数量
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 距离最后一次子流关闭或打开的时间
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 强制关闭会话与底层连接
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// 预留一个子流名额；`limit` 为 0 时不限制
    pub(crate) fn try_reserve(&self, limit: usize) -> bool {
        if self.is_closed() {
            return false;
        }
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// 归还预留的名额
    pub(crate) fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        *self.last_active.lock() = Instant::now();
    }

    /// 使用已预留的名额打开一个出站子流
    pub(crate) async fn open_reserved(self: &Arc<Self>) -> Result<MuxStream> {
        let opened = async {
            let (tx, rx) = oneshot::channel();
            self.requests
                .send(tx)
                .await
                .map_err(|_| TunnelError::transport_error("mux session closed"))?;
            rx.await
                .map_err(|_| TunnelError::transport_error("mux session closed"))?
                .map_err(|e| TunnelError::transport_error(format!("Failed to open mux stream: {}", e)))
        }
        .await;
        match opened {
            Ok(stream) => {
                *self.last_active.lock() = Instant::now();
                Ok(MuxStream::new(stream, self.clone()))
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// 把入站子流包装为连接并计入活跃数
    pub(crate) fn adopt(self: &Arc<Self>, stream: yamux::Stream) -> MuxStream {
        self.live.fetch_add(1, Ordering::SeqCst);
        MuxStream::new(stream, self.clone())
    }
}

async fn drive<T>(
    id: u32,
    mut connection: YamuxConnection<T>,
    mut requests: mpsc::Receiver<OpenReply>,
    inbound: Option<mpsc::Sender<yamux::Stream>>,
    cancel: CancellationToken,
) where
    T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin,
{
    info!("Mux session {:08x} started", id);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(reply) = requests.recv() => {
                let stream = poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                let _ = reply.send(stream);
            }
            result = poll_fn(|cx| connection.poll_next_inbound(cx)) => match result {
                Some(Ok(stream)) => {
                    if let Some(tx) = &inbound {
                        if tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!("Mux session {:08x} error: {}", id, e);
                    break;
                }
                None => break,
            },
        }
    }

    if let Err(e) = poll_fn(|cx| connection.poll_close(cx)).await {
        debug!("Mux session {:08x} close error: {}", id, e);
    }
    cancel.cancel();
    info!("Mux session {:08x} closed", id);
}

/// yamux 子流，关闭时归还会话名额
pub struct MuxStream {
    inner: Compat<yamux::Stream>,
    session: Arc<MuxSession>,
}

impl MuxStream {
    fn new(stream: yamux::Stream, session: Arc<MuxSession>) -> Self {
        Self {
            inner: FuturesAsyncReadCompatExt::compat(stream),
            session,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session.id
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.session.release();
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Conn for MuxStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
