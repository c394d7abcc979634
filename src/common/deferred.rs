use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use super::metadata::Metadata;

/// 协议头在没有数据写入时的最长等待时间
pub const HEADER_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// 延迟发送协议头的连接
///
/// 协议头与第一次写入的数据合并为一次写出；若创建后 100ms 内没有写入而开始读取，
/// 则单独发送协议头，避免双方互相等待。
pub struct HeaderConn<S> {
    inner: S,
    header: Option<Vec<u8>>,
    pending: Vec<u8>,
    written: usize,
    pending_payload: usize,
    deadline: Instant,
    delay: Option<Pin<Box<Sleep>>>,
    metadata: Option<Metadata>,
}

impl<S> HeaderConn<S> {
    pub fn new(inner: S, header: Vec<u8>, metadata: Option<Metadata>) -> Self {
        Self {
            inner,
            header: Some(header),
            pending: Vec::new(),
            written: 0,
            pending_payload: 0,
            deadline: Instant::now() + HEADER_FLUSH_DELAY,
            delay: None,
            metadata,
        }
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// 协议头是否仍未写出
    pub fn header_pending(&self) -> bool {
        self.header.is_some() || !self.pending.is_empty()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn queue_header(&mut self, payload: &[u8]) {
        if let Some(mut header) = self.header.take() {
            header.extend_from_slice(payload);
            self.pending = header;
            self.written = 0;
            self.pending_payload = payload.len();
            self.delay = None;
        }
    }
}

impl<S: AsyncWrite + Unpin> HeaderConn<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending = Vec::new();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for HeaderConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.header.is_some() {
            let deadline = this.deadline;
            let delay = this
                .delay
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            ready!(delay.as_mut().poll(cx));
            this.queue_header(&[]);
        }
        if !this.pending.is_empty() && this.pending_payload == 0 {
            ready!(this.poll_drain(cx))?;
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HeaderConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.queue_header(buf);
        if !this.pending.is_empty() {
            ready!(this.poll_drain(cx))?;
            if this.pending_payload > 0 {
                let n = std::mem::take(&mut this.pending_payload);
                return Poll::Ready(Ok(n));
            }
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.pending.is_empty() {
            ready!(this.poll_drain(cx))?;
            this.pending_payload = 0;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.queue_header(&[]);
        if !this.pending.is_empty() {
            ready!(this.poll_drain(cx))?;
            this.pending_payload = 0;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
