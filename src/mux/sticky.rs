use rand::Rng;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// yamux 帧头长度
pub const FRAME_HEADER_LEN: usize = 12;
/// 关闭时追加的随机填充上限
pub const MAX_PADDING: usize = 512;

const YAMUX_VERSION: u8 = 0;
const TYPE_DATA: u8 = 0;
const TYPE_GO_AWAY: u8 = 3;

/// 解析出的 yamux 帧头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub flags: u16,
    pub stream_id: u32,
    pub length: u32,
}

impl FrameHeader {
    /// 一次写入恰好是一个帧头时返回解析结果
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != FRAME_HEADER_LEN || buf[0] != YAMUX_VERSION || buf[1] > TYPE_GO_AWAY {
            return None;
        }
        Some(Self {
            kind: buf[1],
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// 后面紧跟数据体的帧
    pub fn has_body(&self) -> bool {
        self.kind == TYPE_DATA && self.length > 0
    }
}

/// 把 yamux 的控制帧粘到相邻的数据写入上
///
/// yamux 每帧先写 12 字节帧头再写数据体。帧头一律先排队：数据帧的帧头等待随后的数据体，
/// 窗口更新、仅带标志位的空数据帧等控制帧跟随下一次数据写入或下一次 flush 一起发出。
/// 关闭时在最后的帧之后追加 0–512 字节随机填充。
pub struct StickyConn<S> {
    inner: S,
    queue: Vec<u8>,
    out: Vec<u8>,
    written: usize,
    padded: bool,
}

impl<S> StickyConn<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            queue: Vec::new(),
            out: Vec::new(),
            written: 0,
            padded: false,
        }
    }

    /// 排队中尚未写出的控制帧字节数
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn stage(&mut self, body: &[u8]) {
        if self.out.is_empty() {
            self.written = 0;
        }
        self.out.append(&mut self.queue);
        self.out.extend_from_slice(body);
    }
}

impl<S: AsyncWrite + Unpin> StickyConn<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.out.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StickyConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StickyConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        // 上一批尚未写完之前不接收新数据
        ready!(this.poll_drain(cx))?;

        if FrameHeader::parse(buf).is_some() {
            this.queue.extend_from_slice(buf);
            return Poll::Ready(Ok(buf.len()));
        }

        this.stage(buf);
        // 尽力立即写出，剩余部分在下一次写入或 flush 时继续
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.queue.is_empty() {
            this.stage(&[]);
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.padded {
            this.padded = true;
            let mut rng = rand::rng();
            let len = rng.random_range(0..=MAX_PADDING);
            let padding: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            this.stage(&padding);
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
