use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// 读取记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// 直接读取底层流
    Passthrough,
    /// 读取底层流并记录读出的字节
    Recording,
    /// 先回放已记录的字节，结束后按 `then_record` 决定是否继续记录
    Replaying { pos: usize, then_record: bool },
}

/// 可回退读取的连接
///
/// 调用 [`set_buffer_size`](Self::set_buffer_size) 后开始记录读取的数据，
/// [`rewind`](Self::rewind) 让后续读取从记录起点重新开始，
/// [`stop_buffering`](Self::stop_buffering) 结束记录。每个字节对最终读者只交付一次。
pub struct RewindConn<S> {
    inner: S,
    buf: Vec<u8>,
    limit: usize,
    mode: Mode,
    overflowed: bool,
}

impl<S> RewindConn<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            limit: 0,
            mode: Mode::Passthrough,
            overflowed: false,
        }
    }

    /// 开始记录，最多记录 `size` 字节
    pub fn set_buffer_size(&mut self, size: usize) {
        self.limit = size;
        self.overflowed = false;
        match self.mode {
            Mode::Passthrough => {
                self.buf.clear();
                self.mode = Mode::Recording;
            }
            Mode::Replaying { pos, .. } => {
                self.mode = Mode::Replaying {
                    pos,
                    then_record: true,
                };
            }
            Mode::Recording => {}
        }
    }

    /// 回到记录起点
    pub fn rewind(&mut self) -> io::Result<()> {
        if self.overflowed {
            return Err(io::Error::other("rewind buffer overflowed"));
        }
        match self.mode {
            Mode::Passthrough if self.buf.is_empty() => Ok(()),
            _ => {
                self.mode = Mode::Replaying {
                    pos: 0,
                    then_record: true,
                };
                Ok(())
            }
        }
    }

    /// 停止记录，尚未回放的字节仍会被读出
    pub fn stop_buffering(&mut self) {
        match self.mode {
            Mode::Replaying { pos, .. } if pos < self.buf.len() => {
                self.mode = Mode::Replaying {
                    pos,
                    then_record: false,
                };
            }
            _ => {
                self.buf = Vec::new();
                self.mode = Mode::Passthrough;
            }
        }
    }

    /// 已记录的字节
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead + Unpin> RewindConn<S> {
    /// 预读最多 `n` 字节后回退，EOF 时返回较短的结果
    pub async fn peek(&mut self, n: usize) -> io::Result<Vec<u8>> {
        self.set_buffer_size(self.limit.max(n));
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.read(&mut out[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        out.truncate(filled);
        self.rewind()?;
        Ok(out)
    }

    /// 与 [`peek`](Self::peek) 相同，但超时后回退并返回已到达的字节，而不是报错
    pub async fn peek_timeout(&mut self, n: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.peek(n)).await {
            Ok(result) => result,
            Err(_) => {
                let head = self.buf[..self.buf.len().min(n)].to_vec();
                self.rewind()?;
                Ok(head)
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Mode::Replaying { pos, then_record } = this.mode {
            if pos < this.buf.len() {
                let n = (this.buf.len() - pos).min(out.remaining());
                out.put_slice(&this.buf[pos..pos + n]);
                let pos = pos + n;
                if pos < this.buf.len() {
                    this.mode = Mode::Replaying { pos, then_record };
                } else if then_record {
                    this.mode = Mode::Recording;
                } else {
                    this.buf = Vec::new();
                    this.mode = Mode::Passthrough;
                }
                return Poll::Ready(Ok(()));
            }
            if then_record {
                this.mode = Mode::Recording;
            } else {
                this.buf = Vec::new();
                this.mode = Mode::Passthrough;
            }
        }

        let before = out.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, out);
        if let (Poll::Ready(Ok(())), Mode::Recording) = (&res, this.mode) {
            let fresh = &out.filled()[before..];
            if this.buf.len() + fresh.len() > this.limit {
                this.overflowed = true;
                this.buf = Vec::new();
                this.mode = Mode::Passthrough;
            } else {
                this.buf.extend_from_slice(fresh);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindConn<S> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_peek_then_read_exactly_once() {
        for (peek, total) in [(1usize, 64usize), (4, 4), (56, 300), (10, 10)] {
            let data = payload(total);
            let mut conn = RewindConn::new(&data[..]);
            let head = conn.peek(peek).await.unwrap();
            assert_eq!(head, data[..peek.min(total)]);
            conn.stop_buffering();

            let mut all = Vec::new();
            conn.read_to_end(&mut all).await.unwrap();
            assert_eq!(all, data);
        }
    }

    #[tokio::test]
    async fn test_nested_peeks() {
        let data = payload(100);
        let mut conn = RewindConn::new(&data[..]);
        assert_eq!(conn.peek(1).await.unwrap(), data[..1]);
        assert_eq!(conn.peek(4).await.unwrap(), data[..4]);
        assert_eq!(conn.peek(20).await.unwrap(), data[..20]);
        conn.stop_buffering();

        let mut all = Vec::new();
        conn.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, data);
    }

    #[tokio::test]
    async fn test_partial_consume_then_rewind() {
        let data = payload(32);
        let mut conn = RewindConn::new(&data[..]);
        conn.set_buffer_size(64);

        let mut first = [0u8; 10];
        conn.read_exact(&mut first).await.unwrap();
        conn.rewind().unwrap();
        conn.stop_buffering();

        let mut all = Vec::new();
        conn.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, data);
    }

    #[tokio::test]
    async fn test_overflow_prevents_rewind() {
        let data = payload(64);
        let mut conn = RewindConn::new(&data[..]);
        conn.set_buffer_size(8);

        let mut head = [0u8; 16];
        conn.read_exact(&mut head).await.unwrap();
        assert!(conn.rewind().is_err());

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, data[16..]);
    }

    #[tokio::test]
    async fn test_stop_buffering_records_nothing() {
        let data = payload(16);
        let mut conn = RewindConn::new(&data[..]);
        conn.stop_buffering();
        let mut head = [0u8; 4];
        conn.read_exact(&mut head).await.unwrap();
        assert!(conn.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_peek_timeout_keeps_partial_head() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = RewindConn::new(a);
        b.write_all(b"GE").await.unwrap();

        let head = conn.peek_timeout(4, Duration::from_millis(100)).await.unwrap();
        assert_eq!(head, b"GE");
        conn.stop_buffering();

        b.write_all(b"T /").await.unwrap();
        let mut all = [0u8; 5];
        conn.read_exact(&mut all).await.unwrap();
        assert_eq!(&all, b"GET /");
    }

    #[tokio::test]
    async fn test_write_passthrough() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = RewindConn::new(a);
        conn.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
    }
}
