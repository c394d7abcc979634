use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 单向复制，结束后关闭写端
async fn copy_one_way<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let n = tokio::io::copy(reader, writer).await?;
    let _ = writer.shutdown().await;
    Ok(n)
}

/// 双向转发两个连接
///
/// 任一方向遇到 EOF 或错误即结束，两个连接随之一起释放。
/// 返回 `(a -> b, b -> a)` 中先结束方向的字节数，另一方向计为 0。
pub async fn relay<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        result = copy_one_way(&mut a_read, &mut b_write) => {
            let n = result?;
            debug!("Relay finished upstream first ({} bytes)", n);
            Ok((n, 0))
        }
        result = copy_one_way(&mut b_read, &mut a_write) => {
            let n = result?;
            debug!("Relay finished downstream first ({} bytes)", n);
            Ok((0, n))
        }
    }
}
