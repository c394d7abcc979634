use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::common::{Address, Command, Metadata};
use crate::tunnel::{BoxConn, PacketConn};

pub const CRLF: &[u8; 2] = b"\r\n";

/// 单个 UDP 数据报负载的上限
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// 编码请求头：`hash | CRLF | cmd | addr | CRLF`
pub fn encode_request(hash: &str, metadata: &Metadata) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(hash.len() + 4 + metadata.address.encoded_len() + 1);
    buf.extend_from_slice(hash.as_bytes());
    buf.extend_from_slice(CRLF);
    metadata.write_to(&mut buf)?;
    buf.extend_from_slice(CRLF);
    Ok(buf)
}

/// 编码数据报：`addr | len | CRLF | payload`
pub fn encode_packet(address: &Address, payload: &[u8]) -> io::Result<Vec<u8>> {
    if payload.len() > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet too large: {} bytes", payload.len()),
        ));
    }
    let mut buf = Vec::with_capacity(address.encoded_len() + 4 + payload.len());
    address.write_to(&mut buf)?;
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// 读取 CRLF 并校验
pub async fn read_crlf<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<()> {
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != CRLF {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "expected CRLF"));
    }
    Ok(())
}

/// 读取一个数据报到 `buf`，返回负载长度与地址
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<(usize, Address)> {
    let address = Address::read_from(reader).await?;
    let len = reader.read_u16().await? as usize;
    read_crlf(reader).await?;
    if len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet of {} bytes exceeds buffer of {}", len, buf.len()),
        ));
    }
    reader.read_exact(&mut buf[..len]).await?;
    Ok((len, address))
}

/// 以 Trojan UDP 帧格式承载数据报的流连接
pub struct StreamPacketConn {
    reader: Mutex<ReadHalf<BoxConn>>,
    writer: Mutex<WriteHalf<BoxConn>>,
}

impl StreamPacketConn {
    pub fn new(conn: BoxConn) -> Self {
        let (reader, writer) = tokio::io::split(conn);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl PacketConn for StreamPacketConn {
    async fn read_with_metadata(&self, buf: &mut [u8]) -> io::Result<(usize, Metadata)> {
        let mut reader = self.reader.lock().await;
        let (n, address) = read_packet(&mut *reader, buf).await?;
        Ok((n, Metadata::new(Command::Associate, address)))
    }

    async fn write_with_metadata(&self, buf: &[u8], metadata: &Metadata) -> io::Result<usize> {
        let frame = encode_packet(&metadata.address, buf)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(buf.len())
    }

    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}
