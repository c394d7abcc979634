use bytes::BufMut;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::address::Address;

/// 请求命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Associate = 0x03,
    Mux = 0x7f,
}

impl TryFrom<u8> for Command {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            0x01 => Ok(Command::Connect),
            0x03 => Ok(Command::Associate),
            0x7f => Ok(Command::Mux),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown command 0x{:02x}", other),
            )),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => write!(f, "connect"),
            Command::Associate => write!(f, "associate"),
            Command::Mux => write!(f, "mux"),
        }
    }
}

/// 命令加目标地址，协议头与 UDP 数据报的基本单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub command: Command,
    pub address: Address,
}

impl Metadata {
    pub fn new(command: Command, address: Address) -> Self {
        Self { command, address }
    }

    pub fn connect(address: Address) -> Self {
        Self::new(Command::Connect, address)
    }

    /// Mux 连接没有真实目标，使用占位地址
    pub fn mux() -> Self {
        Self::new(Command::Mux, Address::domain(MUX_PLACEHOLDER, 0))
    }

    /// 写入 `CMD | ATYP | ADDR | PORT`
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> io::Result<()> {
        buf.put_u8(self.command as u8);
        self.address.write_to(buf)
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let command = Command::try_from(reader.read_u8().await?)?;
        let address = Address::read_from(reader).await?;
        Ok(Self { command, address })
    }
}

/// Mux 占位域名
pub const MUX_PLACEHOLDER: &str = "MUX_CONN";

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.command, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let meta = Metadata::connect(Address::domain("example.com", 80));
        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        assert_eq!(buf[0], 0x01);

        let mut reader = &buf[..];
        let decoded = Metadata::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, meta);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_command_values() {
        assert_eq!(Command::try_from(0x7f).unwrap(), Command::Mux);
        assert_eq!(Command::try_from(0x03).unwrap(), Command::Associate);
        assert!(Command::try_from(0x02).is_err());
    }

    #[test]
    fn test_mux_placeholder() {
        let meta = Metadata::mux();
        assert_eq!(meta.address.domain_name(), Some(MUX_PLACEHOLDER));
        assert_eq!(meta.to_string(), "mux MUX_CONN:0");
    }
}
