use bytes::BufMut;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 地址类型标记（与 SOCKS5 ATYP 一致）
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// 目标主机
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// 目标地址
///
/// 构造后不可变，唯一的例外是域名解析结果的惰性缓存。
#[derive(Debug, Clone)]
pub struct Address {
    pub host: Host,
    pub port: u16,
    pub network: Network,
    resolved: OnceLock<IpAddr>,
}

impl Address {
    pub fn new(host: Host, port: u16) -> Self {
        Self {
            host,
            port,
            network: Network::Tcp,
            resolved: OnceLock::new(),
        }
    }

    /// 域名地址
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self::new(Host::Domain(name.into()), port)
    }

    /// IP 地址
    pub fn ip_addr(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::new(Host::Ipv4(v4), port),
            IpAddr::V6(v6) => Self::new(Host::Ipv6(v6), port),
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::ip_addr(addr.ip(), addr.port())
    }

    /// 设置网络类型
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// ATYP 标记
    pub fn atyp(&self) -> u8 {
        match self.host {
            Host::Ipv4(_) => ATYP_IPV4,
            Host::Ipv6(_) => ATYP_IPV6,
            Host::Domain(_) => ATYP_DOMAIN,
        }
    }

    /// 字面 IP（域名地址返回 None）
    pub fn ip(&self) -> Option<IpAddr> {
        match &self.host {
            Host::Ipv4(v4) => Some(IpAddr::V4(*v4)),
            Host::Ipv6(v6) => Some(IpAddr::V6(*v6)),
            Host::Domain(_) => None,
        }
    }

    pub fn domain_name(&self) -> Option<&str> {
        match &self.host {
            Host::Domain(name) => Some(name),
            _ => None,
        }
    }

    /// 编码后的字节长度
    pub fn encoded_len(&self) -> usize {
        match &self.host {
            Host::Ipv4(_) => 1 + 4 + 2,
            Host::Ipv6(_) => 1 + 16 + 2,
            Host::Domain(name) => 1 + 1 + name.len() + 2,
        }
    }

    /// 写入 `ATYP | ADDR | PORT`
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> io::Result<()> {
        buf.put_u8(self.atyp());
        match &self.host {
            Host::Ipv4(v4) => buf.put_slice(&v4.octets()),
            Host::Ipv6(v6) => buf.put_slice(&v6.octets()),
            Host::Domain(name) => {
                if name.is_empty() || name.len() > u8::MAX as usize {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("domain name length {} out of range", name.len()),
                    ));
                }
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_u16(self.port);
        Ok(())
    }

    /// 从缓冲区解码，数据不足时返回 `Ok(None)`
    pub fn decode(buf: &[u8]) -> io::Result<Option<(Self, usize)>> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((Self::new(Host::Ipv4(ip), port), 7)))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Some((Self::new(Host::Ipv6(Ipv6Addr::from(octets)), port), 19)))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let len = buf[1] as usize;
                let total = 1 + 1 + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                let name = parse_domain(&buf[2..2 + len])?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((Self::domain(name, port), total)))
            }
            other => Err(invalid_atyp(other)),
        }
    }

    /// 从流中读取 `ATYP | ADDR | PORT`
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let atyp = reader.read_u8().await?;
        let host = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                Host::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                Host::Ipv6(Ipv6Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                Host::Domain(parse_domain(&name)?)
            }
            other => return Err(invalid_atyp(other)),
        };
        let port = reader.read_u16().await?;
        Ok(Self::new(host, port))
    }

    /// 解析出 IP，域名结果会被缓存
    pub async fn resolve(&self) -> io::Result<IpAddr> {
        if let Some(ip) = self.ip() {
            return Ok(ip);
        }
        if let Some(ip) = self.resolved.get() {
            return Ok(*ip);
        }
        let name = self.domain_name().unwrap_or_default();
        let ip = tokio::net::lookup_host((name, self.port))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {}", name),
                )
            })?;
        let _ = self.resolved.set(ip);
        Ok(ip)
    }

    /// 解析为可直接拨号的 socket 地址
    pub async fn to_socket_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::new(self.resolve().await?, self.port))
    }
}

fn parse_domain(raw: &[u8]) -> io::Result<String> {
    if raw.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty domain name",
        ));
    }
    String::from_utf8(raw.to_vec())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid domain encoding"))
}

fn invalid_atyp(atyp: u8) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid address type 0x{:02x}", atyp),
    )
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.network == other.network
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.network.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(v4) => write!(f, "{}:{}", v4, self.port),
            Host::Ipv6(v6) => write!(f, "[{}]:{}", v6, self.port),
            Host::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl FromStr for Address {
    type Err = io::Error;

    /// 解析 `host:port`、`1.2.3.4:port` 或 `[::1]:port`
    fn from_str(s: &str) -> io::Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::from_socket_addr(addr));
        }
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("missing port in {}", s))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in {}", s))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("missing host in {}", s),
            ));
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => Ok(Self::ip_addr(ip, port)),
            Err(_) => Ok(Self::domain(host, port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(addr: &Address) -> Vec<u8> {
        let mut buf = Vec::new();
        addr.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let cases = [
            Address::ip_addr("10.1.2.3".parse().unwrap(), 443),
            Address::ip_addr("2001:db8::1".parse().unwrap(), 8080),
            Address::domain("example.com", 80),
        ];
        for addr in cases {
            let buf = encode(&addr);
            assert_eq!(buf.len(), addr.encoded_len());
            let (decoded, used) = Address::decode(&buf).unwrap().unwrap();
            assert_eq!(used, buf.len());
            assert_eq!(decoded, addr);
        }
    }

    #[test]
    fn test_wire_layout() {
        let buf = encode(&Address::domain("a.io", 0x1f90));
        assert_eq!(buf, [0x03, 4, b'a', b'.', b'i', b'o', 0x1f, 0x90]);
    }

    #[test]
    fn test_decode_partial() {
        let buf = encode(&Address::domain("example.com", 80));
        for cut in 0..buf.len() {
            assert!(Address::decode(&buf[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_decode_invalid_type() {
        assert!(Address::decode(&[0x09, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_domain_too_long() {
        let addr = Address::domain("a".repeat(256), 80);
        assert!(addr.write_to(&mut Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let buf = encode(&Address::ip_addr("::1".parse().unwrap(), 53));
        let mut reader = &buf[..];
        let addr = Address::read_from(&mut reader).await.unwrap();
        assert_eq!(addr.to_string(), "[::1]:53");
    }

    #[test]
    fn test_parse_from_str() {
        let addr: Address = "example.com:443".parse().unwrap();
        assert_eq!(addr.domain_name(), Some("example.com"));
        assert_eq!(addr.port, 443);

        let addr: Address = "[::1]:80".parse().unwrap();
        assert_eq!(addr.atyp(), ATYP_IPV6);

        assert!("example.com".parse::<Address>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal_ip() {
        let addr = Address::ip_addr("127.0.0.1".parse().unwrap(), 1);
        assert_eq!(
            addr.to_socket_addr().await.unwrap(),
            "127.0.0.1:1".parse().unwrap()
        );
    }
}
