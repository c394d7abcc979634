//! 各协议层共享的基础类型：地址与元数据编解码、可回退读取、协议头延迟发送、双向转发
mod address;
mod deferred;
mod meta_conn;
mod metadata;
mod relay;
mod rewind;

pub use address::{Address, Host, Network, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
pub use deferred::{HeaderConn, HEADER_FLUSH_DELAY};
pub use meta_conn::MetadataConn;
pub use metadata::{Command, Metadata, MUX_PLACEHOLDER};
pub use relay::relay;
pub use rewind::RewindConn;

use rand::Rng;
use std::time::Duration;

/// 随机的握手超时（5–15 秒）
pub fn handshake_timeout() -> Duration {
    Duration::from_millis(rand::rng().random_range(5_000..=15_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_timeout_range() {
        for _ in 0..100 {
            let t = handshake_timeout();
            assert!(t >= Duration::from_secs(5) && t <= Duration::from_secs(15));
        }
    }
}
