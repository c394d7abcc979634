/// Trojan Tunnel 库入口
///
/// 各协议层都实现 [`tunnel::Tunnel`]，按名称叠加成客户端与服务端协议栈，
/// [`proxy::Proxy`] 在入口与出口之间转发。
pub mod adapter;
pub mod cli;
pub mod common;
pub mod config;
pub mod error;
pub mod freedom;
pub mod mux;
pub mod proxy;
pub mod redirector;
pub mod router;
pub mod simplesocks;
pub mod sniff;
pub mod tls;
pub mod transport;
pub mod trojan;
pub mod tunnel;

// 重新导出常用类型
pub use common::{Address, Command, Metadata};
pub use config::{Config, RunType};
pub use error::{Result, TunnelError};
pub use proxy::Proxy;
pub use tunnel::{
    BoxConn, Conn, PacketConn, SharedPacketConn, Tunnel, TunnelClient, TunnelContext,
    TunnelKind, TunnelRegistry, TunnelServer,
};
