/// Forward Proxy Tunnel 库入口
///
/// 所有请求都经过一个正向 HTTP 代理：http 目标以绝对 URI 直接转发，
/// https 目标先用 CONNECT 建立隧道，再在隧道内完成 TLS 握手。
/// 到代理的连接和隧道连接分别池化复用。
pub mod body;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection_pool;
pub mod error;
mod exchange;
pub mod http1;
pub mod io_util;
pub mod observe;
pub mod response;
pub mod router;
pub mod tls;
pub mod tunnel;

// 重新导出常用类型
pub use body::Body;
pub use client::{PendingExchange, ProxyTunnel};
pub use config::{PoolConfig, ProxyTunnelBuilder, TlsOptions, TunnelOptions};
pub use connection_pool::PoolStats;
pub use error::{Result, TunnelError};
pub use observe::{Observer, Protocol};
pub use response::{Response, ResponseBody};
pub use router::{LegacyTarget, NormalizedRequest, RequestOptions, Target, TargetUri};
pub use tunnel::{SecureTunnelStream, TunnelStream};
