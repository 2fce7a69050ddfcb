/// 观测上下文
///
/// 在构造客户端时注入，替代进程级的全局调试状态。
/// 所有方法都有空实现，按需覆盖即可。
use crate::error::TunnelError;
use crate::router::TargetUri;
use std::fmt;

/// 请求走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// 以绝对 URI 直接转发给代理
    Http,
    /// 经 CONNECT 隧道的 TLS
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// 客户端事件观察者
pub trait Observer: Send + Sync + 'static {
    /// 请求开始（id 按协议分别递增）
    fn request_started(&self, _id: u64, _protocol: Protocol, _target: &TargetUri) {}

    /// 请求拿到了连接
    fn socket_assigned(&self, _id: u64, _protocol: Protocol, _socket_id: u64, _reused: bool) {}

    /// CONNECT 成功
    fn tunnel_established(&self, _authority: &str) {}

    /// CONNECT 被拒绝或失败
    fn tunnel_failed(&self, _authority: &str, _error: &TunnelError) {}

    /// 复用连接被重置，即将在新连接上重试
    fn retrying(&self, _id: u64, _protocol: Protocol, _error: &TunnelError) {}
}
