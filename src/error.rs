/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用者可以区分隧道被拒绝、
/// 传输层失败和可重试的连接重置等情况
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 代理隧道客户端的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 输入无效（目标为空、无法识别或协议不支持），在任何 I/O 之前失败
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 代理对 CONNECT 返回了非 200 状态
    #[error("connecting to proxy failed with {status} {message}")]
    TunnelRejected { status: u16, message: String },

    /// 建立或使用隧道时的传输层错误
    #[error("connecting to proxy failed with transport error on {addr}: {source}")]
    TunnelTransport {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 复用的连接池套接字被对端重置（内部重试一次）
    #[error("Reused connection to {addr} was reset: {source}")]
    RetryableReset {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 请求或响应体转发失败
    #[error("Stream relay error: {source}")]
    StreamRelay {
        #[source]
        source: io::Error,
    },

    /// 代理或源站返回了无法解析的响应
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// TLS 握手失败
    #[error("TLS handshake with {server_name} failed: {source}")]
    Tls {
        server_name: String,
        #[source]
        source: io::Error,
    },

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 客户端已销毁
    #[error("Proxy tunnel has been shut down")]
    Shutdown,

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建输入无效错误
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// 创建隧道被拒绝错误
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::TunnelRejected {
            status,
            message: message.into(),
        }
    }

    /// 创建传输层错误
    pub fn transport(addr: impl Into<String>, source: io::Error) -> Self {
        Self::TunnelTransport {
            addr: addr.into(),
            source,
        }
    }

    /// 按连接是否复用对 I/O 错误分类
    ///
    /// 只有复用连接上的重置类错误才可重试，新建连接上的失败视为真实故障
    pub fn classify_io(addr: impl Into<String>, source: io::Error, reused: bool) -> Self {
        if reused && is_reset(&source) {
            Self::RetryableReset {
                addr: addr.into(),
                source,
            }
        } else {
            Self::transport(addr, source)
        }
    }

    /// 创建流转发错误
    pub fn relay(source: io::Error) -> Self {
        Self::StreamRelay { source }
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 未被重试恢复的重置错误以传输层错误的形式交给调用者
    pub fn into_surfaced(self) -> Self {
        match self {
            Self::RetryableReset { addr, source } => Self::TunnelTransport { addr, source },
            other => other,
        }
    }

    /// 检查是否为可重试的重置
    pub fn is_retryable_reset(&self) -> bool {
        matches!(self, Self::RetryableReset { .. })
    }

    /// 检查是否为隧道被拒绝
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::TunnelRejected { .. })
    }

    /// 检查是否为传输层错误
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TunnelTransport { .. })
    }

    /// 检查是否为输入无效
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    /// 检查是否因客户端销毁而失败
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 被拒绝时代理返回的状态码
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::TunnelRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 重置类错误：对端复位、管道断开、连接中止，或在收到响应前读到 EOF
pub fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
