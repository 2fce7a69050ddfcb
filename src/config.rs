// 配置管理 - 连接池参数、TLS 选项和客户端构建器

use crate::client::ProxyTunnel;
use crate::error::{Result, TunnelError};
use crate::observe::Observer;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "PROXY_TUNNEL_";

/// 每个目标的默认最大连接数 - 可通过环境变量 PROXY_TUNNEL_MAX_SOCKETS 覆盖
pub const DEFAULT_MAX_SOCKETS: usize = 256;
/// 空闲连接默认保留时间（毫秒）- 可通过环境变量 PROXY_TUNNEL_IDLE_TIMEOUT_MS 覆盖
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
/// 建立连接默认超时（毫秒）- 可通过环境变量 PROXY_TUNNEL_CONNECT_TIMEOUT_MS 覆盖
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// TCP keepalive 首次探测时间（秒）
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 30;

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// 每个目标的最大并发连接数（含空闲连接）
    pub max_sockets: usize,
    /// 是否保留空闲连接供后续请求复用
    pub keep_alive: bool,
    /// 空闲连接最长保留时间
    pub idle_timeout: Duration,
    /// 建立 TCP 连接的超时
    pub connect_timeout: Duration,
    /// TCP keepalive 首次探测时间，None 表示不设置
    pub tcp_keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            keep_alive: true,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            tcp_keepalive: Some(Duration::from_secs(DEFAULT_TCP_KEEPALIVE_SECS)),
        }
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

impl PoolConfig {
    /// 以默认值为基础，读取环境变量覆盖
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_var::<usize>("MAX_SOCKETS") {
            config.max_sockets = max;
        }
        if let Some(keep_alive) = env_var::<bool>("KEEP_ALIVE") {
            config.keep_alive = keep_alive;
        }
        if let Some(ms) = env_var::<u64>("IDLE_TIMEOUT_MS") {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var::<u64>("CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// 设置每个目标的最大连接数
    pub fn max_sockets(mut self, max: usize) -> Self {
        self.max_sockets = max;
        self
    }

    /// 设置是否复用连接
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// 设置空闲超时
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// 设置连接超时
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 验证配置
    pub fn validate(&self, context: &str) -> Result<()> {
        if self.max_sockets == 0 {
            return Err(TunnelError::config_error(format!(
                "{}: max_sockets cannot be 0",
                context
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(TunnelError::config_error(format!(
                "{}: connect_timeout cannot be 0",
                context
            )));
        }
        Ok(())
    }
}

/// TLS 选项（隧道内的 TLS 握手）
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// 额外信任的 CA 证书（PEM）
    pub ca_cert_path: Option<PathBuf>,
    /// 跳过证书验证（仅用于测试）
    pub danger_accept_invalid_certs: bool,
    /// 直接提供的 rustls 客户端配置，优先于上面两项
    pub client_config: Option<Arc<rustls::ClientConfig>>,
}

/// 客户端构造选项
#[derive(Clone, Default)]
pub struct TunnelOptions {
    /// 每个发往代理的请求（CONNECT 和 HTTP 转发）都会携带的头
    pub proxy_headers: HeaderMap,
    /// 调用者未提供 headers 时使用的默认头，覆盖内置的 User-Agent 和 Accept
    pub default_headers: HeaderMap,
    /// 明文连接池（到代理）
    pub pool: PoolConfig,
    /// 隧道连接池（到目标的 TLS 连接）
    pub tunnel_pool: PoolConfig,
    /// TLS 选项
    pub tls: TlsOptions,
    /// 可选的观测上下文
    pub observer: Option<Arc<dyn Observer>>,
}

/// 验证代理地址：只支持 http 代理，且必须包含主机
pub fn validate_proxy_url(proxy: &Url) -> Result<()> {
    if proxy.scheme() != "http" {
        return Err(TunnelError::config_error(format!(
            "unsupported proxy scheme '{}', only http:// proxies are supported",
            proxy.scheme()
        )));
    }
    match proxy.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(TunnelError::config_error("proxy URL must contain a host")),
    }
}

/// 解析 "Name: value" 形式的头
pub fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| TunnelError::invalid_input(format!("invalid header line: {}", line)))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| TunnelError::invalid_input(format!("invalid header name: {}", e)))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|e| TunnelError::invalid_input(format!("invalid header value: {}", e)))?;
    Ok((name, value))
}

/// ProxyTunnel Builder
pub struct ProxyTunnelBuilder {
    proxy: String,
    options: TunnelOptions,
    error: Option<TunnelError>,
}

impl ProxyTunnelBuilder {
    /// 创建新的 Builder
    pub fn new(proxy: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
            options: TunnelOptions::default(),
            error: None,
        }
    }

    fn header_into(
        map: &mut HeaderMap,
        error: &mut Option<TunnelError>,
        name: &str,
        value: &str,
    ) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                error.get_or_insert_with(|| {
                    TunnelError::invalid_input(format!("invalid header {}: {}", name, value))
                });
            }
        }
    }

    /// 添加发往代理的头（如 Proxy-Authorization）
    pub fn proxy_header(mut self, name: &str, value: &str) -> Self {
        Self::header_into(
            &mut self.options.proxy_headers,
            &mut self.error,
            name,
            value,
        );
        self
    }

    /// 添加默认请求头
    pub fn default_header(mut self, name: &str, value: &str) -> Self {
        Self::header_into(
            &mut self.options.default_headers,
            &mut self.error,
            name,
            value,
        );
        self
    }

    /// 同时设置两个连接池的配置
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.options.tunnel_pool = config.clone();
        self.options.pool = config;
        self
    }

    /// 单独设置隧道连接池的配置
    pub fn tunnel_pool_config(mut self, config: PoolConfig) -> Self {
        self.options.tunnel_pool = config;
        self
    }

    /// 每个目标的最大连接数（两个连接池）
    pub fn max_sockets(mut self, max: usize) -> Self {
        self.options.pool.max_sockets = max;
        self.options.tunnel_pool.max_sockets = max;
        self
    }

    /// 是否复用连接（两个连接池）
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.options.pool.keep_alive = enabled;
        self.options.tunnel_pool.keep_alive = enabled;
        self
    }

    /// 设置 CA 证书路径
    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.tls.ca_cert_path = Some(path.into());
        self
    }

    /// 跳过证书验证（仅用于测试）
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.options.tls.danger_accept_invalid_certs = accept;
        self
    }

    /// 使用自定义的 rustls 客户端配置
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.options.tls.client_config = Some(config);
        self
    }

    /// 注入观测上下文
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.options.observer = Some(observer);
        self
    }

    /// 构建 ProxyTunnel 并验证
    pub fn build(self) -> Result<ProxyTunnel> {
        if let Some(err) = self.error {
            return Err(err);
        }
        ProxyTunnel::new(self.proxy.as_str(), self.options)
    }
}
