/// 代理隧道客户端
///
/// 持有两个连接池：到代理的明文连接池（HTTP 转发和 CONNECT 共用），
/// 以及经隧道到各目标的 TLS 连接池。销毁客户端会关闭两个池中所有连接。
use crate::config::{validate_proxy_url, ProxyTunnelBuilder, TunnelOptions};
use crate::connection_pool::{connect_tcp, ConnectionPool, PoolStats, PoolStream, Pooled};
use crate::error::{Result, TunnelError};
use crate::exchange::send_request;
use crate::observe::{Observer, Protocol};
use crate::response::Response;
use crate::router::{
    connect_target, normalize_params, overlay, route, NormalizedRequest, RequestOptions,
    ResponseCallback, RouteContext, Target, TargetUri,
};
use crate::tls;
use crate::tunnel::{self, SecureTunnelStream, TunnelStream};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{ACCEPT, PROXY_AUTHORIZATION, USER_AGENT};
use http::{HeaderMap, HeaderValue};
use percent_encoding::percent_decode_str;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// 内置的 User-Agent
pub const DEFAULT_USER_AGENT: &str = concat!("forward-proxy-tunnel/", env!("CARGO_PKG_VERSION"));

struct Inner {
    proxy: Url,
    proxy_authority: String,
    proxy_headers: HeaderMap,
    default_headers: HeaderMap,
    plain_pool: ConnectionPool<TcpStream>,
    tunnel_pool: ConnectionPool<SecureTunnelStream>,
    connector: TlsConnector,
    shutdown: CancellationToken,
    observer: Option<Arc<dyn Observer>>,
    http_requests: AtomicU64,
    https_requests: AtomicU64,
}

/// 通过正向 HTTP 代理发送请求的客户端
///
/// 克隆开销很小，所有克隆共享同一组连接池。
#[derive(Clone)]
pub struct ProxyTunnel {
    inner: Arc<Inner>,
}

impl ProxyTunnel {
    /// 创建客户端，代理地址必须是 `http://host[:port]`
    ///
    /// 代理地址中的用户名和密码会转换为 `Proxy-Authorization: Basic`，
    /// 除非 `proxy_headers` 中已经设置了该头。
    pub fn new(proxy: &str, options: TunnelOptions) -> Result<Self> {
        let proxy = Url::parse(proxy)
            .map_err(|e| TunnelError::config_error(format!("invalid proxy URL {}: {}", proxy, e)))?;
        Self::with_url(proxy, options)
    }

    /// 以已解析的代理地址创建客户端
    pub fn with_url(proxy: Url, options: TunnelOptions) -> Result<Self> {
        validate_proxy_url(&proxy)?;
        options.pool.validate("pool")?;
        options.tunnel_pool.validate("tunnel_pool")?;

        let proxy_target = TargetUri::from_url(proxy.clone())
            .map_err(|e| TunnelError::config_error(format!("invalid proxy URL: {}", e)))?;
        let proxy_authority = proxy_target.authority();

        let mut proxy_headers = options.proxy_headers;
        if !proxy_headers.contains_key(PROXY_AUTHORIZATION) {
            if let Some(value) = basic_auth(&proxy)? {
                proxy_headers.insert(PROXY_AUTHORIZATION, value);
            }
        }

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        default_headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        overlay(&mut default_headers, &options.default_headers);

        let connector = tls::build_connector(&options.tls)?;
        let shutdown = CancellationToken::new();
        let plain_pool = ConnectionPool::new("plain", options.pool, shutdown.child_token());
        let tunnel_pool =
            ConnectionPool::new("tunnel", options.tunnel_pool, shutdown.child_token());

        info!("Proxy tunnel client created for proxy {}", proxy_authority);
        Ok(Self {
            inner: Arc::new(Inner {
                proxy,
                proxy_authority,
                proxy_headers,
                default_headers,
                plain_pool,
                tunnel_pool,
                connector,
                shutdown,
                observer: options.observer,
                http_requests: AtomicU64::new(0),
                https_requests: AtomicU64::new(0),
            }),
        })
    }

    /// 创建 Builder
    pub fn builder(proxy: impl Into<String>) -> ProxyTunnelBuilder {
        ProxyTunnelBuilder::new(proxy)
    }

    /// 代理地址
    pub fn proxy(&self) -> &Url {
        &self.inner.proxy
    }

    /// 每个发往代理的请求携带的头
    pub fn proxy_headers(&self) -> &HeaderMap {
        &self.inner.proxy_headers
    }

    /// 调用者未提供 headers 时使用的请求头
    pub fn default_headers(&self) -> &HeaderMap {
        &self.inner.default_headers
    }

    /// 销毁客户端：关闭所有空闲和使用中的连接，排队和进行中的请求以 Shutdown 失败。可重复调用。
    pub fn destroy(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Destroying proxy tunnel client for {}", self.inner.proxy_authority);
        self.inner.shutdown.cancel();
        self.inner.tunnel_pool.destroy_all();
        self.inner.plain_pool.destroy_all();
    }

    /// 是否已销毁
    pub fn is_destroyed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// 统一调用形式，不做任何 I/O
    pub fn normalize_params(
        &self,
        target: impl Into<Target>,
        options: RequestOptions,
        callback: Option<ResponseCallback>,
    ) -> Result<NormalizedRequest> {
        normalize_params(target.into(), options, callback)
    }

    /// 建立到 `host:port` 的 CONNECT 隧道，返回原始字节流
    pub async fn establish_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream> {
        self.ensure_running()?;
        self.connect_tunnel(host, port, false)
            .await
            .map_err(TunnelError::into_surfaced)
    }

    /// 建立隧道并完成 TLS 握手（服务器名为 `host`）
    pub async fn establish_secure_tunnel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<SecureTunnelStream> {
        self.ensure_running()?;
        self.dial_secure(host, port, false)
            .await
            .map_err(TunnelError::into_surfaced)
    }

    /// 发送请求，不重试
    ///
    /// 目标无效时立即返回错误；否则在后台执行，返回可等待、可中止的句柄。
    pub fn request(
        &self,
        target: impl Into<Target>,
        options: RequestOptions,
    ) -> Result<PendingExchange<Response>> {
        let NormalizedRequest {
            target, options, ..
        } = normalize_params(target.into(), options, None)?;
        let this = self.clone();
        Ok(PendingExchange::spawn(async move {
            this.execute(target, options, false).await
        }))
    }

    /// 发送请求，响应交给回调；错误通过返回的句柄交付一次
    pub fn request_with<F>(
        &self,
        target: impl Into<Target>,
        options: RequestOptions,
        callback: F,
    ) -> Result<PendingExchange<()>>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let NormalizedRequest {
            target,
            options,
            callback,
        } = normalize_params(target.into(), options, Some(Box::new(callback)))?;
        let this = self.clone();
        Ok(PendingExchange::spawn(async move {
            let response = this.execute(target, options, false).await?;
            if let Some(callback) = callback {
                callback(response);
            }
            Ok(())
        }))
    }

    /// 发送请求并等待响应头
    ///
    /// 复用连接被对端重置时，在新连接上用原参数重试一次（请求体需要可重放）。
    pub async fn fetch(
        &self,
        target: impl Into<Target>,
        options: RequestOptions,
    ) -> Result<Response> {
        let NormalizedRequest {
            target, options, ..
        } = normalize_params(target.into(), options, None)?;
        self.execute(target, options, true).await
    }

    /// 到代理的明文连接池统计
    pub fn plain_pool_stats(&self) -> Option<PoolStats> {
        self.inner.plain_pool.stats(&self.inner.proxy_authority)
    }

    /// 到 `host:port` 的隧道连接池统计
    pub fn tunnel_pool_stats(&self, host: &str, port: u16) -> Option<PoolStats> {
        self.inner.tunnel_pool.stats(&connect_target(host, port))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(TunnelError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn next_request_id(&self, protocol: Protocol) -> u64 {
        let counter = match protocol {
            Protocol::Http => &self.inner.http_requests,
            Protocol::Https => &self.inner.https_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn execute(
        &self,
        target: TargetUri,
        mut options: RequestOptions,
        retry: bool,
    ) -> Result<Response> {
        self.ensure_running()?;
        let protocol = target.protocol();
        let id = self.next_request_id(protocol);
        debug!("{} request {} to {}", protocol, id, target);
        if let Some(observer) = &self.inner.observer {
            observer.request_started(id, protocol, &target);
        }

        let mut fresh = false;
        loop {
            match self.dispatch(id, &target, &mut options, fresh).await {
                Err(e) if retry && !fresh && e.is_retryable_reset() => {
                    if !options.body.is_replayable() {
                        debug!(
                            "{} request {}: body already consumed, not retrying",
                            protocol, id
                        );
                        return Err(e.into_surfaced());
                    }
                    warn!(
                        "{} request {} failed on a reused connection, retrying on a fresh one: {}",
                        protocol, id, e
                    );
                    if let Some(observer) = &self.inner.observer {
                        observer.retrying(id, protocol, &e);
                    }
                    fresh = true;
                }
                result => return result.map_err(TunnelError::into_surfaced),
            }
        }
    }

    /// 路由并完成一次交换，受请求超时和客户端销毁约束
    async fn dispatch(
        &self,
        id: u64,
        target: &TargetUri,
        options: &mut RequestOptions,
        fresh: bool,
    ) -> Result<Response> {
        let ctx = RouteContext {
            proxy_headers: &self.inner.proxy_headers,
            default_headers: &self.inner.default_headers,
            plain_keep_alive: self.inner.plain_pool.config().keep_alive,
            tunnel_keep_alive: self.inner.tunnel_pool.config().keep_alive,
        };
        let routed = route(target, options, &ctx)?;
        let timeout = options.timeout;
        let body = &mut options.body;

        let exchange = async {
            match routed.protocol {
                Protocol::Http => {
                    let conn = self.acquire_plain(fresh).await?;
                    self.assigned(id, routed.protocol, &conn);
                    send_request(conn, &routed, body, self.inner.shutdown.clone()).await
                }
                Protocol::Https => {
                    let host = target.hostname();
                    let port = target.port();
                    let conn = self
                        .inner
                        .tunnel_pool
                        .acquire(&target.authority(), fresh, || {
                            self.dial_secure(host, port, fresh)
                        })
                        .await?;
                    self.assigned(id, routed.protocol, &conn);
                    send_request(conn, &routed, body, self.inner.shutdown.clone()).await
                }
            }
        };

        let bounded = async {
            match timeout {
                Some(duration) => tokio::time::timeout(duration, exchange)
                    .await
                    .map_err(|_| TunnelError::timeout(duration))?,
                None => exchange.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(TunnelError::Shutdown),
            result = bounded => result,
        }
    }

    fn assigned<C: PoolStream>(
        &self,
        id: u64,
        protocol: Protocol,
        conn: &Pooled<C>,
    ) {
        debug!(
            "{} request {} {} connection #{}",
            protocol,
            id,
            if conn.is_reused() { "reusing" } else { "using new" },
            conn.id()
        );
        if let Some(observer) = &self.inner.observer {
            observer.socket_assigned(id, protocol, conn.id(), conn.is_reused());
        }
    }

    async fn acquire_plain(&self, fresh: bool) -> Result<Pooled<TcpStream>> {
        let pool = &self.inner.plain_pool;
        let addr = self.inner.proxy_authority.as_str();
        pool.acquire(addr, fresh, || connect_tcp(addr, pool.config()))
            .await
    }

    /// CONNECT 到 `host:port`
    async fn connect_tunnel(&self, host: &str, port: u16, fresh: bool) -> Result<TunnelStream> {
        let authority = connect_target(host, port);
        let conn = self.acquire_plain(fresh).await?;
        match tunnel::establish(conn, host, port, &self.inner.proxy_headers).await {
            Ok(stream) => {
                if let Some(observer) = &self.inner.observer {
                    observer.tunnel_established(&authority);
                }
                Ok(stream)
            }
            Err(e) => {
                if let Some(observer) = &self.inner.observer {
                    observer.tunnel_failed(&authority, &e);
                }
                Err(e)
            }
        }
    }

    /// 新建隧道连接：CONNECT 后以目标主机名完成 TLS 握手
    async fn dial_secure(&self, host: &str, port: u16, fresh: bool) -> Result<SecureTunnelStream> {
        let stream = self.connect_tunnel(host, port, fresh).await?;
        tls::handshake(&self.inner.connector, host, stream).await
    }
}

impl std::fmt::Debug for ProxyTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTunnel")
            .field("proxy", &self.inner.proxy_authority)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// 代理地址中的用户信息转换为 Basic 认证头
fn basic_auth(proxy: &Url) -> Result<Option<HeaderValue>> {
    if proxy.username().is_empty() && proxy.password().is_none() {
        return Ok(None);
    }
    let username = percent_decode_str(proxy.username()).decode_utf8_lossy();
    let password = percent_decode_str(proxy.password().unwrap_or_default()).decode_utf8_lossy();
    let encoded = STANDARD.encode(format!("{}:{}", username, password));
    let mut value = HeaderValue::from_str(&format!("Basic {}", encoded))
        .map_err(|e| TunnelError::config_error(format!("invalid proxy credentials: {}", e)))?;
    value.set_sensitive(true);
    Ok(Some(value))
}

/// 进行中的请求
///
/// 可以直接 `.await` 得到结果；[`PendingExchange::abort`] 中止请求并关闭其连接。
pub struct PendingExchange<T = Response> {
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> PendingExchange<T> {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// 中止请求，占用的连接被关闭并释放连接池名额
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// 是否已结束
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for PendingExchange<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(TunnelError::Io(
                io::Error::new(io::ErrorKind::Interrupted, "request aborted"),
            ))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(TunnelError::Io(io::Error::other(format!(
                "request task failed: {}",
                e
            ))))),
            Poll::Pending => Poll::Pending,
        }
    }
}
