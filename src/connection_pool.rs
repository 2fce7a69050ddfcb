use crate::config::PoolConfig;
use crate::error::{Result, TunnelError};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// 可放入连接池的连接
pub trait PoolStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// 空闲连接在复用或归还前是否仍然可用
    fn is_reusable(&self) -> bool;
}

impl PoolStream for TcpStream {
    fn is_reusable(&self) -> bool {
        match probe_socket(self) {
            SocketState::Idle => true,
            SocketState::Pending => {
                // 明文 HTTP 空闲连接上不应有数据，复用会破坏下一个响应的解析
                warn!("Unexpected data in idle connection, discarding");
                false
            }
            SocketState::Closed => false,
        }
    }
}

/// 空闲套接字的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// 无数据，连接正常
    Idle,
    /// 有待读数据
    Pending,
    /// 已被远端关闭或出错
    Closed,
}

/// 检查连接状态（用 peek，不消耗数据）
pub fn probe_socket(stream: &TcpStream) -> SocketState {
    let sock_ref = SockRef::from(stream);
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match sock_ref.peek(&mut buf) {
        Ok(0) => SocketState::Closed,
        Ok(_) => SocketState::Pending,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Idle,
        Err(e) => {
            debug!("Connection health check failed: {}", e);
            SocketState::Closed
        }
    }
}

/// 建立 TCP 连接（带超时、TCP_NODELAY 和 keepalive）
pub async fn connect_tcp(addr: &str, config: &PoolConfig) -> Result<TcpStream> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::timeout(config.connect_timeout))?
        .map_err(|e| TunnelError::transport(addr, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
    }
    apply_keepalive(&stream, config);
    Ok(stream)
}

fn apply_keepalive(stream: &TcpStream, config: &PoolConfig) {
    let Some(time) = config.tcp_keepalive else {
        return;
    };

    let keepalive = TcpKeepalive::new().with_time(time);
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

/// 池中的空闲连接
struct IdleConnection<C> {
    stream: C,
    id: u64,
    last_used: Instant,
}

/// 单个目标的连接池
struct AddressPool<C> {
    semaphore: Arc<Semaphore>,
    idle_connections: Vec<IdleConnection<C>>,
    active_count: usize,
}

impl<C> AddressPool<C> {
    fn new(max_sockets: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_sockets.min(Semaphore::MAX_PERMITS))),
            idle_connections: Vec::new(),
            active_count: 0,
        }
    }
}

struct PoolState<C> {
    pools: HashMap<String, AddressPool<C>>,
    closed: bool,
}

struct Shared<C> {
    name: &'static str,
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

/// 连接池统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max_sockets: usize,
}

/// 连接池管理器
///
/// 按目标（"host:port"）分别限制并发连接数，达到上限的获取请求在内部排队
pub struct ConnectionPool<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: PoolStream> ConnectionPool<C> {
    /// 创建新的连接池，shutdown 取消时所有排队的获取都会失败
    ///
    /// 在 tokio 运行时中创建时会启动后台清理任务，按 `idle_timeout` 关闭过期的空闲连接。
    pub fn new(name: &'static str, config: PoolConfig, shutdown: CancellationToken) -> Self {
        let pool = Self {
            shared: Arc::new(Shared {
                name,
                config,
                state: Mutex::new(PoolState {
                    pools: HashMap::new(),
                    closed: false,
                }),
                shutdown,
                next_id: AtomicU64::new(1),
            }),
        };
        pool.start_cleanup_task();
        pool
    }

    /// 启动后台清理任务，连接池销毁或被释放后退出
    fn start_cleanup_task(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(
                "[{}] No tokio runtime, idle connections expire lazily",
                self.shared.name
            );
            return;
        };
        let period = (self.shared.config.idle_timeout / 2)
            .clamp(MIN_CLEANUP_INTERVAL, MAX_CLEANUP_INTERVAL);
        let shared: Weak<Shared<C>> = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();

        handle.spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.cleanup_expired();
            }
        });
    }

    /// 连接池配置
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// 获取连接
    ///
    /// 优先复用空闲连接；`fresh` 为 true 时跳过并清空该目标的空闲连接，总是新建。
    /// 新建连接由 `dial` 完成。
    pub async fn acquire<F, Fut>(&self, key: &str, fresh: bool, dial: F) -> Result<Pooled<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let semaphore = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(TunnelError::Shutdown);
            }
            let max_sockets = self.shared.config.max_sockets;
            state
                .pools
                .entry(key.to_string())
                .or_insert_with(|| AddressPool::new(max_sockets))
                .semaphore
                .clone()
        };

        let permit = tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => return Err(TunnelError::Shutdown),
            permit = semaphore.acquire_owned() => permit.map_err(|_| TunnelError::Shutdown)?,
        };

        if let Some(idle) = self.take_idle(key, fresh)? {
            debug!(
                "[{}] Reusing pooled connection #{} to {}",
                self.shared.name, idle.id, key
            );
            return Ok(self.checkout(key, idle.id, idle.stream, true, permit));
        }

        let stream = tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => return Err(TunnelError::Shutdown),
            stream = dial() => stream?,
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] Created new connection #{} to {}",
            self.shared.name, id, key
        );
        Ok(self.checkout(key, id, stream, false, permit))
    }

    /// 取出一个可用的空闲连接，同时清理过期和已断开的连接
    fn take_idle(&self, key: &str, fresh: bool) -> Result<Option<IdleConnection<C>>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TunnelError::Shutdown);
        }
        let Some(pool) = state.pools.get_mut(key) else {
            return Ok(None);
        };

        if fresh {
            let dropped = pool.idle_connections.len();
            pool.idle_connections.clear();
            if dropped > 0 {
                debug!(
                    "[{}] Dropped {} idle connections to {} for a fresh dial",
                    self.shared.name, dropped, key
                );
            }
            return Ok(None);
        }

        let max_idle_time = self.shared.config.idle_timeout;
        while let Some(idle) = pool.idle_connections.pop() {
            if idle.last_used.elapsed() > max_idle_time {
                debug!(
                    "[{}] Idle connection #{} to {} expired",
                    self.shared.name, idle.id, key
                );
                continue;
            }
            if !idle.stream.is_reusable() {
                debug!(
                    "[{}] Idle connection #{} to {} is unhealthy, discarding",
                    self.shared.name, idle.id, key
                );
                continue;
            }
            return Ok(Some(idle));
        }
        Ok(None)
    }

    fn checkout(
        &self,
        key: &str,
        id: u64,
        stream: C,
        reused: bool,
        permit: OwnedSemaphorePermit,
    ) -> Pooled<C> {
        {
            let mut state = self.shared.state.lock();
            if let Some(pool) = state.pools.get_mut(key) {
                pool.active_count += 1;
            }
        }
        Pooled {
            stream: Some(stream),
            key: key.to_string(),
            id,
            reused,
            pool: self.shared.clone(),
            permit: Some(permit),
        }
    }

    /// 销毁所有连接（空闲的立即关闭），取消排队中的获取。可重复调用。
    pub fn destroy_all(&self) {
        self.shared.shutdown.cancel();
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let mut closed = 0;
        for pool in state.pools.values_mut() {
            pool.semaphore.close();
            closed += pool.idle_connections.len();
            pool.idle_connections.clear();
        }
        debug!(
            "[{}] Pool destroyed, closed {} idle connections",
            self.shared.name, closed
        );
    }

    /// 获取指定目标的统计信息
    pub fn stats(&self, key: &str) -> Option<PoolStats> {
        let state = self.shared.state.lock();
        state.pools.get(key).map(|pool| PoolStats {
            active: pool.active_count,
            idle: pool.idle_connections.len(),
            max_sockets: self.shared.config.max_sockets,
        })
    }
}

impl<C> Shared<C> {
    fn finish(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(pool) = state.pools.get_mut(key) {
            pool.active_count = pool.active_count.saturating_sub(1);
        }
    }

    /// 关闭过期的空闲连接，并移除已无人使用的目标
    fn cleanup_expired(&self) {
        let max_idle_time = self.config.idle_timeout;
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let name = self.name;
        state.pools.retain(|key, pool| {
            let before = pool.idle_connections.len();
            pool.idle_connections
                .retain(|conn| conn.last_used.elapsed() <= max_idle_time);
            let removed = before - pool.idle_connections.len();
            if removed > 0 {
                debug!(
                    "[{}] Cleaned up {} expired connections to {}",
                    name, removed, key
                );
            }
            // 信号量只被这里持有时，没有借出的连接也没有排队的获取
            pool.active_count > 0
                || !pool.idle_connections.is_empty()
                || Arc::strong_count(&pool.semaphore) > 1
        });
    }
}

impl<C: PoolStream> Shared<C> {
    fn return_connection(&self, key: &str, id: u64, stream: C) {
        let mut state = self.state.lock();
        let closed = state.closed;
        let Some(pool) = state.pools.get_mut(key) else {
            return;
        };
        pool.active_count = pool.active_count.saturating_sub(1);

        if closed {
            return;
        }
        // 如果配置不允许复用，直接丢弃
        if !self.config.keep_alive {
            debug!(
                "[{}] Connection reuse disabled, closing connection #{} to {}",
                self.name, id, key
            );
            return;
        }
        if !stream.is_reusable() {
            debug!(
                "[{}] Connection #{} to {} is unhealthy, discarding",
                self.name, id, key
            );
            return;
        }

        debug!(
            "[{}] Returning connection #{} to pool for {} (active: {}, idle: {})",
            self.name,
            id,
            key,
            pool.active_count,
            pool.idle_connections.len()
        );
        pool.idle_connections.push(IdleConnection {
            stream,
            id,
            last_used: Instant::now(),
        });
    }
}

/// 从池中借出的连接
///
/// 调用 [`Pooled::release`] 归还；直接 drop 则关闭连接，不会回到池中
pub struct Pooled<C: PoolStream> {
    stream: Option<C>,
    key: String,
    id: u64,
    reused: bool,
    pool: Arc<Shared<C>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<C: PoolStream> Pooled<C> {
    /// 连接编号（池内唯一）
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 是否复用自空闲连接
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// 目标地址
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 归还到池（空闲连接可被后续请求复用）
    pub fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            // 先放回空闲列表，再释放许可，排队者醒来时能拿到这条连接
            self.pool.return_connection(&self.key, self.id, stream);
        }
        self.permit.take();
    }

    /// 取出连接并脱离连接池（不再计入并发上限）
    pub fn detach(mut self) -> Option<C> {
        let stream = self.stream.take();
        self.pool.finish(&self.key);
        self.permit.take();
        stream
    }

    fn stream_mut(&mut self) -> io::Result<&mut C> {
        if self.pool.shutdown.is_cancelled() {
            if self.stream.take().is_some() {
                self.pool.finish(&self.key);
            }
            return Err(io::Error::other("connection pool destroyed"));
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))
    }
}

impl<C: PoolStream> Drop for Pooled<C> {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            debug!(
                "[{}] Closing connection #{} to {}",
                self.pool.name, self.id, self.key
            );
            self.pool.finish(&self.key);
        }
    }
}

impl<C: PoolStream> AsyncRead for Pooled<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<C: PoolStream> AsyncWrite for Pooled<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
