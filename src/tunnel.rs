/// CONNECT 隧道
///
/// 状态：Idle → ConnectSent → Established | Failed。
/// 代理的响应头完整解析之后才把连接当作原始字节流交出去，
/// 解析时多读到的字节（属于隧道内的协议）保存在 [`TunnelStream`] 里，先于套接字数据读出。
use crate::connection_pool::{probe_socket, PoolStream, Pooled, SocketState};
use crate::error::{Result, TunnelError};
use crate::http1::{encode_request_head, read_response_head};
use crate::router::{connect_target, overlay};
use bytes::{Buf, Bytes, BytesMut};
use http::header::HOST;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

/// 隧道握手状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    ConnectSent,
    Established,
    Failed,
}

/// 隧道内的原始字节流
#[derive(Debug)]
pub struct TunnelStream {
    prefix: Bytes,
    inner: TcpStream,
}

impl TunnelStream {
    fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }

    /// 底层 TCP 连接（到代理）
    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 隧道上的 TLS 连接
pub type SecureTunnelStream = TlsStream<TunnelStream>;

impl PoolStream for SecureTunnelStream {
    fn is_reusable(&self) -> bool {
        let (tunnel, _) = self.get_ref();
        if !tunnel.prefix.is_empty() {
            return false;
        }
        // 空闲的 TLS 连接上可能有会话票据等记录，不代表响应数据
        match probe_socket(tunnel.get_ref()) {
            SocketState::Idle | SocketState::Pending => true,
            SocketState::Closed => false,
        }
    }
}

/// 一次 CONNECT 握手
struct Handshake {
    target: String,
    proxy: String,
    state: TunnelState,
}

impl Handshake {
    fn transition(&mut self, next: TunnelState) {
        debug!(
            "Tunnel {} via {}: {:?} -> {:?}",
            self.target, self.proxy, self.state, next
        );
        self.state = next;
    }

    fn fail(&mut self, err: TunnelError) -> TunnelError {
        self.transition(TunnelState::Failed);
        err
    }
}

/// 在到代理的连接上发起 CONNECT，成功后返回脱离连接池的原始字节流
///
/// 非 200 响应或响应前的传输错误都会关闭连接，连接不会回到连接池。
/// 复用连接上的重置类错误分类为可重试。
pub async fn establish(
    mut conn: Pooled<TcpStream>,
    host: &str,
    port: u16,
    proxy_headers: &HeaderMap,
) -> Result<TunnelStream> {
    let target = connect_target(host, port);
    let mut handshake = Handshake {
        target: target.clone(),
        proxy: conn.key().to_string(),
        state: TunnelState::Idle,
    };
    let reused = conn.is_reused();

    let mut headers = HeaderMap::new();
    let host_value = HeaderValue::from_str(&target)
        .map_err(|_| TunnelError::invalid_input(format!("invalid tunnel target: {}", target)))?;
    headers.insert(HOST, host_value);
    overlay(&mut headers, proxy_headers);

    let head = encode_request_head(&Method::CONNECT, &target, &headers);
    let write = async {
        conn.write_all(&head).await?;
        conn.flush().await
    };
    if let Err(e) = write.await {
        let err = TunnelError::classify_io(handshake.proxy.clone(), e, reused);
        return Err(handshake.fail(err));
    }
    handshake.transition(TunnelState::ConnectSent);

    let mut buf = BytesMut::new();
    let response = match read_response_head(&mut conn, &mut buf).await {
        Ok(response) => response,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            let err = TunnelError::protocol(format!("invalid CONNECT response: {}", e));
            return Err(handshake.fail(err));
        }
        Err(e) => {
            let err = TunnelError::classify_io(handshake.proxy.clone(), e, reused);
            return Err(handshake.fail(err));
        }
    };

    if response.status != StatusCode::OK {
        warn!(
            "Proxy {} rejected tunnel to {}: {} {}",
            handshake.proxy,
            target,
            response.status.as_u16(),
            response.reason
        );
        drop(conn);
        let err = TunnelError::rejected(response.status.as_u16(), response.reason);
        return Err(handshake.fail(err));
    }

    let Some(stream) = conn.detach() else {
        let err = TunnelError::transport(
            handshake.proxy.clone(),
            io::Error::new(io::ErrorKind::NotConnected, "proxy connection already closed"),
        );
        return Err(handshake.fail(err));
    };
    handshake.transition(TunnelState::Established);
    info!(
        "Tunnel established to {} via {} ({} bytes buffered)",
        target,
        handshake.proxy,
        buf.len()
    );
    Ok(TunnelStream::new(buf.freeze(), stream))
}
