/// 响应与流式响应体
///
/// 响应体持有连接；完整读完且连接可复用时归还连接池，提前丢弃则关闭连接。
use crate::connection_pool::{PoolStream, Pooled};
use crate::error::{Result, TunnelError};
use crate::http1::{BodyLength, ChunkedDecoder, Decoded, ResponseHead, READ_BUFFER_SIZE};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use http::{HeaderMap, StatusCode, Version};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 响应体背后的连接
pub(crate) trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    /// 归还到连接池
    fn release(self: Box<Self>);
}

impl<C: PoolStream> Connection for Pooled<C> {
    fn release(self: Box<Self>) {
        Pooled::release(*self)
    }
}

enum BodyState {
    Length(u64),
    Chunked(ChunkedDecoder),
    CloseDelimited,
    Done,
}

/// 流式响应体
///
/// 连接只在读取时被取出；客户端销毁时仍停在这里的连接由后台任务立即关闭。
pub struct ResponseBody {
    conn: Arc<Mutex<Option<Box<dyn Connection>>>>,
    buf: BytesMut,
    state: BodyState,
    keep_alive: bool,
    shutdown: CancellationToken,
    done: CancellationToken,
}

impl ResponseBody {
    pub(crate) fn new(
        conn: Box<dyn Connection>,
        buf: BytesMut,
        length: BodyLength,
        keep_alive: bool,
        shutdown: CancellationToken,
    ) -> Self {
        let state = match length {
            BodyLength::Empty => BodyState::Done,
            BodyLength::Length(n) => BodyState::Length(n),
            BodyLength::Chunked => BodyState::Chunked(ChunkedDecoder::new()),
            BodyLength::CloseDelimited => BodyState::CloseDelimited,
        };
        let keep_alive = keep_alive && !matches!(state, BodyState::CloseDelimited);
        let done = shutdown.child_token();
        let mut body = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            buf,
            state,
            keep_alive,
            shutdown,
            done,
        };
        if matches!(body.state, BodyState::Done) {
            body.finish();
        } else {
            body.watch_shutdown();
        }
        body
    }

    fn watch_shutdown(&self) {
        let conn = Arc::downgrade(&self.conn);
        let done = self.done.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            done.cancelled().await;
            if !shutdown.is_cancelled() {
                return;
            }
            let Some(conn) = conn.upgrade() else {
                return;
            };
            if conn.lock().take().is_some() {
                debug!("Client destroyed, closing unread response connection");
            }
        });
    }

    /// 响应体是否已读完
    pub fn is_end(&self) -> bool {
        matches!(self.state, BodyState::Done)
    }

    /// 读取下一段数据，读完返回 None
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match &mut self.state {
                BodyState::Done => return Ok(None),
                BodyState::Length(remaining) => {
                    if !self.buf.is_empty() {
                        let n = (*remaining).min(self.buf.len() as u64) as usize;
                        let data = self.buf.split_to(n).freeze();
                        *remaining -= n as u64;
                        if *remaining == 0 {
                            self.finish();
                        }
                        return Ok(Some(data));
                    }
                }
                BodyState::Chunked(decoder) => match decoder
                    .decode(&mut self.buf)
                    .map_err(|e| TunnelError::protocol(e.to_string()))?
                {
                    Decoded::Data(data) => return Ok(Some(data)),
                    Decoded::Done => {
                        self.finish();
                        return Ok(None);
                    }
                    Decoded::NeedMore => {}
                },
                BodyState::CloseDelimited => {
                    if !self.buf.is_empty() {
                        return Ok(Some(self.buf.split().freeze()));
                    }
                }
            }

            if self.fill().await? == 0 {
                if matches!(self.state, BodyState::CloseDelimited) {
                    self.close();
                    return Ok(None);
                }
                self.close();
                return Err(TunnelError::relay(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message completed",
                )));
            }
        }
    }

    /// 读取全部响应体
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// 读取全部响应体并按 UTF-8（有损）解码
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 丢弃剩余响应体，让连接可以回到连接池
    pub async fn resume(&mut self) -> Result<()> {
        while self.chunk().await?.is_some() {}
        Ok(())
    }

    /// 转换为字节流
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        stream::unfold(Some(self), |body| async move {
            let mut body = body?;
            match body.chunk().await {
                Ok(Some(data)) => Some((Ok(data), Some(body))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn fill(&mut self) -> Result<usize> {
        if self.shutdown.is_cancelled() {
            self.close();
            return Err(TunnelError::Shutdown);
        }
        let parked = self.conn.lock().take();
        let Some(mut conn) = parked else {
            self.close();
            return Err(TunnelError::relay(io::Error::new(
                io::ErrorKind::NotConnected,
                "response connection already closed",
            )));
        };
        self.buf.reserve(READ_BUFFER_SIZE);

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            read = conn.read_buf(&mut self.buf) => Some(read),
        };
        match result {
            None => {
                self.close();
                Err(TunnelError::Shutdown)
            }
            Some(Ok(n)) => {
                // 放回前在锁内检查，避免和关闭任务错过彼此
                let mut slot = self.conn.lock();
                if self.shutdown.is_cancelled() {
                    drop(slot);
                    self.close();
                    return Err(TunnelError::Shutdown);
                }
                *slot = Some(conn);
                Ok(n)
            }
            Some(Err(e)) => {
                self.close();
                Err(TunnelError::relay(e))
            }
        }
    }

    /// 不归还，直接关闭连接
    fn close(&mut self) {
        self.state = BodyState::Done;
        self.done.cancel();
        self.conn.lock().take();
    }

    fn finish(&mut self) {
        self.state = BodyState::Done;
        self.done.cancel();
        let Some(conn) = self.conn.lock().take() else {
            return;
        };
        if self.keep_alive && self.buf.is_empty() {
            conn.release();
        } else {
            debug!("Response finished on a non-reusable connection, closing");
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("end", &self.is_end())
            .field("buffered", &self.buf.len())
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// 响应
#[derive(Debug)]
pub struct Response {
    head: ResponseHead,
    body: ResponseBody,
    socket_id: u64,
    reused_socket: bool,
}

impl Response {
    pub(crate) fn new(
        head: ResponseHead,
        body: ResponseBody,
        socket_id: u64,
        reused_socket: bool,
    ) -> Self {
        Self {
            head,
            body,
            socket_id,
            reused_socket,
        }
    }

    /// 状态码
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// 原因短语（如 "OK"）
    pub fn status_message(&self) -> &str {
        &self.head.reason
    }

    /// HTTP 版本
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// 响应头
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// 承载该响应的连接编号
    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// 该响应是否通过复用的连接获得
    pub fn is_reused_socket(&self) -> bool {
        self.reused_socket
    }

    /// 响应体的可变引用
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// 取出响应体
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// 读取下一段响应体
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    /// 读取全部响应体
    pub async fn bytes(mut self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// 读取全部响应体为字符串
    pub async fn text(mut self) -> Result<String> {
        self.body.text().await
    }

    /// 丢弃响应体，释放连接
    pub async fn resume(mut self) -> Result<()> {
        self.body.resume().await
    }
}
