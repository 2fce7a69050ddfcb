/// 请求体
///
/// 内存中的数据可以在重试时原样重放；流式请求体一旦开始读取就不能重放。
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

enum Kind {
    Empty,
    Full(Bytes),
    Streaming {
        stream: BoxStream<'static, io::Result<Bytes>>,
        started: bool,
    },
}

/// 请求体
pub struct Body {
    kind: Kind,
}

impl Body {
    /// 空请求体
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    /// 包装字节流（长度未知，按 chunked 发送）
    pub fn wrap_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            kind: Kind::Streaming {
                stream: stream.boxed(),
                started: false,
            },
        }
    }

    /// 从 AsyncRead 读取请求体
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::wrap_stream(ReaderStream::new(reader))
    }

    /// 已知的长度，流式请求体返回 None
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            Kind::Empty => Some(0),
            Kind::Full(bytes) => Some(bytes.len() as u64),
            Kind::Streaming { .. } => None,
        }
    }

    /// 是否没有请求体
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    /// 是否为流式请求体
    pub fn is_stream(&self) -> bool {
        matches!(self.kind, Kind::Streaming { .. })
    }

    /// 能否在重试时重新发送
    pub fn is_replayable(&self) -> bool {
        match &self.kind {
            Kind::Empty | Kind::Full(_) => true,
            Kind::Streaming { started, .. } => !started,
        }
    }

    /// 内存中的完整数据
    pub(crate) fn as_bytes(&self) -> Option<&Bytes> {
        match &self.kind {
            Kind::Full(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// 读取下一段流式数据
    pub(crate) async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        match &mut self.kind {
            Kind::Streaming { stream, started } => {
                *started = true;
                stream.next().await
            }
            _ => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => f.write_str("Body(Empty)"),
            Kind::Full(bytes) => write!(f, "Body(Full, {} bytes)", bytes.len()),
            Kind::Streaming { started, .. } => write!(f, "Body(Streaming, started: {})", started),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            kind: Kind::Full(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Self {
        Bytes::from(vec).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Self {
        Bytes::from_static(s).into()
    }
}
