/// HTTP/1.1 编解码
///
/// 请求头编码、响应头解析（httparse）、响应体分帧和分块解码。
/// 响应头解析只消费到空行为止，之后的字节留在缓冲区中交给调用者。
use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 响应头最大大小
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// 响应头最多的字段数
const MAX_HEADERS: usize = 100;

/// 每次读取预留的缓冲区大小
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// 分块长度行的最大长度
const MAX_CHUNK_LINE: usize = 4096;

/// 解析后的响应头
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// 连接在响应结束后是否可以复用
    pub fn is_keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();

        if connection.iter().any(|v| v == "close") {
            return false;
        }
        match self.version {
            Version::HTTP_11 => true,
            _ => connection.iter().any(|v| v == "keep-alive"),
        }
    }
}

/// 编码请求行和请求头
pub fn encode_request_head(method: &Method, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// 尝试从缓冲区解析响应头
///
/// 返回解析结果和响应头占用的字节数；数据不完整时返回 None
pub fn parse_response_head(buf: &[u8]) -> io::Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid response head: {}", e),
            ))
        }
    };

    let code = response.code.unwrap_or_default();
    let status = StatusCode::from_u16(code).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid status code: {}", code),
        )
    })?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut map = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid header name: {}", e))
        })?;
        let value = HeaderValue::from_bytes(header.value).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("invalid header value: {}", e))
        })?;
        map.append(name, value);
    }

    Ok(Some((
        ResponseHead {
            version,
            status,
            reason: response.reason.unwrap_or_default().to_string(),
            headers: map,
        },
        len,
    )))
}

/// 从流中读取一个完整的响应头
///
/// 响应头之后多读到的字节留在 `buf` 中。收到任何字节前连接关闭返回 UnexpectedEof。
pub async fn read_response_head<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            if let Some((head, len)) = parse_response_head(buf)? {
                buf.advance(len);
                return Ok(head);
            }
        }

        if buf.len() >= MAX_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response head exceeds {} bytes", MAX_HEADER_SIZE),
            ));
        }

        buf.reserve(READ_BUFFER_SIZE);
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            let msg = if buf.is_empty() {
                "connection closed before response"
            } else {
                "connection closed in the middle of response head"
            };
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
        }
    }
}

/// 响应体的分帧方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// 没有响应体
    Empty,
    /// 固定长度
    Length(u64),
    /// Transfer-Encoding: chunked
    Chunked,
    /// 读到连接关闭为止
    CloseDelimited,
}

/// 根据请求方法和响应头决定响应体分帧
pub fn response_body_length(method: &Method, head: &ResponseHead) -> io::Result<BodyLength> {
    if method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
        || (method == Method::CONNECT && head.status.is_success())
    {
        return Ok(BodyLength::Empty);
    }

    if is_chunked(&head.headers) {
        return Ok(BodyLength::Chunked);
    }

    match head.headers.get(CONTENT_LENGTH) {
        Some(value) => {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid content-length")
                })?;
            Ok(if len == 0 {
                BodyLength::Empty
            } else {
                BodyLength::Length(len)
            })
        }
        None => Ok(BodyLength::CloseDelimited),
    }
}

/// 最后一个传输编码是否为 chunked
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// 分块编码的长度行
pub fn chunk_size_line(len: usize) -> Vec<u8> {
    format!("{:x}\r\n", len).into_bytes()
}

/// 分块编码结束标记
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// 分块解码的输出
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// 一段响应体数据
    Data(Bytes),
    /// 需要更多字节
    NeedMore,
    /// 响应体结束
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// 分块解码器
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkedState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkedState::Size,
        }
    }

    /// 是否已读到结束块和尾部
    pub fn is_done(&self) -> bool {
        self.state == ChunkedState::Done
    }

    /// 从缓冲区解码，消费已处理的字节
    pub fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Decoded> {
        loop {
            match self.state {
                ChunkedState::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ChunkedState::Trailer
                    } else {
                        ChunkedState::Data(size)
                    };
                }
                ChunkedState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let n = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(n).freeze();
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        ChunkedState::DataEnd
                    } else {
                        ChunkedState::Data(left)
                    };
                    return Ok(Decoded::Data(data));
                }
                ChunkedState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk data",
                        ));
                    }
                    buf.advance(2);
                    self.state = ChunkedState::Size;
                }
                ChunkedState::Trailer => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = ChunkedState::Done;
                    }
                }
                ChunkedState::Done => return Ok(Decoded::Done),
            }
        }
    }
}

/// 取出一行（不含 CRLF）
fn take_line(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk line too long",
        )),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line"))?;
    // 忽略分块扩展
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid chunk size: {:?}", size),
        )
    })
}
