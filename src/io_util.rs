/// 批量 I/O 辅助
///
/// 请求头和请求体、分块编码的长度行和数据一次写出，减少系统调用次数
use std::io::{self, IoSlice};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// 批量写入辅助函数 - 使用 write_vectored 减少系统调用
///
/// # 示例
/// ```rust
/// use tokio::net::TcpStream;
/// use forward_proxy_tunnel::io_util::write_vectored_all;
///
/// # async fn example(stream: &mut TcpStream) -> std::io::Result<()> {
/// let head = b"POST /upload HTTP/1.1\r\nhost: example.com\r\ncontent-length: 5\r\n\r\n";
/// let body = b"hello";
///
/// write_vectored_all(stream, &[head, body]).await?;
/// # Ok(())
/// # }
/// ```
pub async fn write_vectored_all<W>(writer: &mut W, bufs: &[&[u8]]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut pending: Vec<&[u8]> = bufs.iter().copied().filter(|b| !b.is_empty()).collect();
    let mut idx = 0;

    while idx < pending.len() {
        // 只剩一个缓冲区时直接使用 write_all
        if idx + 1 == pending.len() {
            writer.write_all(pending[idx]).await?;
            break;
        }

        let io_slices: Vec<IoSlice<'_>> = pending[idx..].iter().map(|b| IoSlice::new(b)).collect();
        let written = match writer.write_vectored(&io_slices).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write vectored data",
                ))
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        drop(io_slices);

        // 跳过已写入的字节，可能停在某个缓冲区中间
        let mut n = written;
        while n > 0 && idx < pending.len() {
            let len = pending[idx].len();
            if n >= len {
                n -= len;
                idx += 1;
            } else {
                pending[idx] = &pending[idx][n..];
                n = 0;
            }
        }
    }

    writer.flush().await
}
