/// 在一条连接上完成一次请求/响应交换
use crate::body::Body;
use crate::connection_pool::{PoolStream, Pooled};
use crate::error::{Result, TunnelError};
use crate::http1::{
    chunk_size_line, encode_request_head, is_chunked, read_response_head, response_body_length,
    LAST_CHUNK,
};
use crate::io_util::write_vectored_all;
use crate::response::{Response, ResponseBody};
use crate::router::RoutedRequest;
use bytes::BytesMut;
use http::header::CONNECTION;
use http::{HeaderMap, StatusCode};
use std::io;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// 发送请求并读取响应头，响应体以流的形式交给 [`Response`]
///
/// 写入和读取响应头时的 I/O 错误按连接是否复用分类；请求体流本身的错误为 StreamRelay。
pub(crate) async fn send_request<C: PoolStream>(
    mut conn: Pooled<C>,
    routed: &RoutedRequest,
    body: &mut Body,
    shutdown: CancellationToken,
) -> Result<Response> {
    let addr = conn.key().to_string();
    let reused = conn.is_reused();
    let socket_id = conn.id();
    let classify = |e: io::Error| {
        if e.kind() == io::ErrorKind::InvalidData {
            TunnelError::protocol(e.to_string())
        } else {
            TunnelError::classify_io(addr.clone(), e, reused)
        }
    };

    let head = encode_request_head(&routed.method, &routed.request_target, &routed.headers);
    let chunked = is_chunked(&routed.headers);
    trace!(
        "Sending {} {} on connection #{} to {}",
        routed.method,
        routed.request_target,
        socket_id,
        addr
    );

    if let Some(data) = body.as_bytes() {
        let result = if chunked {
            let size = chunk_size_line(data.len());
            write_vectored_all(
                &mut conn,
                &[&head[..], &size[..], &data[..], b"\r\n", LAST_CHUNK],
            )
            .await
        } else {
            write_vectored_all(&mut conn, &[&head[..], &data[..]]).await
        };
        result.map_err(classify)?;
    } else if body.is_stream() {
        write_vectored_all(&mut conn, &[&head[..]]).await.map_err(classify)?;
        stream_body(&mut conn, body, chunked).await?;
    } else {
        write_vectored_all(&mut conn, &[&head[..]]).await.map_err(classify)?;
    }

    let mut buf = BytesMut::new();
    let response = loop {
        let response = read_response_head(&mut conn, &mut buf)
            .await
            .map_err(classify)?;
        if response.status.is_informational() && response.status != StatusCode::SWITCHING_PROTOCOLS
        {
            debug!(
                "Skipping interim response {} on connection #{}",
                response.status, socket_id
            );
            continue;
        }
        break response;
    };

    let length = response_body_length(&routed.method, &response)
        .map_err(|e| TunnelError::protocol(e.to_string()))?;
    let keep_alive = response.is_keep_alive()
        && !wants_close(&routed.headers)
        && response.status != StatusCode::SWITCHING_PROTOCOLS;

    let body = ResponseBody::new(Box::new(conn), buf, length, keep_alive, shutdown);
    Ok(Response::new(response, body, socket_id, reused))
}

/// 把流式请求体写到连接上，chunked 时逐段编码
async fn stream_body<C: PoolStream>(
    conn: &mut Pooled<C>,
    body: &mut Body,
    chunked: bool,
) -> Result<()> {
    while let Some(chunk) = body.next_chunk().await {
        let data = chunk.map_err(TunnelError::relay)?;
        // 空块会被当作结束标记
        if data.is_empty() {
            continue;
        }
        let result = if chunked {
            let size = chunk_size_line(data.len());
            write_vectored_all(conn, &[&size[..], &data[..], b"\r\n"]).await
        } else {
            conn.write_all(&data).await
        };
        result.map_err(TunnelError::relay)?;
    }
    if chunked {
        conn.write_all(LAST_CHUNK).await.map_err(TunnelError::relay)?;
    }
    conn.flush().await.map_err(TunnelError::relay)
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("close"))
}
