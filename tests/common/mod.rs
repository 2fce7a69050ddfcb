//! Common utilities for integration tests
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BytesMut};
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// "Basic base64(user:pass)"
pub fn basic_auth(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
}

/// A parsed HTTP/1.1 request as seen by the test servers
#[derive(Debug)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    /// Lowercased header names
    pub headers: Vec<(String, String)>,
    pub head: Vec<u8>,
    /// Decoded body
    pub body: Vec<u8>,
    /// Body bytes exactly as received (chunk framing included)
    pub raw_body: Vec<u8>,
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> io::Result<()> {
    buf.reserve(8192);
    if stream.read_buf(buf).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed mid-message",
        ));
    }
    Ok(())
}

/// Take one CRLF-terminated line, appending the consumed bytes to `raw`
async fn take_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    raw: &mut Vec<u8>,
) -> io::Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            raw.extend_from_slice(&buf[..pos + 2]);
            buf.advance(pos + 2);
            return Ok(line);
        }
        fill(stream, buf).await?;
    }
}

async fn read_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    headers: &[(String, String)],
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };

    if header("transfer-encoding").is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
        let mut body = Vec::new();
        let mut raw = Vec::new();
        loop {
            let line = take_line(stream, buf, &mut raw).await?;
            let size_str = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;
            if size == 0 {
                // trailers
                while !take_line(stream, buf, &mut raw).await?.is_empty() {}
                return Ok((body, raw));
            }
            while buf.len() < size + 2 {
                fill(stream, buf).await?;
            }
            body.extend_from_slice(&buf[..size]);
            raw.extend_from_slice(&buf[..size + 2]);
            buf.advance(size + 2);
        }
    }

    let len = header("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < len {
        fill(stream, buf).await?;
    }
    let body = buf.split_to(len).to_vec();
    Ok((body.clone(), body))
}

/// Read one request; `Ok(None)` when the peer closed cleanly between requests
pub async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> io::Result<Option<RawRequest>> {
    let (method, target, headers, head_len) = loop {
        {
            let mut slots = [httparse::EMPTY_HEADER; 64];
            let mut request = httparse::Request::new(&mut slots);
            let status = request
                .parse(&buf[..])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if let httparse::Status::Complete(len) = status {
                let headers: Vec<(String, String)> = request
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                break (
                    request.method.unwrap_or_default().to_string(),
                    request.path.unwrap_or_default().to_string(),
                    headers,
                    len,
                );
            }
        }
        buf.reserve(8192);
        if stream.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-head",
            ));
        }
    };

    let head = buf.split_to(head_len).to_vec();
    let (body, raw_body) = if method == "CONNECT" {
        (Vec::new(), Vec::new())
    } else {
        read_body(stream, buf, &headers).await?
    };
    Ok(Some(RawRequest {
        method,
        target,
        headers,
        head,
        body,
        raw_body,
    }))
}

/// Read one Content-Length framed response and return its raw bytes
async fn read_response_raw<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> io::Result<Vec<u8>> {
    let (head_len, content_length) = loop {
        {
            let mut slots = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut slots);
            let status = response
                .parse(&buf[..])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if let httparse::Status::Complete(len) = status {
                let content_length = response
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                break (len, content_length);
            }
        }
        fill(stream, buf).await?;
    };
    while buf.len() < head_len + content_length {
        fill(stream, buf).await?;
    }
    Ok(buf.split_to(head_len + content_length).to_vec())
}

/// Close with RST instead of FIN
pub fn reset(stream: TcpStream) {
    let _ = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO));
    drop(stream);
}

/// Counter that also tracks its high-water mark
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self.clone())
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

struct GaugeGuard(Arc<Gauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How the test proxy treats requests on a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Normal,
    /// RST the connection when the second request arrives on it
    ResetSecondRequest,
    /// RST every connection on its first request
    ResetAlways,
    /// Serve only the very first request; RST everything after it
    ResetAfterFirstRequest,
}

#[derive(Default)]
pub struct ProxyStats {
    pub connections: AtomicUsize,
    pub connects: AtomicUsize,
    pub forwarded: AtomicUsize,
    pub rejected: AtomicUsize,
    pub requests: AtomicUsize,
    pub open: Arc<Gauge>,
}

impl ProxyStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Forward proxy with optional Basic auth, CONNECT tunnels and absolute-URI forwarding
pub struct TestProxy {
    pub addr: String,
    pub stats: Arc<ProxyStats>,
    handle: JoinHandle<()>,
}

impl TestProxy {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url_with_credentials(&self, user: &str, pass: &str) -> String {
        format!("http://{}:{}@{}", user, pass, self.addr)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn start_proxy(mode: ProxyMode, credentials: Option<(&str, &str)>) -> TestProxy {
    let expected = credentials.map(|(user, pass)| basic_auth(user, pass));
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind proxy");
    let addr = listener.local_addr().unwrap().to_string();
    let stats = Arc::new(ProxyStats::default());

    let handle = {
        let stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                stats.connections.fetch_add(1, Ordering::SeqCst);
                let guard = stats.open.enter();
                let stats = stats.clone();
                let expected = expected.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let _ = handle_proxy_connection(socket, mode, expected, stats).await;
                });
            }
        })
    };

    TestProxy {
        addr,
        stats,
        handle,
    }
}

async fn handle_proxy_connection(
    mut client: TcpStream,
    mode: ProxyMode,
    expected: Option<String>,
    stats: Arc<ProxyStats>,
) -> io::Result<()> {
    let mut buf = BytesMut::new();
    let mut served = 0;

    while let Some(request) = read_request(&mut client, &mut buf).await? {
        served += 1;
        let total = stats.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let reset = match mode {
            ProxyMode::Normal => false,
            ProxyMode::ResetSecondRequest => served == 2,
            ProxyMode::ResetAlways => true,
            ProxyMode::ResetAfterFirstRequest => total > 1,
        };
        if reset {
            self::reset(client);
            return Ok(());
        }

        let authorized = match &expected {
            None => true,
            Some(expected) => request.header("proxy-authorization") == Some(expected.as_str()),
        };
        if !authorized {
            stats.rejected.fetch_add(1, Ordering::SeqCst);
            client
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      proxy-authenticate: Basic realm=\"test\"\r\n\
                      content-length: 0\r\n\r\n",
                )
                .await?;
            if request.method == "CONNECT" {
                return Ok(());
            }
            continue;
        }

        if request.method == "CONNECT" {
            stats.connects.fetch_add(1, Ordering::SeqCst);
            let mut upstream = match TcpStream::connect(&request.target).await {
                Ok(upstream) => upstream,
                Err(_) => {
                    client
                        .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n")
                        .await?;
                    return Ok(());
                }
            };
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            if !buf.is_empty() {
                upstream.write_all(&buf).await?;
                buf.clear();
            }
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            return Ok(());
        }

        stats.forwarded.fetch_add(1, Ordering::SeqCst);
        let authority = request
            .target
            .strip_prefix("http://")
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default()
            .to_string();
        let mut upstream = TcpStream::connect(&authority).await?;
        upstream.write_all(&request.head).await?;
        upstream.write_all(&request.raw_body).await?;
        let mut upstream_buf = BytesMut::new();
        let response = read_response_raw(&mut upstream, &mut upstream_buf).await?;
        client.write_all(&response).await?;
    }
    Ok(())
}

#[derive(Default)]
pub struct OriginStats {
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
}

impl OriginStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Origin server that echoes what it received
///
/// Paths: `/status/<code>` answers with that status, `/slow` waits 100ms,
/// `/hang` waits 10s, anything else answers 200.
pub struct TestOrigin {
    pub port: u16,
    pub stats: Arc<OriginStats>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn https_url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.port, path)
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How the origin treats requests on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginMode {
    Normal,
    /// Drop the connection without answering when the second request arrives on it
    DropSecondRequest,
}

pub async fn start_http_origin() -> TestOrigin {
    start_origin(None, OriginMode::Normal).await
}

pub async fn start_https_origin() -> TestOrigin {
    start_https_origin_with(OriginMode::Normal).await
}

pub async fn start_https_origin_with(mode: OriginMode) -> TestOrigin {
    start_origin(Some(test_tls_acceptor()), mode).await
}

async fn start_origin(acceptor: Option<TlsAcceptor>, mode: OriginMode) -> TestOrigin {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind origin");
    let port = listener.local_addr().unwrap().port();
    let stats = Arc::new(OriginStats::default());

    let handle = {
        let stats = stats.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                stats.connections.fetch_add(1, Ordering::SeqCst);
                let stats = stats.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _ = match acceptor {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(tls) => serve_origin(tls, mode, stats).await,
                            Err(e) => Err(e),
                        },
                        None => serve_origin(socket, mode, stats).await,
                    };
                });
            }
        })
    };

    TestOrigin {
        port,
        stats,
        handle,
    }
}

async fn serve_origin<S>(
    mut stream: S,
    mode: OriginMode,
    stats: Arc<OriginStats>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    let mut served = 0;
    while let Some(request) = read_request(&mut stream, &mut buf).await? {
        served += 1;
        if mode == OriginMode::DropSecondRequest && served == 2 {
            return Ok(());
        }
        stats.requests.fetch_add(1, Ordering::SeqCst);

        // absolute-form targets come from the proxy
        let path = match request.target.strip_prefix("http://") {
            Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
            None => request.target.as_str(),
        }
        .to_string();

        match path.as_str() {
            "/slow" => tokio::time::sleep(Duration::from_millis(100)).await,
            "/hang" => tokio::time::sleep(Duration::from_secs(10)).await,
            _ => {}
        }

        let status: u16 = path
            .strip_prefix("/status/")
            .and_then(|code| code.parse().ok())
            .unwrap_or(200);
        let reason = match status {
            200 => "OK",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "Status",
        };

        let mut head = format!(
            "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nx-method: {}\r\nx-path: {}\r\n",
            status,
            reason,
            request.body.len(),
            request.method,
            path
        );
        for (name, echo) in [
            ("host", "x-host"),
            ("content-length", "x-content-length"),
            ("transfer-encoding", "x-transfer-encoding"),
            ("proxy-authorization", "x-proxy-authorization"),
            ("user-agent", "x-user-agent"),
        ] {
            if let Some(value) = request.header(name) {
                head.push_str(&format!("{}: {}\r\n", echo, value));
            }
        }
        head.push_str("\r\n");

        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&request.body).await?;
        stream.flush().await?;
    }
    Ok(())
}

/// TLS acceptor with a self-signed certificate for 127.0.0.1 / localhost
pub fn test_tls_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec![
        "127.0.0.1".to_string(),
        "localhost".to_string(),
    ])
    .expect("Failed to generate test certificate");
    let cert = certified.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(certified.signing_key.serialize_der()),
    );

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("Failed to build server TLS config");
    TlsAcceptor::from(Arc::new(config))
}
