/// 请求路由
///
/// 把 URL、字符串和旧式选项三种调用形式统一成 `(TargetUri, RequestOptions)`，
/// 再按协议决定走代理直接转发（http）还是 CONNECT 隧道（https），并组装请求头。
use crate::body::Body;
use crate::error::{Result, TunnelError};
use crate::observe::Protocol;
use crate::response::Response;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::{Host, Url};

/// 规范化后的目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    url: Url,
    hostname: String,
    port: u16,
}

impl TargetUri {
    /// 解析绝对 URL
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| TunnelError::invalid_input(format!("invalid target {:?}: {}", input, e)))?;
        Self::from_url(url)
    }

    /// 从已解析的 URL 构造（丢弃片段）
    pub fn from_url(mut url: Url) -> Result<Self> {
        let hostname = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => {
                return Err(TunnelError::invalid_input(format!(
                    "target {} has no host",
                    url
                )))
            }
        };
        let port = url.port_or_known_default().ok_or_else(|| {
            TunnelError::invalid_input(format!("unsupported target scheme: {}", url.scheme()))
        })?;
        url.set_fragment(None);
        Ok(Self {
            url,
            hostname,
            port,
        })
    }

    /// 协议名（不含冒号）
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// 是否走 CONNECT 隧道
    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// 路由协议
    pub fn protocol(&self) -> Protocol {
        if self.is_https() {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    /// 主机名（IPv6 不带方括号，用作 TLS 服务器名）
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// 端口（默认端口已补全）
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`，端口总是显式给出
    pub fn authority(&self) -> String {
        connect_target(&self.hostname, self.port)
    }

    /// HTTPS 请求的 Host 头，443 端口省略
    pub fn https_host_header(&self) -> String {
        if self.port == 443 {
            bracket_host(&self.hostname).into_owned()
        } else {
            self.authority()
        }
    }

    /// 路径和查询串
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// 完整的绝对 URI（转发给代理时的请求目标）
    pub fn absolute(&self) -> &str {
        self.url.as_str()
    }

    /// 替换路径（可带查询串）
    pub fn with_path(&self, path: &str) -> Result<Self> {
        validate_path(path)?;
        let mut url = self.url.clone();
        match path.split_once('?') {
            Some((p, q)) => {
                url.set_path(p);
                url.set_query(Some(q));
            }
            None => {
                url.set_path(path);
                url.set_query(None);
            }
        }
        Ok(Self {
            url,
            hostname: self.hostname.clone(),
            port: self.port,
        })
    }
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// 旧式的选项形式目标
#[derive(Debug, Default)]
pub struct LegacyTarget {
    /// "http:" / "https:"，冒号可省略，默认 http
    pub protocol: Option<String>,
    /// 主机名，优先于 `host`
    pub hostname: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    /// 同一个选项对象里携带的请求选项
    pub options: RequestOptions,
}

impl LegacyTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    fn to_target_uri(&self) -> Result<TargetUri> {
        let scheme = self
            .protocol
            .as_deref()
            .map(|p| p.trim_end_matches(':'))
            .unwrap_or("http")
            .to_ascii_lowercase();
        let host = self
            .hostname
            .as_deref()
            .or(self.host.as_deref())
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TunnelError::invalid_input("target options have no host"))?;
        let port = self
            .port
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let path = self.path.as_deref().unwrap_or("/");
        validate_path(path)?;
        TargetUri::parse(&format!(
            "{}://{}{}",
            scheme,
            connect_target(host, port),
            path
        ))
    }
}

/// 请求目标的三种形式
#[derive(Debug)]
pub enum Target {
    Url(Url),
    Str(String),
    Options(LegacyTarget),
}

impl From<Url> for Target {
    fn from(url: Url) -> Self {
        Target::Url(url)
    }
}

impl From<&Url> for Target {
    fn from(url: &Url) -> Self {
        Target::Url(url.clone())
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target::Str(s.to_string())
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        Target::Str(s)
    }
}

impl From<&String> for Target {
    fn from(s: &String) -> Self {
        Target::Str(s.clone())
    }
}

impl From<LegacyTarget> for Target {
    fn from(options: LegacyTarget) -> Self {
        Target::Options(options)
    }
}

/// 请求选项
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    /// 设置后整体替换默认请求头（不按键合并）
    pub headers: Option<HeaderMap>,
    /// 覆盖目标的路径（可带查询串）
    pub path: Option<String>,
    pub body: Body,
    /// 等待响应头的超时
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// 添加一个请求头
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .append(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 以 self 中已设置的字段覆盖 base
    fn merge_over(self, base: RequestOptions) -> RequestOptions {
        RequestOptions {
            method: self.method.or(base.method),
            headers: self.headers.or(base.headers),
            path: self.path.or(base.path),
            body: if self.body.is_empty() {
                base.body
            } else {
                self.body
            },
            timeout: self.timeout.or(base.timeout),
        }
    }
}

/// 响应回调
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send + 'static>;

/// 规范化结果
pub struct NormalizedRequest {
    pub target: TargetUri,
    pub options: RequestOptions,
    pub callback: Option<ResponseCallback>,
}

impl fmt::Debug for NormalizedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedRequest")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// 统一三种调用形式，不做任何 I/O
///
/// 选项形式的目标自带请求选项，`options` 参数中设置的字段覆盖它们。
pub fn normalize_params(
    target: Target,
    options: RequestOptions,
    callback: Option<ResponseCallback>,
) -> Result<NormalizedRequest> {
    let (target, options) = match target {
        Target::Url(url) => (TargetUri::from_url(url)?, options),
        Target::Str(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Err(TunnelError::invalid_input("target must not be empty"));
            }
            (TargetUri::parse(s)?, options)
        }
        Target::Options(mut legacy) => {
            let base = std::mem::take(&mut legacy.options);
            (legacy.to_target_uri()?, options.merge_over(base))
        }
    };

    let target = match options.path.as_deref() {
        Some(path) => target.with_path(path)?,
        None => target,
    };

    Ok(NormalizedRequest {
        target,
        options,
        callback,
    })
}

/// 请求路径必须以 '/' 开头且不含空白和控制字符
fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(TunnelError::invalid_input(format!(
            "request path must start with '/': {:?}",
            path
        )));
    }
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TunnelError::invalid_input(format!(
            "request path contains unescaped characters: {:?}",
            path
        )));
    }
    Ok(())
}

fn bracket_host(host: &str) -> std::borrow::Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host).into()
    } else {
        host.into()
    }
}

/// CONNECT 请求目标和 Host 头：`host:port`，IPv6 字面量加方括号
pub fn connect_target(host: &str, port: u16) -> String {
    format!("{}:{}", bracket_host(host), port)
}

/// 路由所需的客户端上下文
pub(crate) struct RouteContext<'a> {
    pub proxy_headers: &'a HeaderMap,
    pub default_headers: &'a HeaderMap,
    pub plain_keep_alive: bool,
    pub tunnel_keep_alive: bool,
}

/// 组装好的请求
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub target: TargetUri,
    pub protocol: Protocol,
    pub method: Method,
    /// 请求行中的目标：http 为绝对 URI，https 为路径和查询串
    pub request_target: String,
    pub headers: HeaderMap,
}

/// 按协议组装请求行和请求头
///
/// http：Host 取自目标，优先级为 目标 Host < 代理头 < 调用者头。
/// https：只使用调用者头（或默认头），不注入代理头。
pub(crate) fn route(
    target: &TargetUri,
    options: &RequestOptions,
    ctx: &RouteContext<'_>,
) -> Result<RoutedRequest> {
    let method = options.method.clone().unwrap_or(Method::GET);
    let caller = options.headers.as_ref().unwrap_or(ctx.default_headers);
    let protocol = target.protocol();

    let (request_target, mut headers, keep_alive) = match protocol {
        Protocol::Https => {
            let mut headers = caller.clone();
            if !headers.contains_key(HOST) {
                headers.insert(HOST, header_value(&target.https_host_header())?);
            }
            (target.path_and_query(), headers, ctx.tunnel_keep_alive)
        }
        Protocol::Http => {
            let mut headers = HeaderMap::new();
            headers.insert(HOST, header_value(&target.authority())?);
            overlay(&mut headers, ctx.proxy_headers);
            overlay(&mut headers, caller);
            (target.absolute().to_string(), headers, ctx.plain_keep_alive)
        }
    };

    if !headers.contains_key(CONNECTION) {
        headers.insert(
            CONNECTION,
            HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
        );
    }
    frame_body(&method, &options.body, &mut headers);

    Ok(RoutedRequest {
        target: target.clone(),
        protocol,
        method,
        request_target,
        headers,
    })
}

/// 没有显式长度或编码时，按请求体补上 Content-Length 或 chunked
///
/// GET 等通常不带请求体的方法也照样补上，不会丢弃调用者给的请求体；
/// 这是兼容性行为，并非 HTTP 的要求。
fn frame_body(method: &Method, body: &Body, headers: &mut HeaderMap) {
    if headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING) {
        return;
    }
    if body.is_empty() {
        if method == Method::POST || method == Method::PUT || method == Method::PATCH {
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
        return;
    }
    if !expects_body(method) {
        debug!("Framing a request body on {} request", method);
    }
    match body.content_length() {
        Some(len) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        None => {
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
    }
}

fn expects_body(method: &Method) -> bool {
    ![
        Method::GET,
        Method::HEAD,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
        Method::CONNECT,
    ]
    .contains(method)
}

/// 用 src 中的键整体替换 dst 中的同名键（保留多值）
pub(crate) fn overlay(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        dst.remove(name);
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| TunnelError::invalid_input(format!("invalid header value: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::{ACCEPT, PROXY_AUTHORIZATION, USER_AGENT};

    fn ctx<'a>(proxy_headers: &'a HeaderMap, default_headers: &'a HeaderMap) -> RouteContext<'a> {
        RouteContext {
            proxy_headers,
            default_headers,
            plain_keep_alive: true,
            tunnel_keep_alive: true,
        }
    }

    fn defaults() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("test-agent"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers
    }

    fn route_str(url: &str, options: RequestOptions, proxy: &HeaderMap) -> RoutedRequest {
        let normalized = normalize_params(url.into(), options, None).unwrap();
        let defaults = defaults();
        route(&normalized.target, &normalized.options, &ctx(proxy, &defaults)).unwrap()
    }

    #[test]
    fn test_target_uri_defaults() {
        let target = TargetUri::parse("http://Example.com/a?b=1#frag").unwrap();
        assert_eq!(target.hostname(), "example.com");
        assert_eq!(target.port(), 80);
        assert_eq!(target.authority(), "example.com:80");
        assert_eq!(target.path_and_query(), "/a?b=1");
        assert_eq!(target.absolute(), "http://example.com/a?b=1");
        assert!(!target.is_https());

        let secure = TargetUri::parse("https://example.com:8443").unwrap();
        assert_eq!(secure.port(), 8443);
        assert_eq!(secure.path_and_query(), "/");
        assert_eq!(secure.https_host_header(), "example.com:8443");
        assert_eq!(
            TargetUri::parse("https://example.com/")
                .unwrap()
                .https_host_header(),
            "example.com"
        );
    }

    #[test]
    fn test_ipv6_host() {
        let target = TargetUri::parse("http://[::1]:8080/x").unwrap();
        assert_eq!(target.hostname(), "::1");
        assert_eq!(target.authority(), "[::1]:8080");

        let routed = route_str("http://[::1]:8080/x", RequestOptions::new(), &HeaderMap::new());
        assert_eq!(routed.headers[HOST], "[::1]:8080");
        assert_eq!(routed.request_target, "http://[::1]:8080/x");
    }

    #[test]
    fn test_connect_target() {
        assert_eq!(connect_target("example.com", 443), "example.com:443");
        assert_eq!(connect_target("::1", 443), "[::1]:443");
        assert_eq!(connect_target("[::1]", 443), "[::1]:443");
    }

    #[test]
    fn test_normalize_rejects_invalid_input() {
        assert!(normalize_params("".into(), RequestOptions::new(), None)
            .unwrap_err()
            .is_invalid_input());
        assert!(normalize_params("not a url".into(), RequestOptions::new(), None)
            .unwrap_err()
            .is_invalid_input());
        assert!(
            normalize_params(LegacyTarget::default().into(), RequestOptions::new(), None)
                .unwrap_err()
                .is_invalid_input()
        );
        assert!(normalize_params(
            "http://example.com/".into(),
            RequestOptions::new().path("no-slash"),
            None
        )
        .unwrap_err()
        .is_invalid_input());
    }

    #[test]
    fn test_normalize_legacy_target() {
        let legacy = LegacyTarget::new("example.com")
            .protocol("https:")
            .path("/legacy?q=1")
            .options(RequestOptions::new().method(Method::POST));
        let normalized = normalize_params(legacy.into(), RequestOptions::new(), None).unwrap();

        assert!(normalized.target.is_https());
        assert_eq!(normalized.target.port(), 443);
        assert_eq!(normalized.target.path_and_query(), "/legacy?q=1");
        assert_eq!(normalized.options.method, Some(Method::POST));
    }

    #[test]
    fn test_normalize_path_override() {
        let normalized = normalize_params(
            "http://example.com/original?x=1".into(),
            RequestOptions::new().path("/override"),
            None,
        )
        .unwrap();
        assert_eq!(normalized.target.absolute(), "http://example.com/override");
    }

    #[test]
    fn test_normalize_keeps_callback() {
        let callback: ResponseCallback = Box::new(|_response| {});
        let normalized =
            normalize_params("http://example.com/".into(), RequestOptions::new(), Some(callback))
                .unwrap();
        assert!(normalized.callback.is_some());
    }

    #[test]
    fn test_http_route_header_precedence() {
        let mut proxy = HeaderMap::new();
        proxy.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic dGVzdA=="));
        proxy.insert(HOST, HeaderValue::from_static("proxy-host"));

        let routed = route_str("http://origin:8080/ok", RequestOptions::new(), &proxy);
        assert_eq!(routed.protocol, Protocol::Http);
        assert_eq!(routed.request_target, "http://origin:8080/ok");
        // 代理头覆盖目标 Host
        assert_eq!(routed.headers[HOST], "proxy-host");
        assert_eq!(routed.headers[PROXY_AUTHORIZATION], "Basic dGVzdA==");
        assert_eq!(routed.headers[USER_AGENT], "test-agent");

        let options = RequestOptions::new()
            .header(HOST, HeaderValue::from_static("caller-host"));
        let routed = route_str("http://origin:8080/ok", options, &proxy);
        assert_eq!(routed.headers[HOST], "caller-host");
    }

    #[test]
    fn test_http_route_host_from_target() {
        let routed = route_str("http://origin/ok", RequestOptions::new(), &HeaderMap::new());
        assert_eq!(routed.headers[HOST], "origin:80");
        assert_eq!(routed.headers[CONNECTION], "keep-alive");
    }

    #[test]
    fn test_caller_headers_replace_defaults() {
        let options = RequestOptions::new().header(ACCEPT, HeaderValue::from_static("text/plain"));
        let routed = route_str("http://origin/ok", options, &HeaderMap::new());
        assert_eq!(routed.headers[ACCEPT], "text/plain");
        assert!(!routed.headers.contains_key(USER_AGENT));
    }

    #[test]
    fn test_https_route_skips_proxy_headers() {
        let mut proxy = HeaderMap::new();
        proxy.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic dGVzdA=="));

        let routed = route_str("https://origin/ok?x=1", RequestOptions::new(), &proxy);
        assert_eq!(routed.protocol, Protocol::Https);
        assert_eq!(routed.request_target, "/ok?x=1");
        assert_eq!(routed.headers[HOST], "origin");
        assert!(!routed.headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_connection_close_without_keep_alive() {
        let defaults = defaults();
        let proxy = HeaderMap::new();
        let context = RouteContext {
            plain_keep_alive: false,
            ..ctx(&proxy, &defaults)
        };
        let target = TargetUri::parse("http://origin/").unwrap();
        let routed = route(&target, &RequestOptions::new(), &context).unwrap();
        assert_eq!(routed.headers[CONNECTION], "close");
    }

    #[test]
    fn test_get_with_body_gets_content_length() {
        let routed = route_str(
            "http://origin/ok",
            RequestOptions::new().body("hello"),
            &HeaderMap::new(),
        );
        assert_eq!(routed.method, Method::GET);
        assert_eq!(routed.headers[CONTENT_LENGTH], "5");
        assert!(!routed.headers.contains_key(TRANSFER_ENCODING));
    }

    #[test]
    fn test_stream_body_gets_chunked() {
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(b"a"))]);
        let routed = route_str(
            "http://origin/ok",
            RequestOptions::new().body(Body::wrap_stream(stream)),
            &HeaderMap::new(),
        );
        assert_eq!(routed.headers[TRANSFER_ENCODING], "chunked");
        assert!(!routed.headers.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn test_empty_post_sends_zero_length() {
        let routed = route_str(
            "http://origin/ok",
            RequestOptions::new().method(Method::POST),
            &HeaderMap::new(),
        );
        assert_eq!(routed.headers[CONTENT_LENGTH], "0");

        let routed = route_str("http://origin/ok", RequestOptions::new(), &HeaderMap::new());
        assert!(!routed.headers.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn test_explicit_length_is_kept() {
        let options = RequestOptions::new()
            .header(CONTENT_LENGTH, HeaderValue::from_static("3"))
            .body("abc");
        let routed = route_str("http://origin/ok", options, &HeaderMap::new());
        assert_eq!(routed.headers[CONTENT_LENGTH], "3");
    }
}
