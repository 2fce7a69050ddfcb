use anyhow::{Context, Result};
use clap::Parser;
use forward_proxy_tunnel::cli::Cli;
use forward_proxy_tunnel::config::{parse_header_line, PoolConfig, TunnelOptions};
use forward_proxy_tunnel::{Body, ProxyTunnel, RequestOptions};
use http::Method;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Forward Proxy Tunnel v{}", env!("CARGO_PKG_VERSION"));

    let proxy = cli
        .proxy_url()
        .context("No proxy configured, pass --proxy or set HTTPS_PROXY / HTTP_PROXY")?;

    let mut options = TunnelOptions {
        pool: PoolConfig::from_env(),
        tunnel_pool: PoolConfig::from_env(),
        ..Default::default()
    };
    options.tls.danger_accept_invalid_certs = cli.insecure;
    options.tls.ca_cert_path = cli.ca_cert.as_ref().map(Into::into);
    for line in &cli.proxy_headers {
        let (name, value) = parse_header_line(line)?;
        options.proxy_headers.append(name, value);
    }

    let client = ProxyTunnel::new(&proxy, options)
        .with_context(|| format!("Failed to create client for proxy {}", proxy))?;

    let result = run(&client, &cli).await;
    client.destroy();
    result
}

/// 发送请求，响应头打印到 stderr，响应体写到 stdout
async fn run(client: &ProxyTunnel, cli: &Cli) -> Result<()> {
    let method = Method::from_bytes(cli.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid method: {}", cli.method))?;

    // 命令行的请求头叠加在默认头之上
    let mut headers = client.default_headers().clone();
    for line in &cli.headers {
        let (name, value) = parse_header_line(line)?;
        headers.insert(name, value);
    }

    let mut options = RequestOptions::new().method(method).headers(headers);
    if let Some(data) = &cli.data {
        options = options.body(match data.strip_prefix('@') {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open request body file: {}", path))?;
                Body::from_reader(file)
            }
            None => Body::from(data.clone()),
        });
    }
    if let Some(secs) = cli.timeout {
        options = options.timeout(Duration::from_secs(secs));
    }

    let mut response = client
        .fetch(&cli.url, options)
        .await
        .with_context(|| format!("Request to {} failed", cli.url))?;

    eprintln!(
        "{:?} {} {}",
        response.version(),
        response.status().as_u16(),
        response.status_message()
    );
    for (name, value) in response.headers() {
        eprintln!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    eprintln!();

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = response.chunk().await? {
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;
    Ok(())
}
