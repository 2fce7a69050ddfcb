use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "forward-proxy-tunnel")]
#[command(author, version, about = "Send one HTTP/HTTPS request through a forward HTTP proxy", long_about = None)]
pub struct Cli {
    /// 代理地址（http://[user:pass@]host:port），默认读取 HTTPS_PROXY / HTTP_PROXY
    #[arg(long)]
    pub proxy: Option<String>,

    /// 请求方法
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// 请求头，格式 "Name: value"，可重复
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// 发往代理的头，格式 "Name: value"，可重复
    #[arg(long = "proxy-header", value_name = "HEADER")]
    pub proxy_headers: Vec<String>,

    /// 请求体；以 @ 开头时读取文件
    #[arg(short, long)]
    pub data: Option<String>,

    /// 跳过证书验证（仅用于测试）
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// 额外信任的 CA 证书（PEM）
    #[arg(long, value_name = "PATH")]
    pub ca_cert: Option<String>,

    /// 请求超时（秒）
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// 日志详细程度（-v info，-vv debug，-vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// 目标 URL
    pub url: String,
}

impl Cli {
    /// 代理地址：命令行优先，其次是环境变量
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy.clone().or_else(|| {
            ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"]
                .iter()
                .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
        })
    }
}
