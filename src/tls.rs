use crate::config::TlsOptions;
use crate::error::{Result, TunnelError};
use rustls::pki_types::{CertificateDer, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{rustls, TlsConnector};
use tracing::{debug, warn};

/// 隧道内只说 HTTP/1.1
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// 按选项构建 TLS 连接器
///
/// 提供了现成的 rustls 配置时直接使用，否则加载系统或指定的 CA 证书
pub fn build_connector(options: &TlsOptions) -> Result<TlsConnector> {
    let config = match &options.client_config {
        Some(config) => config.clone(),
        None => load_client_config_with_alpn(
            options.ca_cert_path.as_deref(),
            options.danger_accept_invalid_certs,
            Some(vec![ALPN_HTTP11.to_vec()]),
        )?,
    };
    Ok(TlsConnector::from(config))
}

/// 加载客户端 TLS 配置，支持ALPN
pub fn load_client_config_with_alpn(
    ca_cert_path: Option<&Path>,
    skip_verify: bool,
    alpn_protocols: Option<Vec<Vec<u8>>>,
) -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();

    if let Some(ca_path) = ca_cert_path {
        // 加载自定义 CA 证书
        let ca_file = File::open(ca_path).map_err(|e| {
            TunnelError::config_error(format!("Failed to open CA cert file {:?}: {}", ca_path, e))
        })?;
        let mut ca_reader = BufReader::new(ca_file);
        let ca_certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut ca_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                TunnelError::config_error(format!("Failed to parse CA certificates: {}", e))
            })?;

        for cert in ca_certs {
            root_store.add(cert).map_err(|e| {
                TunnelError::config_error(format!("Failed to add CA certificate: {}", e))
            })?;
        }
    } else if !skip_verify {
        // 使用系统 CA 证书
        let native_certs = rustls_native_certs::load_native_certs();
        for err in &native_certs.errors {
            warn!("Failed to load a native certificate: {}", err);
        }
        let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
        debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    // 如果跳过证书验证（仅用于测试）
    if skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    // 设置 ALPN 协议
    if let Some(protocols) = alpn_protocols {
        config.alpn_protocols = protocols;
    }

    Ok(Arc::new(config))
}

/// TLS 服务器名，IPv6 地址去掉方括号
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| TunnelError::invalid_input(format!("invalid TLS server name {}: {}", host, e)))
}

/// 在已有的字节流上完成 TLS 客户端握手，以真实目标主机名作为服务器名
pub async fn handshake<S>(connector: &TlsConnector, host: &str, stream: S) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = server_name(host)?;
    connector
        .connect(name, stream)
        .await
        .map_err(|source| TunnelError::Tls {
            server_name: host.to_string(),
            source,
        })
}

/// 不验证证书的验证器（仅用于测试）
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
