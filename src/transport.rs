//! Dialing: address validation, direct and proxied TCP, TLS upgrade.
//!
//! Supports plaintext and TLS connections, optionally tunneled through
//! a SOCKS4/SOCKS5/HTTP proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

use crate::config::{Config, ProxyConfig, ProxyKind};
use crate::error::{Error, Result};

/// A live connection, replaced wholesale on reconnect.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Check `host:port` shape before any network activity.
pub(crate) fn validate_address(address: &str) -> Result<(String, u16)> {
    if address.is_empty() {
        return Err(Error::Config("empty server address".to_string()));
    }
    if address.starts_with(':') {
        return Err(Error::Config("hostname is missing".to_string()));
    }
    if address.ends_with(':') {
        return Err(Error::Config("port is missing".to_string()));
    }
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(Error::Config(format!("address '{address}' is missing a port")));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("port '{port}' outside the valid range")))?;
    Ok((host.to_string(), port))
}

/// Dial the server, through the configured proxy if any, and upgrade to
/// TLS when requested (or when the address uses the conventional TLS
/// port 6697). The whole dial is bounded by `config.timeout`.
pub(crate) async fn dial(config: &Config, address: &str) -> Result<Transport> {
    let (host, _port) = validate_address(address)?;
    let use_tls = config.use_tls || address.ends_with(":6697");
    let mode = if use_tls { "TLS" } else { "plain" };

    tracing::debug!(address, mode, "dialing");
    let tcp = tokio::time::timeout(config.timeout, dial_tcp(config, address))
        .await
        .map_err(|_| Error::Dial(format!("connect to {address} timed out")))??;
    tracing::debug!(address, mode, "TCP connected");

    if !use_tls {
        return Ok(Transport::Plain(tcp));
    }

    let tls_config = if config.tls_insecure {
        tracing::debug!("TLS: insecure mode (skipping cert verification)");
        rustls_insecure_config()
    } else {
        rustls_default_config()
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(host)
        .map_err(|e| Error::Dial(format!("invalid TLS server name: {e}")))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Dial(format!("TLS handshake with {address} failed: {e}")))?;
    tracing::debug!("TLS handshake complete");
    Ok(Transport::Tls(Box::new(stream)))
}

async fn dial_tcp(config: &Config, address: &str) -> Result<TcpStream> {
    let Some(proxy) = &config.proxy else {
        return dial_direct(config, address).await;
    };
    match proxy.kind {
        ProxyKind::Socks5 => {
            let stream = if proxy.username.is_empty() {
                Socks5Stream::connect(proxy.address.as_str(), address).await
            } else {
                Socks5Stream::connect_with_password(
                    proxy.address.as_str(),
                    address,
                    &proxy.username,
                    &proxy.password,
                )
                .await
            }
            .map_err(|e| Error::Dial(format!("SOCKS5 proxy {}: {e}", proxy.address)))?;
            Ok(stream.into_inner())
        }
        ProxyKind::Socks4 => {
            let stream = if proxy.username.is_empty() {
                Socks4Stream::connect(proxy.address.as_str(), address).await
            } else {
                Socks4Stream::connect_with_userid(
                    proxy.address.as_str(),
                    address,
                    &proxy.username,
                )
                .await
            }
            .map_err(|e| Error::Dial(format!("SOCKS4 proxy {}: {e}", proxy.address)))?;
            Ok(stream.into_inner())
        }
        ProxyKind::Http => http_connect(proxy, address).await,
    }
}

async fn dial_direct(config: &Config, address: &str) -> Result<TcpStream> {
    match config.local_ip {
        None => TcpStream::connect(address)
            .await
            .map_err(|e| Error::Dial(format!("TCP connect to {address} failed: {e}"))),
        Some(ip) => {
            let target = lookup_host(address)
                .await
                .map_err(|e| Error::Dial(format!("resolving {address} failed: {e}")))?
                .find(|a| a.is_ipv4() == ip.is_ipv4())
                .ok_or_else(|| Error::Dial(format!("no usable address for {address}")))?;
            let socket = if ip.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(Error::Io)?;
            socket.bind(SocketAddr::new(ip, 0)).map_err(Error::Io)?;
            socket
                .connect(target)
                .await
                .map_err(|e| Error::Dial(format!("TCP connect to {address} failed: {e}")))
        }
    }
}

/// Minimal HTTP CONNECT exchange. Reads the response headers byte by
/// byte so nothing the server sends after the tunnel opens is consumed.
async fn http_connect(proxy: &ProxyConfig, target: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(&proxy.address)
        .await
        .map_err(|e| Error::Dial(format!("HTTP proxy {}: {e}", proxy.address)))?;

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if !proxy.username.is_empty() {
        use base64::Engine;
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", proxy.username, proxy.password));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::Dial(format!("HTTP proxy {}: {e}", proxy.address)))?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| Error::Dial(format!("HTTP proxy {}: {e}", proxy.address)))?;
        if n == 0 {
            return Err(Error::Dial("HTTP proxy closed during CONNECT".to_string()));
        }
        head.push(byte[0]);
        if head.len() > 8192 {
            return Err(Error::Dial("oversized HTTP CONNECT response".to_string()));
        }
    }
    let head = String::from_utf8_lossy(&head);
    let status = head.lines().next().unwrap_or("");
    if !status.contains(" 200") {
        return Err(Error::Dial(format!("HTTP CONNECT refused: {status}")));
    }
    Ok(stream)
}

fn install_crypto_provider() {
    // ring is preferred where available; aws-lc-rs is the desktop default.
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(validate_address("irc.example.org:6667").is_ok());
        assert_eq!(
            validate_address("127.0.0.1:6697").unwrap(),
            ("127.0.0.1".to_string(), 6697)
        );

        assert!(matches!(validate_address(""), Err(Error::Config(_))));
        assert!(matches!(validate_address(":6667"), Err(Error::Config(_))));
        assert!(matches!(
            validate_address("irc.example.org:"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            validate_address("irc.example.org"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            validate_address("irc.example.org:notaport"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            validate_address("irc.example.org:70000"),
            Err(Error::Config(_))
        ));
    }
}
