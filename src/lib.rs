use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    num::ParseIntError,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

pub mod client;
pub mod metrics;
pub mod payload;
pub mod server;
pub mod stats;

/// ALPN token shared by the pusher client and the echo server.
pub const ALPN: &[u8] = b"quic-pusher";

/// Port assumed when the host argument carries none.
pub const DEFAULT_PORT: u16 = 6666;

/// Sessions may sit idle for most of a long send interval; keep them alive
/// well past any sane pacing gap.
const IDLE_TIMEOUT: Duration = Duration::from_secs(50 * 60);

/// Splits `host[:port]` into name and port. IPv6 literals must be bracketed
/// to carry a port (`[::1]:6666`); bare ones get the default port.
fn split_host_port(host: &str) -> Result<(&str, u16)> {
    if let Some(rest) = host.strip_prefix('[') {
        let (name, suffix) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unclosed '[' in {host}"))?;
        let port = match suffix.strip_prefix(':') {
            Some(port) => port.parse().context("parsing port")?,
            None if suffix.is_empty() => DEFAULT_PORT,
            None => return Err(anyhow!("expected ':' after ']' in {host}")),
        };
        return Ok((name, port));
    }
    if host.matches(':').count() > 1 {
        // bare IPv6 literal; any colon split would mangle the address
        return Ok((host, DEFAULT_PORT));
    }
    match host.rsplit_once(':') {
        Some((name, port)) => Ok((name, port.parse().context("parsing port")?)),
        None => Ok((host, DEFAULT_PORT)),
    }
}

/// Splits `host[:port]` and resolves it, unless an explicit IP override is given.
pub async fn lookup_host(host: &str, resolved: Option<IpAddr>) -> Result<(&str, SocketAddr)> {
    let (host_name, port) = split_host_port(host)?;
    let addr = match resolved {
        Some(ip) => SocketAddr::new(ip, port),
        None => tokio::net::lookup_host((host_name, port))
            .await
            .context("resolving host")?
            .next()
            .ok_or_else(|| anyhow!("no addresses found for {host_name}"))?,
    };

    Ok((host_name, addr))
}

/// Picks the local bind address for a session: an explicit override, or an
/// unspecified address of the remote's family with an ephemeral port.
pub fn local_addr_for(remote: SocketAddr, local_addr: Option<SocketAddr>) -> SocketAddr {
    local_addr.unwrap_or_else(|| {
        let unspec = if remote.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        SocketAddr::new(unspec, 0)
    })
}

pub fn bind_socket(
    addr: SocketAddr,
    send_buffer_size: usize,
    recv_buffer_size: usize,
) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("create socket")?;

    if addr.is_ipv6() {
        socket.set_only_v6(false).context("set_only_v6")?;
    }

    socket
        .bind(&socket2::SockAddr::from(addr))
        .context("binding endpoint")?;
    socket
        .set_send_buffer_size(send_buffer_size)
        .context("send buffer size")?;
    socket
        .set_recv_buffer_size(recv_buffer_size)
        .context("recv buffer size")?;

    let buf_size = socket.send_buffer_size().context("send buffer size")?;
    if buf_size < send_buffer_size {
        warn!(
            "Unable to set desired send buffer size. Desired: {}, Actual: {}",
            send_buffer_size, buf_size
        );
    }

    let buf_size = socket.recv_buffer_size().context("recv buffer size")?;
    if buf_size < recv_buffer_size {
        warn!(
            "Unable to set desired recv buffer size. Desired: {}, Actual: {}",
            recv_buffer_size, buf_size
        );
    }

    Ok(socket.into())
}

/// Parses a size with an optional binary SI suffix, e.g. `2k` or `10M`.
pub fn parse_byte_size(s: &str) -> Result<u64, ParseIntError> {
    let s = s.trim();

    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&s[..s.len() - 1], 1024),
        Some(b'm') | Some(b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g') | Some(b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(b't') | Some(b'T') => (&s[..s.len() - 1], 1024u64.pow(4)),
        _ => (s, 1),
    };

    Ok(digits.trim().parse::<u64>()? * multiplier)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", path.display()))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parsing private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Client-side TLS. Verification is skipped unless `auth` is set, in which
/// case the trust anchors come from the CA bundle; a certificate/key pair is
/// presented when given (mutual auth).
pub fn client_crypto(
    auth: bool,
    ca: &Path,
    client_cert: Option<(&Path, &Path)>,
    keylog: bool,
) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by provider")?;

    let builder = if auth {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(ca)? {
            roots.add(cert).context("adding CA certificate")?;
        }
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new(provider))
    };

    let mut crypto = match client_cert {
        Some((cert, key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .context("building client auth")?,
        None => builder.with_no_client_auth(),
    };
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    if keylog {
        crypto.key_log = Arc::new(rustls::KeyLogFile::new());
    }

    Ok(crypto)
}

/// Server-side TLS from PEM files, or a self-signed certificate for
/// `localhost` when none are given.
pub fn server_crypto(
    cert: Option<&Path>,
    key: Option<&Path>,
    keylog: bool,
) -> Result<rustls::ServerConfig> {
    let (cert_chain, key) = match (cert, key) {
        (Some(cert), Some(key)) => (load_certs(cert)?, load_key(key)?),
        _ => {
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
                .context("generating self-signed certificate")?;
            (
                vec![CertificateDer::from(cert.cert)],
                PrivatePkcs8KeyDer::from(cert.signing_key.serialize_der()).into(),
            )
        }
    };

    let provider = rustls::crypto::ring::default_provider();
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider.into())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by provider")?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("building server crypto")?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    if keylog {
        crypto.key_log = Arc::new(rustls::KeyLogFile::new());
    }

    Ok(crypto)
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(IDLE_TIMEOUT).context("idle timeout")?,
    ));
    Ok(transport)
}

pub fn client_config(crypto: rustls::ClientConfig) -> Result<quinn::ClientConfig> {
    let crypto = Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto).context("client crypto")?,
    );
    let mut config = quinn::ClientConfig::new(crypto);
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

pub fn server_config(crypto: rustls::ServerConfig) -> Result<quinn::ServerConfig> {
    let crypto = Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto).context("server crypto")?,
    );
    let mut config = quinn::ServerConfig::with_crypto(crypto);
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new(provider: Arc<rustls::crypto::CryptoProvider>) -> Arc<Self> {
        Arc::new(Self(provider))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_plain() {
        assert_eq!(parse_byte_size("1"), Ok(1));
        assert_eq!(parse_byte_size("1048576"), Ok(1048576));
    }

    #[test]
    fn byte_size_suffixes() {
        assert_eq!(parse_byte_size("2k"), Ok(2048));
        assert_eq!(parse_byte_size("2K"), Ok(2048));
        assert_eq!(parse_byte_size("1M"), Ok(1024 * 1024));
        assert_eq!(parse_byte_size("10G"), Ok(10 * 1024 * 1024 * 1024));
        assert_eq!(parse_byte_size("1T"), Ok(1024u64.pow(4)));
    }

    #[test]
    fn byte_size_whitespace() {
        assert_eq!(parse_byte_size(" 4 k "), Ok(4096));
    }

    #[test]
    fn byte_size_rejects_garbage() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("k").is_err());
        assert!(parse_byte_size("12x").is_err());
    }

    #[tokio::test]
    async fn lookup_host_with_override() {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let (name, addr) = lookup_host("example.invalid:4242", Some(ip)).await.unwrap();
        assert_eq!(name, "example.invalid");
        assert_eq!(addr, SocketAddr::new(ip, 4242));
    }

    #[tokio::test]
    async fn lookup_host_default_port() {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let (_, addr) = lookup_host("example.invalid", Some(ip)).await.unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn split_bracketed_ipv6() {
        assert_eq!(
            split_host_port("[2001:db8::1]:4433").unwrap(),
            ("2001:db8::1", 4433)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]").unwrap(),
            ("2001:db8::1", DEFAULT_PORT)
        );
        assert!(split_host_port("[2001:db8::1").is_err());
        assert!(split_host_port("[2001:db8::1]4433").is_err());
    }

    #[test]
    fn split_bare_ipv6_keeps_address_intact() {
        assert_eq!(split_host_port("::1").unwrap(), ("::1", DEFAULT_PORT));
        assert_eq!(
            split_host_port("2001:db8::1").unwrap(),
            ("2001:db8::1", DEFAULT_PORT)
        );
    }

    #[test]
    fn split_rejects_bad_port() {
        assert!(split_host_port("localhost:notaport").is_err());
    }

    #[test]
    fn local_addr_matches_remote_family() {
        let v4: SocketAddr = "192.0.2.1:6666".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:6666".parse().unwrap();
        assert!(local_addr_for(v4, None).is_ipv4());
        assert!(local_addr_for(v6, None).is_ipv6());

        let pinned: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        assert_eq!(local_addr_for(v4, Some(pinned)), pinned);
    }

    #[test]
    fn self_signed_server_crypto() {
        let crypto = server_crypto(None, None, false).unwrap();
        assert_eq!(crypto.alpn_protocols, vec![ALPN.to_vec()]);
    }
}
