use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower_service::Service;
use url::Url;

use crate::error::{Error, error_chain_text};
use crate::message::{PreparedRequest, RecordedResponse};
use crate::options::ClientOptions;

type BoxConnectError = Box<dyn std::error::Error + Send + Sync>;

/// What a dispatch hands back: the buffered response (body still encoded)
/// and the observed time-to-first-byte.
#[derive(Clone, Debug)]
pub struct TransportReply {
    pub response: RecordedResponse,
    pub ttfb: Option<Duration>,
}

/// The wire-level request executor the engine schedules onto.
///
/// The engine owns scheduling, post-processing and accounting; connect,
/// TLS, write and read belong behind this seam. Tests substitute scripted
/// implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(
        &self,
        request: &PreparedRequest,
        timeout: Duration,
    ) -> crate::Result<TransportReply>;
}

/// Certificate verification is intentionally disabled: a recon engine has
/// to talk to staging hosts, IP literals and deliberately broken TLS.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
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
        cert: &rustls::pki_types::CertificateDer<'_>,
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
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn insecure_tls_config() -> crate::Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|error| Error::TlsConfig {
            message: error.to_string(),
        })?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(provider)))
        .with_no_client_auth();
    Ok(config)
}

/// Dials targets directly or through a CONNECT tunnel when a proxy URL is
/// configured.
#[derive(Clone)]
pub(crate) struct EgressConnector {
    direct: HttpConnector,
    tunnel: Option<Tunnel<HttpConnector>>,
}

impl EgressConnector {
    fn new(proxy_uri: Option<Uri>, connect_timeout: Duration) -> Self {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        direct.set_connect_timeout(Some(connect_timeout));
        let tunnel = proxy_uri.map(|uri| Tunnel::new(uri, direct.clone()));
        Self { direct, tunnel }
    }
}

impl Service<Uri> for EgressConnector {
    type Response = <HttpConnector as Service<Uri>>::Response;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if let Some(tunnel) = &mut self.tunnel {
            return match tunnel.poll_ready(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
                Poll::Pending => Poll::Pending,
            };
        }
        match self.direct.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        if let Some(tunnel) = &mut self.tunnel {
            let connecting = tunnel.call(normalize_tunnel_target(dst));
            return Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) });
        }
        let connecting = self.direct.call(dst);
        Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) })
    }
}

/// CONNECT targets need an explicit port; fill in the scheme default.
fn normalize_tunnel_target(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }
    let default_port = match dst.scheme_str() {
        Some("https") => 443,
        Some("http") => 80,
        _ => return dst,
    };
    let Some(host) = dst.host() else {
        return dst;
    };
    let authority_text = format!("{host}:{default_port}");
    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}

type EgressHttpsConnector = hyper_rustls::HttpsConnector<EgressConnector>;

/// Shared hyper-backed transport. Per-SNI overrides allocate a throwaway
/// instance via [`HyperTransport::from_options`]; the shared instance is
/// never mutated after construction.
pub struct HyperTransport {
    client: HyperClient<EgressHttpsConnector, Full<Bytes>>,
}

impl HyperTransport {
    pub fn from_options(options: &ClientOptions) -> crate::Result<Self> {
        let connect_timeout = Duration::from_secs(options.performance.timeout.max(1));
        let proxy_uri = match &options.connection.proxy_url {
            Some(raw) if !raw.is_empty() => {
                Some(raw.parse::<Uri>().map_err(|_| Error::InvalidUrl {
                    url: raw.clone(),
                })?)
            }
            _ => None,
        };
        let connector = EgressConnector::new(proxy_uri, connect_timeout);
        let tls_config = insecure_tls_config()?;

        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http();
        let builder = match &options.connection.sni {
            Some(sni) if !sni.is_empty() => {
                let server_name =
                    ServerName::try_from(sni.clone()).map_err(|_| Error::TlsConfig {
                        message: format!("invalid sni override: {sni}"),
                    })?;
                builder.with_server_name_resolver(hyper_rustls::FixedServerNameResolver::new(
                    server_name,
                ))
            }
            _ => builder,
        };

        let https: EgressHttpsConnector = if options.connection.force_http2 {
            builder.enable_http2().wrap_connector(connector)
        } else if options.connection.force_http1 {
            builder.enable_http1().wrap_connector(connector)
        } else {
            builder.enable_all_versions().wrap_connector(connector)
        };

        let mut client_builder = HyperClient::builder(TokioExecutor::new());
        if options.connection.disable_keep_alives {
            client_builder.pool_max_idle_per_host(0);
        }
        if options.connection.force_http2 {
            client_builder.http2_only(true);
        }
        let client = client_builder.build(https);

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn dispatch(
        &self,
        request: &PreparedRequest,
        timeout: Duration,
    ) -> crate::Result<TransportReply> {
        let url_text = request.url.to_string();
        let uri: Uri = url_text.parse().map_err(|_| Error::InvalidUrl {
            url: url_text.clone(),
        })?;

        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(uri);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let http_request =
            builder
                .body(Full::new(request.body.clone()))
                .map_err(|error| Error::Transport {
                    method: request.method.clone(),
                    url: url_text.clone(),
                    message: error.to_string(),
                })?;

        let started = Instant::now();
        let response = match tokio::time::timeout(timeout, self.client.request(http_request)).await
        {
            Err(_) => {
                return Err(Error::Timeout {
                    timeout_ms: timeout.as_millis(),
                    method: request.method.clone(),
                    url: url_text,
                });
            }
            Ok(Err(error)) => {
                return Err(Error::Transport {
                    method: request.method.clone(),
                    url: url_text,
                    message: error_chain_text(&error),
                });
            }
            Ok(Ok(response)) => response,
        };
        let ttfb = started.elapsed();

        let (parts, body) = response.into_parts();
        let remaining = timeout.saturating_sub(started.elapsed());
        let bytes = match tokio::time::timeout(remaining, body.collect()).await {
            Err(_) => {
                return Err(Error::Timeout {
                    timeout_ms: timeout.as_millis(),
                    method: request.method.clone(),
                    url: url_text,
                });
            }
            Ok(Err(error)) => {
                return Err(Error::Transport {
                    method: request.method.clone(),
                    url: url_text,
                    message: error_chain_text(&error),
                });
            }
            Ok(Ok(collected)) => collected.to_bytes(),
        };

        Ok(TransportReply {
            response: RecordedResponse {
                status: parts.status,
                headers: parts.headers,
                body: bytes,
                version: parts.version,
            },
            ttfb: Some(ttfb),
        })
    }
}

/// Sends caller-provided raw request bytes verbatim over TCP (TLS for
/// https) and parses the response off the wire. No header fixups, no
/// normalization; byte-level control is the point.
pub struct RawTransport {
    tls_config: Arc<rustls::ClientConfig>,
}

impl RawTransport {
    pub(crate) fn new() -> crate::Result<Self> {
        Ok(Self {
            tls_config: Arc::new(insecure_tls_config()?),
        })
    }

    pub(crate) async fn dispatch_raw(
        &self,
        raw: &str,
        url: &Url,
        timeout: Duration,
    ) -> crate::Result<RecordedResponse> {
        let url_text = url.to_string();
        let dispatch = self.dispatch_raw_inner(raw, url);
        match tokio::time::timeout(timeout, dispatch).await {
            Err(_) => Err(Error::Timeout {
                timeout_ms: timeout.as_millis(),
                method: http::Method::GET,
                url: url_text,
            }),
            Ok(result) => result,
        }
    }

    async fn dispatch_raw_inner(&self, raw: &str, url: &Url) -> crate::Result<RecordedResponse> {
        let url_text = url.to_string();
        let raw_error = |message: String| Error::RawTransport {
            url: url_text.clone(),
            message,
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl {
                url: url_text.clone(),
            })?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(80);

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|error| raw_error(error.to_string()))?;

        let buffer = if url.scheme() == "https" {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| raw_error(format!("invalid tls server name: {host}")))?;
            let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.tls_config));
            let mut tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|error| raw_error(format!("tls handshake: {error}")))?;
            write_and_read(&mut tls_stream, raw.as_bytes())
                .await
                .map_err(raw_error)?
        } else {
            let mut stream = stream;
            write_and_read(&mut stream, raw.as_bytes())
                .await
                .map_err(raw_error)?
        };

        parse_raw_response(&buffer).map_err(raw_error)
    }
}

async fn write_and_read<S>(stream: &mut S, raw: &[u8]) -> Result<Vec<u8>, String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream
        .write_all(raw)
        .await
        .map_err(|error| error.to_string())?;
    stream.flush().await.map_err(|error| error.to_string())?;

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|error| error.to_string())?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if raw_response_complete(&buffer) {
            break;
        }
    }
    if buffer.is_empty() {
        return Err("connection closed before any response bytes".to_owned());
    }
    Ok(buffer)
}

fn split_head(buffer: &[u8]) -> Option<(&[u8], &[u8])> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| (&buffer[..index], &buffer[index + 4..]))
}

fn raw_response_complete(buffer: &[u8]) -> bool {
    let Some((head, body)) = split_head(buffer) else {
        return false;
    };
    let head_text = String::from_utf8_lossy(head);
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in head_text.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name == "content-length" {
            content_length = value.parse().ok();
        } else if name == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
            chunked = true;
        }
    }
    if chunked {
        return body.ends_with(b"0\r\n\r\n");
    }
    match content_length {
        Some(length) => body.len() >= length,
        None => false,
    }
}

fn parse_raw_response(buffer: &[u8]) -> Result<RecordedResponse, String> {
    let (head, body) = split_head(buffer).ok_or("malformed response: missing header terminator")?;
    let head_text =
        std::str::from_utf8(head).map_err(|_| "malformed response: non-utf8 header block")?;
    let mut lines = head_text.lines();
    let status_line = lines.next().ok_or("malformed response: empty status line")?;

    let mut status_parts = status_line.splitn(3, ' ');
    let version = match status_parts.next().unwrap_or_default() {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/2" | "HTTP/2.0" => Version::HTTP_2,
        other => return Err(format!("malformed response: unknown version {other}")),
    };
    let status = status_parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or("malformed response: invalid status code")?;

    let mut headers = HeaderMap::new();
    let mut chunked = false;
    let mut content_length: Option<usize> = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name_text = name.trim();
        let value_text = value.trim();
        if name_text.eq_ignore_ascii_case("transfer-encoding")
            && value_text.eq_ignore_ascii_case("chunked")
        {
            chunked = true;
        }
        if name_text.eq_ignore_ascii_case("content-length") {
            content_length = value_text.parse().ok();
        }
        if let (Ok(name), Ok(value)) = (
            name_text.parse::<HeaderName>(),
            HeaderValue::from_str(value_text),
        ) {
            headers.append(name, value);
        }
    }

    let body = if chunked {
        dechunk(body)?
    } else {
        match content_length {
            Some(length) if body.len() > length => body[..length].to_vec(),
            _ => body.to_vec(),
        }
    };

    Ok(RecordedResponse {
        status,
        headers,
        body: Bytes::from(body),
        version,
    })
}

fn dechunk(mut body: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoded = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|window| window == b"\r\n")
            .ok_or("malformed chunked body: missing size line")?;
        let size_text = std::str::from_utf8(&body[..line_end])
            .map_err(|_| "malformed chunked body: non-utf8 size line")?;
        let size = usize::from_str_radix(size_text.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| format!("malformed chunked body: bad chunk size {size_text:?}"))?;
        body = &body[line_end + 2..];
        if size == 0 {
            break;
        }
        if body.len() < size {
            return Err("malformed chunked body: truncated chunk".to_owned());
        }
        decoded.extend_from_slice(&body[..size]);
        body = &body[size..];
        if body.starts_with(b"\r\n") {
            body = &body[2..];
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::{dechunk, normalize_tunnel_target, parse_raw_response, raw_response_complete};

    #[test]
    fn parses_a_plain_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let response = parse_raw_response(raw).expect("parse");
        assert_eq!(response.status, http::StatusCode::OK);
        assert_eq!(response.body.as_ref(), b"hello");
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "text/plain"
        );
    }

    #[test]
    fn parses_a_chunked_response() {
        let raw =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let response = parse_raw_response(raw).expect("parse");
        assert_eq!(response.body.as_ref(), b"hello world");
    }

    #[test]
    fn dechunk_rejects_truncated_chunks() {
        assert!(dechunk(b"a\r\nshort\r\n").is_err());
    }

    #[test]
    fn completion_honors_content_length() {
        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello";
        assert!(!raw_response_complete(partial));
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert!(raw_response_complete(full));
    }

    #[test]
    fn excess_bytes_beyond_content_length_are_trimmed() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloTRAILING";
        let response = parse_raw_response(raw).expect("parse");
        assert_eq!(response.body.as_ref(), b"hello");
    }

    #[test]
    fn tunnel_targets_get_default_ports() {
        let uri: http::Uri = "https://example.com/path".parse().unwrap();
        let normalized = normalize_tunnel_target(uri);
        assert_eq!(normalized.authority().unwrap().as_str(), "example.com:443");

        let uri: http::Uri = "http://example.com:8080/".parse().unwrap();
        let normalized = normalize_tunnel_target(uri);
        assert_eq!(normalized.authority().unwrap().as_str(), "example.com:8080");
    }
}
