//! Proxy-aware HTTPS connector using rustls.
//!
//! Without a proxy, connections go straight to the destination. With a
//! proxy, plain `http` destinations are forwarded (requests are sent to the
//! proxy in absolute form) and `https` destinations are tunnelled with
//! `CONNECT`. TLS is layered on top by `hyper-rustls`, presenting the
//! configured client certificates.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use derive_more::{Display, Error};
use http::{HeaderValue, Uri};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use rustls::SignatureScheme;
use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use tokio::net::TcpStream;
use tower::ServiceExt;
use tower_service::Service;

use crate::transport::CredentialCell;
use crate::{ClientCertificate, ProxyConfig};

/// Create the HTTPS connector for a transport.
pub(crate) fn https_connector(
    certificates: &[ClientCertificate],
    proxy: Option<ProxyRoute>,
    connect_timeout: Duration,
) -> HttpsConnector<ProxyConnector> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));

    let connector = ProxyConnector {
        http,
        proxy: proxy.map(Arc::new),
        connect_timeout,
    };

    HttpsConnectorBuilder::new()
        .with_tls_config(tls_config(certificates))
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(connector)
}

fn tls_config(certificates: &[ClientCertificate]) -> rustls::ClientConfig {
    let root_store: rustls::RootCertStore =
        webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

    let keys: Vec<Arc<CertifiedKey>> = certificates
        .iter()
        .enumerate()
        .filter_map(|(index, certificate)| match certificate.certified_key() {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::warn!(index, error = %err, "skipping client certificate");
                None
            }
        })
        .collect();

    if keys.is_empty() {
        builder.with_no_client_auth()
    } else {
        builder.with_client_cert_resolver(Arc::new(ClientCertificateResolver { keys }))
    }
}

/// Presents the first configured certificate whose key can sign with one of
/// the schemes the server offers.
#[derive(Debug)]
struct ClientCertificateResolver {
    keys: Vec<Arc<CertifiedKey>>,
}

impl ResolvesClientCert for ClientCertificateResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.keys
            .iter()
            .find(|key| key.key.choose_scheme(sigschemes).is_some())
            .cloned()
    }

    fn has_certs(&self) -> bool {
        !self.keys.is_empty()
    }
}

/// Proxy used by a transport, with the credentials cell it authenticates with.
#[derive(Debug)]
pub(crate) struct ProxyRoute {
    config: ProxyConfig,
    uri: Uri,
    credentials: Arc<CredentialCell>,
}

impl ProxyRoute {
    /// Returns `None` when the proxy address is not a valid URI.
    pub(crate) fn new(config: ProxyConfig, credentials: Arc<CredentialCell>) -> Option<Self> {
        let uri = config.uri().as_str().parse::<Uri>().ok()?;
        Some(Self {
            config,
            uri,
            credentials,
        })
    }

    /// Returns `true` if connections to `dst` go through the proxy.
    pub(crate) fn applies_to(&self, dst: &url::Url) -> bool {
        !self.config.is_bypassed(dst)
    }

    fn applies_to_uri(&self, dst: &Uri) -> bool {
        url::Url::parse(&dst.to_string()).is_ok_and(|dst| self.applies_to(&dst))
    }
}

/// Errors raised while connecting, possibly through a proxy.
#[derive(Debug, Display, Error)]
pub(crate) enum TunnelError {
    /// TCP connection failed.
    #[display("could not connect to {target}: {message}")]
    Connect { target: String, message: String },

    /// The proxy answered `CONNECT` with 407.
    #[display("proxy {proxy} requires authentication")]
    ProxyAuthenticationRequired { proxy: String },

    /// The proxy refused or broke off the `CONNECT` handshake.
    #[display("proxy {proxy} refused tunnel: {reason}")]
    Refused { proxy: String, reason: String },

    /// Connecting or tunnelling took longer than the connect timeout.
    #[display("timed out connecting to {_0}")]
    Timeout(#[error(not(source))] String),

    /// I/O failure while talking to the proxy.
    #[display("proxy tunnel I/O error: {_0}")]
    Io(io::Error),
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl TunnelError {
    /// Classify a failed `CONNECT` handshake.
    ///
    /// hyper-util keeps its tunnel error type private; its `Debug` output is
    /// the variant name.
    fn from_handshake<E>(err: &E, proxy: String) -> Self
    where
        E: std::error::Error,
    {
        let variant = format!("{err:?}");
        if variant == "ProxyAuthRequired" {
            return Self::ProxyAuthenticationRequired { proxy };
        }
        let mut reason = err.to_string();
        if let Some(source) = err.source() {
            reason = format!("{reason}: {source}");
        }
        if variant.starts_with("ConnectFailed") {
            Self::Connect {
                target: proxy,
                message: reason,
            }
        } else {
            Self::Refused { proxy, reason }
        }
    }

    pub(crate) fn to_error(&self) -> crate::Error {
        match self {
            Self::ProxyAuthenticationRequired { proxy } => {
                crate::Error::proxy_authentication_required(proxy.clone())
            }
            Self::Timeout(_) => crate::Error::Timeout,
            other => crate::Error::connection(other.to_string()),
        }
    }
}

/// TCP connector that routes through a proxy when one is configured.
#[derive(Debug, Clone)]
pub(crate) struct ProxyConnector {
    http: HttpConnector,
    proxy: Option<Arc<ProxyRoute>>,
    connect_timeout: Duration,
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyStream;
    type Error = TunnelError;
    type Future = Pin<Box<dyn Future<Output = Result<ProxyStream, TunnelError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // HttpConnector is always ready.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut http = self.http.clone();
        let connect_timeout = self.connect_timeout;
        let route = self
            .proxy
            .clone()
            .filter(|route| route.applies_to_uri(&dst));

        Box::pin(async move {
            let Some(route) = route else {
                let io = connect(&mut http, dst).await?;
                return Ok(ProxyStream::new(io, false));
            };

            if dst.scheme() != Some(&http::uri::Scheme::HTTPS) {
                let io = connect(&mut http, route.uri.clone()).await?;
                return Ok(ProxyStream::new(io, true));
            }

            let io = tokio::time::timeout(connect_timeout, tunnel(http, dst, &route))
                .await
                .map_err(|_| TunnelError::Timeout(route.config.address()))??;
            Ok(ProxyStream::new(io, false))
        })
    }
}

async fn connect(http: &mut HttpConnector, target: Uri) -> Result<TokioIo<TcpStream>, TunnelError> {
    http.call(target.clone())
        .await
        .map_err(|err| TunnelError::Connect {
            target: target.to_string(),
            message: err.to_string(),
        })
}

/// Open a `CONNECT` tunnel to `dst` through the route's proxy.
async fn tunnel(
    http: HttpConnector,
    dst: Uri,
    route: &ProxyRoute,
) -> Result<TokioIo<TcpStream>, TunnelError> {
    let proxy = route.config.address();
    let mut connector = Tunnel::new(route.uri.clone(), http);
    if let Some(credentials) = route.credentials.get() {
        let value = HeaderValue::try_from(credentials.basic_authorization()).map_err(|err| {
            TunnelError::Refused {
                proxy: proxy.clone(),
                reason: format!("unusable proxy credentials: {err}"),
            }
        })?;
        connector = connector.with_auth(value);
    }

    let authority = dst.authority().map(ToString::to_string).unwrap_or_default();
    let io = connector
        .oneshot(dst)
        .await
        .map_err(|err| TunnelError::from_handshake(&err, proxy.clone()))?;
    tracing::debug!(%proxy, %authority, "proxy tunnel established");
    Ok(io)
}

/// Connection produced by [`ProxyConnector`].
///
/// Marked as proxied when requests must be written in absolute form.
#[derive(Debug)]
pub(crate) struct ProxyStream {
    io: TokioIo<TcpStream>,
    forwarded: bool,
}

impl ProxyStream {
    fn new(io: TokioIo<TcpStream>, forwarded: bool) -> Self {
        Self { io, forwarded }
    }
}

impl Connection for ProxyStream {
    fn connected(&self) -> Connected {
        self.io.connected().proxy(self.forwarded)
    }
}

impl Read for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::Credentials;

    fn route(proxy: &str, credentials: Option<Credentials>) -> ProxyRoute {
        let config = ProxyConfig::new(url::Url::parse(proxy).expect("url")).with_bypass(["localhost"]);
        ProxyRoute::new(config, Arc::new(CredentialCell::new(credentials))).expect("route")
    }

    /// Accept one connection, capture the CONNECT head and answer with `reply`.
    async fn fake_proxy(reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = format!("http://{}", listener.local_addr().expect("addr"));
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            let mut chunk = [0_u8; 256];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = socket.read(&mut chunk).await.expect("read");
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..read]);
            }
            socket.write_all(reply.as_bytes()).await.expect("write");
            String::from_utf8(received).expect("utf8")
        });
        (address, handle)
    }

    #[test]
    fn connector_builds_with_and_without_proxy() {
        let _direct = https_connector(&[], None, Duration::from_secs(1));
        let _proxied = https_connector(
            &[],
            Some(route("http://proxy.corp:3128", None)),
            Duration::from_secs(1),
        );
    }

    #[test]
    fn bypassed_destinations_skip_the_proxy() {
        let route = route("http://proxy.corp:3128", None);

        assert!(route.applies_to_uri(&Uri::from_static("https://feed.example/v3/index.json")));
        assert!(!route.applies_to_uri(&Uri::from_static("http://localhost:5000/")));
    }

    #[tokio::test]
    async fn tunnel_sends_connect_with_credentials() {
        let (address, proxy) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let route = route(&address, Some(Credentials::new("user", "pass")));

        let dst = Uri::from_static("https://feed.example/v3/index.json");
        let io = tunnel(HttpConnector::new(), dst, &route).await;

        assert!(io.is_ok());
        let head = proxy.await.expect("proxy task");
        assert!(head.starts_with("CONNECT feed.example:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn tunnel_reports_proxy_challenge() {
        let (address, proxy) = fake_proxy(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n",
        )
        .await;
        let route = route(&address, None);

        let dst = Uri::from_static("https://feed.example:8443/");
        let err = tunnel(HttpConnector::new(), dst, &route)
            .await
            .expect_err("407");

        assert!(matches!(err, TunnelError::ProxyAuthenticationRequired { .. }));
        assert!(err.to_error().is_proxy_authentication_required());

        let head = proxy.await.expect("proxy task");
        assert!(head.starts_with("CONNECT feed.example:8443 HTTP/1.1\r\n"));
        assert!(!head.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn tunnel_reports_refusal() {
        let (address, _proxy) = fake_proxy("HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let route = route(&address, None);

        let dst = Uri::from_static("https://blocked.example/");
        let err = tunnel(HttpConnector::new(), dst, &route)
            .await
            .expect_err("403");

        assert!(matches!(err, TunnelError::Refused { .. }));
        assert!(err.to_error().is_connection());
    }

    #[tokio::test]
    async fn unreachable_proxy_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = format!("http://{}", listener.local_addr().expect("addr"));
        drop(listener);
        let route = route(&address, None);

        let err = tunnel(HttpConnector::new(), Uri::from_static("https://feed.example/"), &route)
            .await
            .expect_err("refused");

        assert!(matches!(err, TunnelError::Connect { .. }));
        assert!(err.to_error().is_connection());
    }
}
