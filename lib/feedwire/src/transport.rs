//! Transport base: the innermost handler of every pipeline.
//!
//! The transport owns the connection pool and the per-pipeline controls the
//! authentication layers adjust at request time: endpoint credentials and
//! proxy credentials. Each control carries a version counter so a layer can
//! tell whether another in-flight request already refreshed it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower_service::Service;
use url::Url;

use crate::config::TransportConfig;
use crate::connector::{ProxyConnector, ProxyRoute, TunnelError, https_connector};
use crate::environment::{ExecutionEnvironment, supports_native_transport_controls};
use crate::{
    ClientCertificate, Credentials, Error, PackageSource, ProxyConfig, Request, Response, Result,
};

/// Response encodings the transport decodes transparently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecompressionMethods {
    /// `gzip` / `x-gzip`.
    pub gzip: bool,
    /// `deflate`.
    pub deflate: bool,
}

impl DecompressionMethods {
    /// No automatic decompression.
    pub const NONE: Self = Self {
        gzip: false,
        deflate: false,
    };

    /// Both gzip and deflate.
    pub const GZIP_DEFLATE: Self = Self {
        gzip: true,
        deflate: true,
    };

    /// `Accept-Encoding` value to advertise, if any.
    #[must_use]
    pub const fn accept_encoding(self) -> Option<&'static str> {
        match (self.gzip, self.deflate) {
            (true, true) => Some("gzip, deflate"),
            (true, false) => Some("gzip"),
            (false, true) => Some("deflate"),
            (false, false) => None,
        }
    }
}

/// Native controls applied to a transport.
///
/// In a restricted runtime every field keeps its default, except the
/// credential scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportSettings {
    /// Proxy used for non-bypassed destinations.
    pub proxy: Option<ProxyConfig>,
    /// Response encodings decoded by the transport.
    pub decompression: DecompressionMethods,
    /// Client certificates presented during TLS handshakes.
    pub client_certificates: Vec<ClientCertificate>,
    /// Only requests to this origin receive endpoint credentials.
    ///
    /// `None` sends them to every destination.
    pub credential_scope: Option<Url>,
}

/// A credentials slot with a change counter.
#[derive(Debug, Default)]
pub(crate) struct CredentialCell {
    value: RwLock<Option<Credentials>>,
    version: AtomicU64,
}

impl CredentialCell {
    pub(crate) fn new(value: Option<Credentials>) -> Self {
        Self {
            value: RwLock::new(value),
            version: AtomicU64::new(0),
        }
    }

    pub(crate) fn get(&self) -> Option<Credentials> {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, value: Option<Credentials>) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

struct TransportInner {
    client: Client<HttpsConnector<ProxyConnector>, Full<Bytes>>,
    settings: TransportSettings,
    config: TransportConfig,
    credentials: Arc<CredentialCell>,
    proxy_credentials: Arc<CredentialCell>,
}

/// The innermost handler: connection pooling, TLS, proxying and decoding.
///
/// Cloning is cheap; clones share the pool and the credential controls.
#[derive(Clone)]
pub struct TransportBase {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for TransportBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBase")
            .field("settings", &self.inner.settings)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl TransportBase {
    /// Create a transport with the given native controls.
    #[must_use]
    pub fn new(settings: TransportSettings, config: TransportConfig) -> Self {
        let credentials = Arc::new(CredentialCell::default());
        let proxy_credentials = Arc::new(CredentialCell::new(
            settings
                .proxy
                .as_ref()
                .and_then(ProxyConfig::credentials)
                .cloned(),
        ));

        let route = settings.proxy.clone().and_then(|proxy| {
            let address = proxy.address();
            let route = ProxyRoute::new(proxy, Arc::clone(&proxy_credentials));
            if route.is_none() {
                tracing::warn!(proxy = %address, "ignoring proxy with unusable address");
            }
            route
        });

        let connector = https_connector(
            &settings.client_certificates,
            route,
            config.connect_timeout,
        );
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_idle_per_host)
            .retry_canceled_requests(config.retry_canceled_requests)
            .build(connector);

        Self {
            inner: Arc::new(TransportInner {
                client,
                settings,
                config,
                credentials,
                proxy_credentials,
            }),
        }
    }

    /// Native controls of this transport.
    #[must_use]
    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// Configured proxy, if any.
    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.inner.settings.proxy.as_ref()
    }

    /// Client certificates presented during TLS handshakes.
    #[must_use]
    pub fn client_certificates(&self) -> &[ClientCertificate] {
        &self.inner.settings.client_certificates
    }

    /// Response encodings decoded by the transport.
    #[must_use]
    pub fn decompression(&self) -> DecompressionMethods {
        self.inner.settings.decompression
    }

    /// Timeouts and pool settings.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Credentials sent to the package source.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.credentials.get()
    }

    /// Replace the credentials sent to the package source.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        self.inner.credentials.set(credentials);
    }

    /// Incremented on every [`set_credentials`](Self::set_credentials).
    #[must_use]
    pub fn credentials_version(&self) -> u64 {
        self.inner.credentials.version()
    }

    /// Credentials sent to the proxy.
    #[must_use]
    pub fn proxy_credentials(&self) -> Option<Credentials> {
        self.inner.proxy_credentials.get()
    }

    /// Replace the credentials sent to the proxy.
    ///
    /// New tunnels use them immediately; pooled connections are unaffected.
    pub fn set_proxy_credentials(&self, credentials: Option<Credentials>) {
        self.inner.proxy_credentials.set(credentials);
    }

    /// Incremented on every [`set_proxy_credentials`](Self::set_proxy_credentials).
    #[must_use]
    pub fn proxy_credentials_version(&self) -> u64 {
        self.inner.proxy_credentials.version()
    }

    /// Returns `true` if both handles share the same pool and controls.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn in_credential_scope(&self, url: &Url) -> bool {
        self.inner
            .settings
            .credential_scope
            .as_ref()
            .is_none_or(|scope| scope.origin() == url.origin())
    }

    fn uses_forward_proxy(&self, url: &Url) -> bool {
        url.scheme() == "http"
            && self
                .proxy()
                .is_some_and(|proxy| !proxy.is_bypassed(url))
    }

    /// Apply transport-level headers.
    fn prepare(&self, mut request: Request<Bytes>) -> Request<Bytes> {
        if let Some(accept) = self.decompression().accept_encoding()
            && !request.contains_header("accept-encoding")
        {
            request.set_header("accept-encoding", accept);
        }

        if !request.contains_header("authorization")
            && self.in_credential_scope(request.url())
            && let Some(credentials) = self.credentials().filter(Credentials::is_valid)
        {
            request.set_header("authorization", credentials.basic_authorization());
        }

        // Tunnelled requests authenticate during CONNECT instead.
        if self.uses_forward_proxy(request.url())
            && let Some(credentials) = self.proxy_credentials()
        {
            request.set_header("proxy-authorization", credentials.basic_authorization());
        }

        request
    }

    fn build_hyper_request(request: Request<Bytes>) -> Result<http::Request<Full<Bytes>>> {
        let (method, url, headers, body) = request.into_parts();

        let mut builder = http::Request::builder()
            .method(http::Method::from(method))
            .uri(url.as_str());

        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
            .body(body.map_or_else(Full::default, Full::new))
            .map_err(|e| Error::invalid_request(e.to_string()))
    }

    async fn dispatch(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let request = self.prepare(request);
        tracing::trace!(method = %request.method(), url = %request.url(), "sending request");
        let hyper_request = Self::build_hyper_request(request)?;

        let response = tokio::time::timeout(
            self.inner.config.timeout,
            self.inner.client.request(hyper_request),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| map_client_error(&e))?;

        let status = response.status().as_u16();
        let mut headers = extract_headers(response.headers());

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::connection(e.to_string()))?
            .to_bytes();
        let body = decode_body(self.decompression(), &mut headers, body)?;

        Ok(Response::new(status, headers, body))
    }
}

/// Collect response headers, joining repeated ones with `", "`.
fn extract_headers(headers: &http::HeaderMap) -> HashMap<String, String> {
    let mut collected: HashMap<String, String> = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    collected
}

/// Decode the body if its encoding is enabled, fixing up the headers.
fn decode_body(
    methods: DecompressionMethods,
    headers: &mut HashMap<String, String>,
    body: Bytes,
) -> Result<Bytes> {
    let Some(encoding) = headers
        .get("content-encoding")
        .map(|value| value.trim().to_ascii_lowercase())
    else {
        return Ok(body);
    };
    if body.is_empty() {
        return Ok(body);
    }

    let decoded = match encoding.as_str() {
        "gzip" | "x-gzip" if methods.gzip => {
            read_all(flate2::read::GzDecoder::new(body.as_ref()), "gzip")?
        }
        // Servers disagree on zlib-wrapped versus raw deflate.
        "deflate" if methods.deflate => {
            read_all(flate2::read::ZlibDecoder::new(body.as_ref()), "deflate").or_else(|_| {
                read_all(flate2::read::DeflateDecoder::new(body.as_ref()), "deflate")
            })?
        }
        _ => return Ok(body),
    };

    headers.remove("content-encoding");
    headers.insert("content-length".to_string(), decoded.len().to_string());
    Ok(decoded)
}

fn read_all(mut decoder: impl Read, encoding: &str) -> Result<Bytes> {
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::decompression(format!("{encoding} decoding failed: {e}")))?;
    Ok(Bytes::from(decoded))
}

fn map_client_error(err: &hyper_util::client::legacy::Error) -> Error {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(tunnel) = cause.downcast_ref::<TunnelError>() {
            return tunnel.to_error();
        }
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("tls") || lowered.contains("certificate") || lowered.contains("handshake")
    {
        return Error::tls(message);
    }
    Error::connection(message)
}

impl Service<Request<Bytes>> for TransportBase {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let transport = self.clone();
        Box::pin(async move { transport.dispatch(request).await })
    }
}

impl feedwire_core::HttpClient for TransportBase {
    async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.dispatch(request).await
    }
}

/// Build the transport for `source`.
///
/// When the runtime supports native transport controls the transport gets
/// `proxy`, gzip and deflate decoding, and every client certificate of the
/// source. Otherwise it gets default settings and the proxy and
/// certificates are dropped.
#[must_use]
pub fn build_transport_base(
    source: &PackageSource,
    proxy: Option<&ProxyConfig>,
    environment: &dyn ExecutionEnvironment,
    config: &TransportConfig,
) -> TransportBase {
    let credential_scope = source.uri().cloned();

    let settings = if supports_native_transport_controls(environment) {
        TransportSettings {
            proxy: proxy.cloned(),
            decompression: DecompressionMethods::GZIP_DEFLATE,
            client_certificates: source.client_certificates().to_vec(),
            credential_scope,
        }
    } else {
        if proxy.is_some() || !source.client_certificates().is_empty() {
            tracing::warn!(
                source = source.name(),
                proxy = proxy.is_some(),
                client_certificates = source.client_certificates().len(),
                "runtime does not allow transport controls, proxy and client certificates are ignored"
            );
        }
        TransportSettings {
            credential_scope,
            ..TransportSettings::default()
        }
    };

    TransportBase::new(settings, config.clone())
}
