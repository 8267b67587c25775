//! Proxy configuration and the proxy-cache collaborator.
//!
//! Proxy selection and `no_proxy` matching use hyper-util's
//! [`Matcher`]: scheme-less proxy values default to `http://`, entries of
//! the bypass list match a domain and its subdomains, an IP address or a
//! CIDR range, and `*` matches everything.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use base64::Engine;
use http::{HeaderValue, Uri};
use hyper_util::client::proxy::matcher::Matcher;
use url::Url;

use crate::Credentials;

/// A resolved proxy for one package source.
#[derive(Clone)]
pub struct ProxyConfig {
    uri: Url,
    credentials: Option<Credentials>,
    bypass: Vec<String>,
    matcher: Arc<Matcher>,
}

impl PartialEq for ProxyConfig {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
            && self.credentials == other.credentials
            && self.bypass == other.bypass
    }
}

impl Eq for ProxyConfig {}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("uri", &self.uri.as_str())
            .field("credentials", &self.credentials)
            .field("bypass", &self.bypass)
            .finish_non_exhaustive()
    }
}

impl ProxyConfig {
    /// Proxy at `uri`. Credentials embedded in the URL are moved out of it.
    #[must_use]
    pub fn new(mut uri: Url) -> Self {
        let credentials = embedded_credentials(&uri);
        if credentials.is_some() {
            // Only fails for cannot-be-a-base URLs, which have no userinfo anyway.
            let _ = uri.set_username("");
            let _ = uri.set_password(None);
        }
        let matcher = Arc::new(bypass_matcher(&uri, &[]));
        Self {
            uri,
            credentials,
            bypass: Vec::new(),
            matcher,
        }
    }

    /// Set the credentials sent to the proxy.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Hosts that must be reached directly (`no_proxy` syntax).
    #[must_use]
    pub fn with_bypass<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass = hosts
            .into_iter()
            .map(Into::into)
            .map(|host| host.trim().to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        self.matcher = Arc::new(bypass_matcher(&self.uri, &self.bypass));
        self
    }

    /// Proxy address.
    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Credentials for the proxy, if known.
    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Bypass list.
    #[must_use]
    pub fn bypass(&self) -> &[String] {
        &self.bypass
    }

    /// `host:port` key identifying the proxy.
    #[must_use]
    pub fn address(&self) -> String {
        proxy_key(&self.uri)
    }

    /// Returns `true` if `target` must not go through this proxy.
    #[must_use]
    pub fn is_bypassed(&self, target: &Url) -> bool {
        target
            .as_str()
            .parse::<Uri>()
            .is_ok_and(|dst| self.matcher.intercept(&dst).is_none())
    }
}

/// Matcher routing every destination to `uri` except the `bypass` entries.
fn bypass_matcher(uri: &Url, bypass: &[String]) -> Matcher {
    Matcher::builder()
        .all(uri.as_str())
        .no(bypass.join(","))
        .build()
}

fn embedded_credentials(uri: &Url) -> Option<Credentials> {
    if uri.username().is_empty() {
        return None;
    }
    let decode = |value: &str| {
        percent_encoding::percent_decode_str(value)
            .decode_utf8_lossy()
            .into_owned()
    };
    Some(Credentials::new(
        decode(uri.username()),
        decode(uri.password().unwrap_or_default()),
    ))
}

/// Credentials of a `Basic` header value built by the matcher.
fn basic_credentials(value: &HeaderValue) -> Option<Credentials> {
    let encoded = value.to_str().ok()?.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials::new(username, password))
}

fn proxy_key(uri: &Url) -> String {
    format!(
        "{}:{}",
        uri.host_str().unwrap_or_default().to_ascii_lowercase(),
        uri.port_or_known_default().unwrap_or(80)
    )
}

/// Resolves the proxy for a package source and remembers proxy credentials.
///
/// Shared by every pipeline and called from concurrently dispatched
/// requests, so implementations must be internally synchronized.
pub trait ProxyCache: Send + Sync {
    /// Proxy to use for `uri`, or `None` to connect directly.
    fn get_proxy(&self, uri: &Url) -> Option<ProxyConfig>;

    /// Remember credentials accepted for the proxy at `proxy_uri`.
    fn store_proxy_credentials(&self, proxy_uri: &Url, credentials: Credentials);
}

/// Proxy cache backed by an explicit proxy or the process environment.
///
/// Environment lookup follows the usual conventions: `https_proxy` for
/// `https` sources, `http_proxy` for `http` sources, `all_proxy` as a
/// fallback, and `no_proxy` as bypass list. Upper-case spellings are
/// accepted except `HTTP_PROXY`, which CGI servers derive from the
/// request's `Proxy` header.
#[derive(Debug, Default)]
pub struct SystemProxyCache {
    explicit: Option<ProxyConfig>,
    environment: Option<Matcher>,
    no_proxy: Vec<String>,
    credentials: RwLock<HashMap<String, Credentials>>,
}

impl SystemProxyCache {
    /// A cache that never returns a proxy.
    #[must_use]
    pub fn direct() -> Self {
        Self::default()
    }

    /// A cache that returns `proxy` for every source it does not bypass.
    #[must_use]
    pub fn with_proxy(proxy: ProxyConfig) -> Self {
        Self {
            explicit: Some(proxy),
            ..Self::default()
        }
    }

    /// Read proxy settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read proxy settings through `lookup` (an environment accessor).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |lower: &str| {
            lookup(lower)
                .or_else(|| lookup(&lower.to_ascii_uppercase()))
                .unwrap_or_default()
        };
        let no_proxy = var("no_proxy");
        let matcher = Matcher::builder()
            .all(var("all_proxy"))
            .http(lookup("http_proxy").unwrap_or_default())
            .https(var("https_proxy"))
            .no(no_proxy.as_str())
            .build();

        Self {
            explicit: None,
            environment: Some(matcher),
            no_proxy: no_proxy
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect(),
            credentials: RwLock::default(),
        }
    }

    fn resolve(&self, uri: &Url) -> Option<ProxyConfig> {
        if let Some(explicit) = &self.explicit {
            return (!explicit.is_bypassed(uri)).then(|| explicit.clone());
        }

        let dst = uri.as_str().parse::<Uri>().ok()?;
        let intercept = self.environment.as_ref()?.intercept(&dst)?;
        let proxy_uri = match Url::parse(&intercept.uri().to_string()) {
            Ok(proxy_uri) => proxy_uri,
            Err(err) => {
                tracing::warn!(proxy = %intercept.uri(), error = %err, "ignoring unusable proxy setting");
                return None;
            }
        };
        let mut proxy = ProxyConfig::new(proxy_uri).with_bypass(self.no_proxy.iter().cloned());
        if let Some(credentials) = intercept.basic_auth().and_then(basic_credentials) {
            proxy.credentials = Some(credentials);
        }
        Some(proxy)
    }
}

impl ProxyCache for SystemProxyCache {
    fn get_proxy(&self, uri: &Url) -> Option<ProxyConfig> {
        if !matches!(uri.scheme(), "http" | "https") {
            return None;
        }
        let Some(mut proxy) = self.resolve(uri) else {
            tracing::debug!(source = %uri, "no proxy for source");
            return None;
        };

        let stored = self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&proxy.address())
            .cloned();
        if let Some(credentials) = stored {
            proxy.credentials = Some(credentials);
        }
        Some(proxy)
    }

    fn store_proxy_credentials(&self, proxy_uri: &Url, credentials: Credentials) {
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(proxy_key(proxy_uri), credentials);
    }
}
