//! Credentials and the credential-service collaborator.
//!
//! The authentication layers never own credentials: they ask a
//! [`CredentialService`] when a challenge arrives and hand the answer to the
//! [`TransportBase`](crate::TransportBase). The service itself is provided
//! lazily through [`SharedCredentialService`], so a pipeline built before a
//! service is registered still picks it up at request time.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use base64::Engine;
use url::Url;

/// Username/password pair used for Basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password (or API key / personal access token).
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Credentials without a username are ignored.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.username.is_empty()
    }

    /// `Basic <base64(user:pass)>` header value.
    #[must_use]
    pub fn basic_authorization(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Why credentials are being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialRequestType {
    /// A proxy answered 407.
    Proxy,
    /// The package source answered 401.
    Unauthorized,
    /// The package source answered 403.
    Forbidden,
}

/// A single request for credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    /// Package source or proxy address the credentials are for.
    pub uri: Url,
    /// Proxy in use when the challenge arrived, if any.
    pub proxy: Option<Url>,
    /// What kind of challenge triggered the request.
    pub request_type: CredentialRequestType,
    /// Human-readable prompt.
    pub message: String,
    /// `true` when earlier credentials for this target were rejected.
    pub is_retry: bool,
}

/// Future returned by [`CredentialService::get_credentials`].
pub type CredentialFuture<'a> = Pin<Box<dyn Future<Output = Option<Credentials>> + Send + 'a>>;

/// Source of credentials for proxies and package sources.
///
/// Several in-flight requests may hit a challenge at the same time, so
/// implementations must be safe to call concurrently. Returning `None`
/// means "no credentials"; the challenged response is then returned to the
/// caller unchanged.
pub trait CredentialService: Send + Sync {
    /// Look up or prompt for credentials.
    fn get_credentials(&self, request: CredentialRequest) -> CredentialFuture<'_>;
}

impl<F> CredentialService for F
where
    F: Fn(&CredentialRequest) -> Option<Credentials> + Send + Sync,
{
    fn get_credentials(&self, request: CredentialRequest) -> CredentialFuture<'_> {
        let credentials = self(&request);
        Box::pin(std::future::ready(credentials))
    }
}

/// Lazily provided credential service, shared by every pipeline of a provider.
///
/// The slot can be filled once, before or after pipelines are created.
#[derive(Clone, Default)]
pub struct SharedCredentialService {
    slot: Arc<OnceLock<Arc<dyn CredentialService>>>,
}

impl SharedCredentialService {
    /// An empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot already holding `service`.
    #[must_use]
    pub fn with_service(service: Arc<dyn CredentialService>) -> Self {
        let shared = Self::new();
        shared.set(service);
        shared
    }

    /// Register the service. Returns `false` if one was already registered.
    pub fn set(&self, service: Arc<dyn CredentialService>) -> bool {
        self.slot.set(service).is_ok()
    }

    /// The registered service, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn CredentialService>> {
        self.slot.get().cloned()
    }
}

impl fmt::Debug for SharedCredentialService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCredentialService")
            .field("registered", &self.slot.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(request_type: CredentialRequestType) -> CredentialRequest {
        CredentialRequest {
            uri: Url::parse("https://feed.example/v3/index.json").expect("url"),
            proxy: None,
            request_type,
            message: "credentials".to_string(),
            is_retry: false,
        }
    }

    #[test]
    fn basic_authorization_encodes_pair() {
        // "user:pass" -> "dXNlcjpwYXNz"
        let credentials = Credentials::new("user", "pass");
        assert_eq!(credentials.basic_authorization(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("alice", "s3cr3t"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("s3cr3t"));
    }

    #[test]
    fn empty_username_is_invalid() {
        assert!(!Credentials::new("", "token").is_valid());
        assert!(Credentials::new("az", "token").is_valid());
    }

    #[tokio::test]
    async fn closure_acts_as_credential_service() {
        let service = |request: &CredentialRequest| {
            (request.request_type == CredentialRequestType::Proxy)
                .then(|| Credentials::new("proxy-user", "proxy-pass"))
        };

        let proxy = service
            .get_credentials(request(CredentialRequestType::Proxy))
            .await;
        let source = service
            .get_credentials(request(CredentialRequestType::Unauthorized))
            .await;

        assert_eq!(proxy, Some(Credentials::new("proxy-user", "proxy-pass")));
        assert_eq!(source, None);
    }

    #[test]
    fn shared_service_is_set_once() {
        let shared = SharedCredentialService::new();
        assert!(shared.get().is_none());

        let first: Arc<dyn CredentialService> =
            Arc::new(|_: &CredentialRequest| Some(Credentials::new("a", "b")));
        let second: Arc<dyn CredentialService> = Arc::new(|_: &CredentialRequest| None);

        assert!(shared.set(first));
        assert!(!shared.set(second));

        let clone = shared.clone();
        assert!(clone.get().is_some());
        assert!(format!("{shared:?}").contains("registered: true"));
    }
}
