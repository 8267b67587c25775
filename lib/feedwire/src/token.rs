//! Legacy security tokens and the token-store collaborator.
//!
//! Older feeds authenticate with a bearer-style token issued by a security
//! token service. The feed advertises the service through a challenge on a
//! 401 response; the token is then sent on every request in
//! [`TOKEN_HEADER`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use url::Url;

/// Request header carrying the token.
pub const TOKEN_HEADER: &str = "X-NuGet-STS-Token";

/// Response header naming the token realm.
pub const REALM_HEADER: &str = "x-nuget-sts-realm";

/// Response header naming the token-issuing endpoint.
pub const ENDPOINT_HEADER: &str = "x-nuget-sts-endpoint";

/// An issued token.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityToken(Arc<str>);

impl SecurityToken {
    /// Wrap a raw token value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    /// Raw token value, as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecurityToken(<redacted>)")
    }
}

/// Token challenge sent by a feed alongside a 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StsChallenge {
    /// Realm the token must be issued for.
    pub realm: String,
    /// Token service address.
    pub endpoint: Url,
}

impl StsChallenge {
    /// Read a challenge from response headers; `None` if either header is
    /// missing or the endpoint is not a URL.
    #[must_use]
    pub fn from_response<B>(response: &feedwire_core::Response<B>) -> Option<Self> {
        let realm = response.header(REALM_HEADER)?.trim();
        let endpoint = Url::parse(response.header(ENDPOINT_HEADER)?.trim()).ok()?;
        if realm.is_empty() {
            return None;
        }
        Some(Self {
            realm: realm.to_string(),
            endpoint,
        })
    }
}

/// Cache and factory of tokens, keyed by package source address.
///
/// Called concurrently from in-flight requests; implementations must be
/// internally synchronized.
pub trait TokenStore: Send + Sync {
    /// Cached token for `source`, or a freshly issued one when `challenge`
    /// is given and the store can answer it.
    fn get_or_create_token(
        &self,
        source: &Url,
        challenge: Option<&StsChallenge>,
    ) -> Option<SecurityToken>;

    /// Remember `token` for `source`.
    fn store_token(&self, source: &Url, token: SecurityToken);

    /// Forget the token for `source`, e.g. after it was rejected.
    fn remove_token(&self, source: &Url);
}

type TokenIssuer = dyn Fn(&Url, &StsChallenge) -> Option<SecurityToken> + Send + Sync;

/// In-memory token store with an optional issuer for challenges.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, SecurityToken>>,
    issuer: Option<Box<TokenIssuer>>,
}

impl MemoryTokenStore {
    /// A store that only returns tokens stored through [`TokenStore::store_token`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that asks `issuer` when a feed challenges for a token.
    #[must_use]
    pub fn with_issuer(
        issuer: impl Fn(&Url, &StsChallenge) -> Option<SecurityToken> + Send + Sync + 'static,
    ) -> Self {
        Self {
            tokens: RwLock::default(),
            issuer: Some(Box::new(issuer)),
        }
    }
}

impl fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("MemoryTokenStore")
            .field("tokens", &count)
            .field("issuer", &self.issuer.is_some())
            .finish()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get_or_create_token(
        &self,
        source: &Url,
        challenge: Option<&StsChallenge>,
    ) -> Option<SecurityToken> {
        match challenge {
            None => self
                .tokens
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(source.as_str())
                .cloned(),
            Some(challenge) => {
                let issuer = self.issuer.as_ref()?;
                issuer(source, challenge)
            }
        }
    }

    fn store_token(&self, source: &Url, token: SecurityToken) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.as_str().to_string(), token);
    }

    fn remove_token(&self, source: &Url) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source.as_str());
    }
}
