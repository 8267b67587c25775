//! Legacy security-token authentication.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::{Layer, Service, ServiceExt};
use url::Url;

use crate::token::{StsChallenge, TOKEN_HEADER, TokenStore};
use crate::{Error, Request, Response, Result};

struct Shared {
    source: Url,
    store: Option<Arc<dyn TokenStore>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyTokenAuthentication")
            .field("source", &self.source.as_str())
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Layer that sends the source's security token and answers token challenges.
///
/// Without a token store the layer passes requests through untouched.
#[derive(Debug, Clone)]
pub struct LegacyTokenAuthenticationLayer {
    shared: Arc<Shared>,
}

impl LegacyTokenAuthenticationLayer {
    /// Tokens for `source` are read from and stored in `store`.
    #[must_use]
    pub fn new(source: Url, store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            shared: Arc::new(Shared { source, store }),
        }
    }
}

impl<S> Layer<S> for LegacyTokenAuthenticationLayer {
    type Service = LegacyTokenAuthentication<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LegacyTokenAuthentication {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service that sends the source's security token.
#[derive(Debug, Clone)]
pub struct LegacyTokenAuthentication<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Bytes>> for LegacyTokenAuthentication<S>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Bytes>) -> Self::Future {
        let inner = self.inner.clone();
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let Some(store) = shared.store.as_ref() else {
                return inner.oneshot(request).await;
            };
            let source = &shared.source;
            // Tokens are never sent off the source's origin.
            if request.url().origin() != source.origin() {
                return inner.oneshot(request).await;
            }

            if let Some(token) = store.get_or_create_token(source, None) {
                request.set_header(TOKEN_HEADER, token.as_str());
            }

            let response = inner.clone().oneshot(request.clone()).await?;
            if response.status() != 401 {
                return Ok(response);
            }
            let Some(challenge) = StsChallenge::from_response(&response) else {
                return Ok(response);
            };
            let Some(token) = store.get_or_create_token(source, Some(&challenge)) else {
                tracing::debug!(%source, realm = %challenge.realm, "no token issued for challenge");
                return Ok(response);
            };

            store.store_token(source, token.clone());
            request.set_header(TOKEN_HEADER, token.as_str());
            tracing::debug!(%source, realm = %challenge.realm, "retrying with new security token");

            let response = inner.oneshot(request).await?;
            if response.status() == 401 {
                store.remove_token(source);
            }
            Ok(response)
        })
    }
}
