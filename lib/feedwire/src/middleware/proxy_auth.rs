//! Proxy authentication.
//!
//! A proxy asks for credentials either with a 407 response (forwarded plain
//! HTTP) or by refusing the `CONNECT` tunnel (HTTPS). Both are handled the
//! same way: ask the credential service, hand the answer to the transport
//! and the proxy cache, and resend.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::Mutex;
use tower::{Layer, Service, ServiceExt};

use super::challenge_status;
use crate::{
    CredentialRequest, CredentialRequestType, Credentials, Error, ProxyCache, Request, Response,
    Result, SharedCredentialService, TransportBase,
};

struct Shared {
    transport: TransportBase,
    proxy_cache: Arc<dyn ProxyCache>,
    credential_service: SharedCredentialService,
    max_attempts: u32,
    prompt_lock: Mutex<()>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuthentication")
            .field("proxy", &self.transport.proxy().map(|proxy| proxy.address()))
            .field("credential_service", &self.credential_service)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Layer answering proxy challenges.
#[derive(Debug, Clone)]
pub struct ProxyAuthenticationLayer {
    shared: Arc<Shared>,
}

impl ProxyAuthenticationLayer {
    /// Answer challenges from the proxy configured on `transport`, at most
    /// `max_attempts` prompts per request.
    pub fn new(
        transport: TransportBase,
        proxy_cache: Arc<dyn ProxyCache>,
        credential_service: SharedCredentialService,
        max_attempts: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                proxy_cache,
                credential_service,
                max_attempts,
                prompt_lock: Mutex::new(()),
            }),
        }
    }
}

impl<S> Layer<S> for ProxyAuthenticationLayer {
    type Service = ProxyAuthentication<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProxyAuthentication {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service answering proxy challenges.
#[derive(Debug, Clone)]
pub struct ProxyAuthentication<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Bytes>> for ProxyAuthentication<S>
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

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let inner = self.inner.clone();
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let Some(proxy) = shared.transport.proxy().cloned() else {
                return inner.oneshot(request).await;
            };
            let transport = &shared.transport;

            let mut prompts = 0;
            let mut refreshes = 0;
            loop {
                let version = transport.proxy_credentials_version();
                let outcome = inner.clone().oneshot(request.clone()).await;
                if challenge_status(&outcome) != Some(407) || prompts >= shared.max_attempts {
                    return outcome;
                }

                let _prompt = shared.prompt_lock.lock().await;
                if transport.proxy_credentials_version() != version
                    && refreshes < shared.max_attempts
                {
                    refreshes += 1;
                    tracing::debug!(proxy = %proxy.address(), "proxy credentials changed, retrying");
                    continue;
                }

                let Some(service) = shared.credential_service.get() else {
                    tracing::debug!(proxy = %proxy.address(), "no credential service for proxy challenge");
                    return outcome;
                };
                prompts += 1;
                let credential_request = CredentialRequest {
                    uri: proxy.uri().clone(),
                    proxy: Some(proxy.uri().clone()),
                    request_type: CredentialRequestType::Proxy,
                    message: format!("The proxy {} requires credentials.", proxy.address()),
                    is_retry: prompts > 1,
                };
                let Some(credentials) = service
                    .get_credentials(credential_request)
                    .await
                    .filter(Credentials::is_valid)
                else {
                    tracing::debug!(proxy = %proxy.address(), "no proxy credentials provided");
                    return outcome;
                };

                transport.set_proxy_credentials(Some(credentials.clone()));
                shared
                    .proxy_cache
                    .store_proxy_credentials(proxy.uri(), credentials);
                tracing::debug!(proxy = %proxy.address(), attempt = prompts, "retrying with proxy credentials");
            }
        })
    }
}
