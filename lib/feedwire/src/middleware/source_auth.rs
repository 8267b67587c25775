//! Package source authentication.
//!
//! The outermost layer. It seeds the transport with the source's stored
//! credentials, and on a 401 or 403 from the source asks the credential
//! service for new ones before resending.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::Mutex;
use tower::{Layer, Service, ServiceExt};
use url::Url;

use crate::{
    CredentialRequest, CredentialRequestType, Credentials, Error, PackageSource, Request,
    Response, Result, SharedCredentialService, TransportBase,
};

struct Shared {
    name: String,
    source: Url,
    transport: TransportBase,
    credential_service: SharedCredentialService,
    max_attempts: u32,
    prompt_lock: Mutex<()>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceAuthentication")
            .field("source", &self.source.as_str())
            .field("credential_service", &self.credential_service)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Layer answering 401/403 challenges from a package source.
#[derive(Debug, Clone)]
pub struct SourceAuthenticationLayer {
    shared: Arc<Shared>,
}

impl SourceAuthenticationLayer {
    /// Authenticate requests to `source`, reachable at `uri`, through
    /// `transport`.
    ///
    /// Stored credentials of the source are handed to the transport right away.
    #[must_use]
    pub fn new(
        source: &PackageSource,
        uri: Url,
        transport: TransportBase,
        credential_service: SharedCredentialService,
        max_attempts: u32,
    ) -> Self {
        if let Some(credentials) = source.credentials().filter(|c| c.is_valid()) {
            transport.set_credentials(Some(credentials.clone()));
        }
        Self {
            shared: Arc::new(Shared {
                name: source.name().to_string(),
                source: uri,
                transport,
                credential_service,
                max_attempts,
                prompt_lock: Mutex::new(()),
            }),
        }
    }
}

impl<S> Layer<S> for SourceAuthenticationLayer {
    type Service = SourceAuthentication<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SourceAuthentication {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Service answering 401/403 challenges from a package source.
#[derive(Debug, Clone)]
pub struct SourceAuthentication<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Bytes>> for SourceAuthentication<S>
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
            // Explicit authorization and other origins are not ours to answer.
            if request.contains_header("authorization")
                || request.url().origin() != shared.source.origin()
            {
                return inner.oneshot(request).await;
            }
            let transport = &shared.transport;

            let mut prompts = 0;
            let mut refreshes = 0;
            loop {
                let version = transport.credentials_version();
                let response = inner.clone().oneshot(request.clone()).await?;
                let request_type = match response.status() {
                    401 => CredentialRequestType::Unauthorized,
                    403 => CredentialRequestType::Forbidden,
                    _ => return Ok(response),
                };
                if prompts >= shared.max_attempts {
                    tracing::debug!(source = %shared.name, status = response.status(), "giving up on source challenge");
                    return Ok(response);
                }

                let _prompt = shared.prompt_lock.lock().await;
                if transport.credentials_version() != version && refreshes < shared.max_attempts {
                    refreshes += 1;
                    tracing::debug!(source = %shared.name, "source credentials changed, retrying");
                    continue;
                }

                let Some(service) = shared.credential_service.get() else {
                    return Ok(response);
                };
                prompts += 1;
                let credential_request = CredentialRequest {
                    uri: shared.source.clone(),
                    proxy: transport.proxy().map(|proxy| proxy.uri().clone()),
                    request_type,
                    message: challenge_message(request_type, &shared.name),
                    is_retry: prompts > 1,
                };
                let Some(credentials) = service
                    .get_credentials(credential_request)
                    .await
                    .filter(Credentials::is_valid)
                else {
                    tracing::debug!(source = %shared.name, "no source credentials provided");
                    return Ok(response);
                };

                transport.set_credentials(Some(credentials));
                tracing::debug!(source = %shared.name, attempt = prompts, "retrying with source credentials");
            }
        })
    }
}

fn challenge_message(request_type: CredentialRequestType, source: &str) -> String {
    match request_type {
        CredentialRequestType::Forbidden => {
            format!("Access to package source '{source}' is forbidden with the current credentials.")
        }
        _ => format!("Package source '{source}' requires credentials."),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::middleware::test_support::{count, get, header, response, scripted};
    use crate::{CredentialService, TransportConfig, TransportSettings};

    const FEED: &str = "https://feed.corp/v3/index.json";

    fn transport() -> TransportBase {
        TransportBase::new(TransportSettings::default(), TransportConfig::default())
    }

    fn recording(
        answer: Option<Credentials>,
    ) -> (Arc<dyn CredentialService>, Arc<StdMutex<Vec<CredentialRequest>>>) {
        let requests = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let service: Arc<dyn CredentialService> = Arc::new(move |request: &CredentialRequest| {
            log.lock().expect("lock").push(request.clone());
            answer.clone()
        });
        (service, requests)
    }

    fn layer(
        transport: TransportBase,
        credential_service: SharedCredentialService,
        max_attempts: u32,
    ) -> SourceAuthenticationLayer {
        let source = PackageSource::new("corp", FEED);
        let uri = Url::parse(FEED).expect("url");
        SourceAuthenticationLayer::new(&source, uri, transport, credential_service, max_attempts)
    }

    /// 401 until the transport holds credentials, as a feed would.
    fn authenticating(
        transport: &TransportBase,
    ) -> impl Fn(usize, &Request<Bytes>) -> Result<Response<Bytes>> + Clone + Send + Sync + 'static
    {
        let transport = transport.clone();
        move |_: usize, _: &Request<Bytes>| {
            if transport.credentials().is_some() {
                Ok(response(200, &[]))
            } else {
                Ok(response(401, &[]))
            }
        }
    }

    #[test]
    fn stored_credentials_seed_the_transport() {
        let transport = transport();
        let source = PackageSource::new("corp", FEED)
            .with_credentials(Credentials::new("alice", "pat"));

        let _layer = SourceAuthenticationLayer::new(
            &source,
            Url::parse(FEED).expect("url"),
            transport.clone(),
            SharedCredentialService::new(),
            3,
        );

        assert_eq!(
            transport.credentials().map(|c| c.username().to_string()),
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn credential_request_names_the_source_url() {
        let transport = transport();
        let (service, requests) = recording(Some(Credentials::new("alice", "pat")));
        let (inner, _seen) = scripted(authenticating(&transport));
        let resolved = Url::parse(FEED).expect("url");

        let layer = SourceAuthenticationLayer::new(
            &PackageSource::new("corp", FEED),
            resolved.clone(),
            transport,
            SharedCredentialService::with_service(service),
            3,
        );
        let response = layer.layer(inner).oneshot(get(FEED)).await.expect("response");

        assert_eq!(response.status(), 200);
        assert_eq!(requests.lock().expect("lock")[0].uri, resolved);
    }

    #[tokio::test]
    async fn concurrent_refresh_does_not_use_up_attempts() {
        let transport = transport();
        let (service, requests) = recording(Some(Credentials::new("alice", "pat")));
        let refresher = transport.clone();
        let current = transport.clone();
        let (inner, seen) = scripted(move |attempt, _| {
            if attempt == 0 {
                refresher.set_credentials(Some(Credentials::new("other", "stale")));
            }
            match current.credentials() {
                Some(c) if c.username() == "alice" => Ok(response(200, &[])),
                _ => Ok(response(401, &[])),
            }
        });

        let response = layer(transport, SharedCredentialService::with_service(service), 1)
            .layer(inner)
            .oneshot(get(FEED))
            .await
            .expect("response");

        assert_eq!(response.status(), 200);
        assert_eq!(count(&seen), 3);
        let requests = requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].is_retry);
    }

    #[tokio::test]
    async fn unauthorized_prompts_and_retries() {
        let transport = transport();
        let (service, requests) = recording(Some(Credentials::new("alice", "pat")));
        let (inner, seen) = scripted(authenticating(&transport));

        let layer = layer(transport.clone(), SharedCredentialService::with_service(service), 3);
        let response = layer.layer(inner).oneshot(get(FEED)).await.expect("response");

        assert_eq!(response.status(), 200);
        assert_eq!(count(&seen), 2);
        let requests = requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_type, CredentialRequestType::Unauthorized);
        assert_eq!(requests[0].uri.as_str(), FEED);
        assert!(!requests[0].is_retry);
    }

    #[tokio::test]
    async fn forbidden_is_retried_until_attempts_run_out() {
        let transport = transport();
        let (service, requests) = recording(Some(Credentials::new("bob", "stale")));
        let (inner, seen) = scripted(|_, _| Ok(response(403, &[])));

        let layer = layer(transport, SharedCredentialService::with_service(service), 2);
        let response = layer.layer(inner).oneshot(get(FEED)).await.expect("response");

        assert_eq!(response.status(), 403);
        assert_eq!(count(&seen), 3);
        let requests = requests.lock().expect("lock");
        let retries: Vec<_> = requests.iter().map(|r| (r.request_type, r.is_retry)).collect();
        assert_eq!(
            retries,
            vec![
                (CredentialRequestType::Forbidden, false),
                (CredentialRequestType::Forbidden, true)
            ]
        );
    }

    #[tokio::test]
    async fn service_registered_after_construction_is_used() {
        let transport = transport();
        let slot = SharedCredentialService::new();
        let (inner, _seen) = scripted(authenticating(&transport));

        let service = layer(transport, slot.clone(), 3).layer(inner);

        let (credentials, _requests) = recording(Some(Credentials::new("late", "pat")));
        assert!(slot.set(credentials));

        let response = service.oneshot(get(FEED)).await.expect("response");
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn no_service_or_no_answer_returns_the_challenge() {
        let transport = transport();
        let (inner, seen) = scripted(authenticating(&transport));

        let unregistered = layer(transport.clone(), SharedCredentialService::new(), 3);
        let response = unregistered
            .layer(inner.clone())
            .oneshot(get(FEED))
            .await
            .expect("response");
        assert_eq!(response.status(), 401);

        let (service, _requests) = recording(None);
        let declining = layer(transport, SharedCredentialService::with_service(service), 3);
        let response = declining.layer(inner).oneshot(get(FEED)).await.expect("response");
        assert_eq!(response.status(), 401);
        assert_eq!(count(&seen), 2);
    }

    #[tokio::test]
    async fn other_origins_and_explicit_authorization_pass_through() {
        let transport = transport();
        let (service, requests) = recording(Some(Credentials::new("alice", "pat")));
        let (inner, seen) = scripted(|_, _| Ok(response(401, &[])));
        let service = layer(transport, SharedCredentialService::with_service(service), 3).layer(inner);

        let cdn = service
            .clone()
            .oneshot(get("https://cdn.example/packages/foo.nupkg"))
            .await
            .expect("response");
        assert_eq!(cdn.status(), 401);

        let mut explicit = get(FEED);
        explicit.set_header("Authorization", "Bearer abc");
        let response = service.oneshot(explicit).await.expect("response");
        assert_eq!(response.status(), 401);

        assert_eq!(count(&seen), 2);
        assert_eq!(header(&seen, 1, "Authorization").as_deref(), Some("Bearer abc"));
        assert!(requests.lock().expect("lock").is_empty());
    }
}
