//! The composed pipeline handed to callers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::util::BoxCloneService;
use tower_service::Service;

use crate::middleware::HandlerKind;
use crate::{Error, Request, Response, Result, TransportBase};

/// Type-erased service for layer composition.
pub type BoxedService = BoxCloneService<Request<Bytes>, Response<Bytes>, Error>;

/// Future type for Tower Service implementation.
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<Bytes>>> + Send + 'static>>;

/// Thread-safe wrapper for `BoxedService`.
///
/// `BoxCloneService` is `Send` but not `Sync`; the mutex makes the pipeline
/// shareable across tasks.
#[derive(Clone)]
struct SyncService {
    inner: Arc<Mutex<BoxedService>>,
}

impl SyncService {
    fn new(service: BoxedService) -> Self {
        Self {
            inner: Arc::new(Mutex::new(service)),
        }
    }

    fn call(&self, request: Request<Bytes>) -> ServiceFuture {
        // Lock, clone the service, and release the lock immediately
        let mut service = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        Box::pin(async move { service.call(request).await })
    }
}

/// HTTP pipeline for one package source.
///
/// Holds the outermost handler and the transport base at the bottom of the
/// chain. Cheap to clone; clones share the pipeline.
#[derive(Clone)]
pub struct HttpHandlerResource {
    source: Arc<str>,
    service: SyncService,
    transport: TransportBase,
    layers: Arc<[HandlerKind]>,
}

impl fmt::Debug for HttpHandlerResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandlerResource")
            .field("source", &self.source)
            .field("layers", &self.layers)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl HttpHandlerResource {
    /// `layers` lists the handlers outermost first, ending with the transport.
    pub(crate) fn new(
        source: &str,
        service: BoxedService,
        transport: TransportBase,
        layers: Vec<HandlerKind>,
    ) -> Self {
        Self {
            source: Arc::from(source),
            service: SyncService::new(service),
            transport,
            layers: Arc::from(layers),
        }
    }

    /// Name of the package source this pipeline serves.
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source
    }

    /// Send a request through the whole chain.
    pub fn send(&self, request: Request<Bytes>) -> ServiceFuture {
        self.service.call(request)
    }

    /// The innermost handler, for per-call controls such as credentials.
    #[must_use]
    pub fn transport(&self) -> &TransportBase {
        &self.transport
    }

    /// Handlers in the order a request meets them: outermost first, always
    /// ending with [`HandlerKind::Transport`].
    #[must_use]
    pub fn layers(&self) -> &[HandlerKind] {
        &self.layers
    }

    /// Returns `true` if the chain contains a handler of this kind.
    #[must_use]
    pub fn has_layer(&self, kind: HandlerKind) -> bool {
        self.layers.contains(&kind)
    }
}

impl feedwire_core::HttpClient for HttpHandlerResource {
    async fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        self.send(request).await
    }
}

impl Service<Request<Bytes>> for HttpHandlerResource {
    type Response = Response<Bytes>;
    type Error = Error;
    type Future = ServiceFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        // SyncService is always ready (the underlying service is polled when called)
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        self.service.call(request)
    }
}
