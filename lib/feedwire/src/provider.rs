//! Pipeline factory.
//!
//! [`HttpHandlerProvider::try_create`] builds one pipeline per package
//! source. The layers come from a single ordered table, innermost first;
//! each entry is skipped when its predicate does not hold, never reordered.

use std::fmt;
use std::sync::Arc;

use tower::Layer;
use tower::util::BoxCloneService;
use url::Url;

use crate::environment::supports_native_transport_controls;
use crate::middleware::{
    HandlerKind, LegacyTokenAuthenticationLayer, ProxyAuthenticationLayer, ServerWarningLayer,
    SourceAuthenticationLayer,
};
use crate::resource::{BoxedService, HttpHandlerResource};
use crate::{
    ExecutionEnvironment, PackageSource, PipelineConfig, ProxyCache, ProxyConfig,
    RuntimeEnvironment, SharedCredentialService, SystemProxyCache, TokenStore, TransportBase,
    build_transport_base,
};

/// Everything a layer may depend on while the pipeline is assembled.
struct LayerContext<'a> {
    provider: &'a HttpHandlerProvider,
    source: &'a PackageSource,
    uri: &'a Url,
    proxy: Option<&'a ProxyConfig>,
    native_controls: bool,
    transport: &'a TransportBase,
}

/// One entry of the assembly table.
struct LayerSpec {
    kind: HandlerKind,
    enabled: fn(&LayerContext<'_>) -> bool,
    apply: fn(&LayerContext<'_>, BoxedService) -> BoxedService,
}

/// Assembly table, innermost first.
const LAYERS: [LayerSpec; 4] = [
    LayerSpec {
        kind: HandlerKind::ServerWarning,
        enabled: |_| true,
        apply: |cx, inner| {
            BoxCloneService::new(ServerWarningLayer::new(cx.source.name()).layer(inner))
        },
    },
    LayerSpec {
        kind: HandlerKind::ProxyAuthentication,
        enabled: |cx| cx.native_controls && cx.proxy.is_some(),
        apply: |cx, inner| {
            let layer = ProxyAuthenticationLayer::new(
                cx.transport.clone(),
                Arc::clone(&cx.provider.proxy_cache),
                cx.provider.credential_service.clone(),
                cx.provider.config.max_auth_attempts,
            );
            BoxCloneService::new(layer.layer(inner))
        },
    },
    LayerSpec {
        kind: HandlerKind::LegacyTokenAuthentication,
        enabled: |cx| cx.provider.config.legacy_token_auth,
        apply: |cx, inner| {
            let layer = LegacyTokenAuthenticationLayer::new(
                cx.uri.clone(),
                cx.provider.token_store.clone(),
            );
            BoxCloneService::new(layer.layer(inner))
        },
    },
    LayerSpec {
        kind: HandlerKind::SourceAuthentication,
        enabled: |cx| cx.native_controls,
        apply: |cx, inner| {
            let layer = SourceAuthenticationLayer::new(
                cx.source,
                cx.uri.clone(),
                cx.transport.clone(),
                cx.provider.credential_service.clone(),
                cx.provider.config.max_auth_attempts,
            );
            BoxCloneService::new(layer.layer(inner))
        },
    },
];

/// Factory of per-source HTTP pipelines.
///
/// Construction never performs I/O. The provider is cheap to clone and can
/// be shared; the collaborators it holds must tolerate concurrent use.
#[derive(Clone)]
pub struct HttpHandlerProvider {
    environment: Arc<dyn ExecutionEnvironment>,
    proxy_cache: Arc<dyn ProxyCache>,
    credential_service: SharedCredentialService,
    token_store: Option<Arc<dyn TokenStore>>,
    config: PipelineConfig,
}

impl fmt::Debug for HttpHandlerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandlerProvider")
            .field(
                "native_controls",
                &supports_native_transport_controls(self.environment.as_ref()),
            )
            .field("credential_service", &self.credential_service)
            .field("token_store", &self.token_store.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for HttpHandlerProvider {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HttpHandlerProvider {
    /// Create a new provider builder.
    #[must_use]
    pub fn builder() -> HttpHandlerProviderBuilder {
        HttpHandlerProviderBuilder::default()
    }

    /// The credential service slot shared by every pipeline of this provider.
    #[must_use]
    pub fn credential_service(&self) -> &SharedCredentialService {
        &self.credential_service
    }

    /// Pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build the pipeline for `source`.
    ///
    /// Returns `None` when the source is not reached over HTTP. Callers are
    /// expected to check [`PackageSource::is_http`] first; debug builds
    /// assert it.
    #[must_use]
    pub fn try_create(&self, source: &PackageSource) -> Option<HttpHandlerResource> {
        debug_assert!(
            source.is_http(),
            "HTTP pipeline requested for non-HTTP source '{}'",
            source.source()
        );
        if !source.is_http() {
            return None;
        }
        let uri = source.uri()?;

        let proxy = self.proxy_cache.get_proxy(uri);
        let native_controls = supports_native_transport_controls(self.environment.as_ref());
        let transport = build_transport_base(
            source,
            proxy.as_ref(),
            self.environment.as_ref(),
            &self.config.transport,
        );

        let cx = LayerContext {
            provider: self,
            source,
            uri,
            proxy: proxy.as_ref(),
            native_controls,
            transport: &transport,
        };

        let mut service: BoxedService = BoxCloneService::new(transport.clone());
        let mut layers = vec![HandlerKind::Transport];
        for spec in &LAYERS {
            if (spec.enabled)(&cx) {
                service = (spec.apply)(&cx, service);
                layers.push(spec.kind);
            }
        }
        layers.reverse();

        tracing::debug!(
            source = source.name(),
            uri = %uri,
            native_controls,
            proxy = ?proxy.as_ref().map(ProxyConfig::address),
            ?layers,
            "created HTTP pipeline"
        );

        Some(HttpHandlerResource::new(
            source.name(),
            service,
            transport,
            layers,
        ))
    }
}

/// Builder for [`HttpHandlerProvider`].
#[derive(Default)]
pub struct HttpHandlerProviderBuilder {
    environment: Option<Arc<dyn ExecutionEnvironment>>,
    proxy_cache: Option<Arc<dyn ProxyCache>>,
    credential_service: Option<SharedCredentialService>,
    token_store: Option<Arc<dyn TokenStore>>,
    config: Option<PipelineConfig>,
}

impl fmt::Debug for HttpHandlerProviderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandlerProviderBuilder")
            .field("environment", &self.environment.is_some())
            .field("proxy_cache", &self.proxy_cache.is_some())
            .field("credential_service", &self.credential_service)
            .field("token_store", &self.token_store.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl HttpHandlerProviderBuilder {
    /// Set the execution environment (default: [`RuntimeEnvironment::host`]).
    #[must_use]
    pub fn environment(mut self, environment: Arc<dyn ExecutionEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Set the proxy cache (default: [`SystemProxyCache::from_env`]).
    #[must_use]
    pub fn proxy_cache(mut self, proxy_cache: Arc<dyn ProxyCache>) -> Self {
        self.proxy_cache = Some(proxy_cache);
        self
    }

    /// Share a credential service slot, possibly filled later.
    #[must_use]
    pub fn credential_service(mut self, credential_service: SharedCredentialService) -> Self {
        self.credential_service = Some(credential_service);
        self
    }

    /// Set the token store used by the legacy token layer.
    #[must_use]
    pub fn token_store(mut self, token_store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(token_store);
        self
    }

    /// Set the pipeline configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the provider.
    #[must_use]
    pub fn build(self) -> HttpHandlerProvider {
        HttpHandlerProvider {
            environment: self
                .environment
                .unwrap_or_else(|| Arc::new(RuntimeEnvironment::host())),
            proxy_cache: self
                .proxy_cache
                .unwrap_or_else(|| Arc::new(SystemProxyCache::from_env())),
            credential_service: self.credential_service.unwrap_or_default(),
            token_store: self.token_store,
            config: self.config.unwrap_or_default(),
        }
    }
}
