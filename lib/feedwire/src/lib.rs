//! Per-source HTTP pipelines for package feeds.
//!
//! A pipeline is a chain of Tower layers around a transport base. Which
//! layers exist depends on the runtime and the source configuration:
//!
//! ```text
//! SourceAuthentication          (native transport controls)
//!   LegacyTokenAuthentication   (PipelineConfig::legacy_token_auth)
//!     ProxyAuthentication       (native transport controls and a proxy)
//!       ServerWarning           (always)
//!         TransportBase         (proxy, gzip/deflate, client certificates)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use feedwire::prelude::*;
//!
//! let provider = HttpHandlerProvider::builder()
//!     .proxy_cache(Arc::new(SystemProxyCache::from_env()))
//!     .build();
//!
//! let source = PackageSource::new("nuget.org", "https://api.nuget.org/v3/index.json");
//! if let Some(pipeline) = provider.try_create(&source) {
//!     let index = pipeline.get("https://api.nuget.org/v3/index.json").await?;
//!     println!("{}", index.status());
//! }
//! ```

mod config;
mod connector;
mod credentials;
mod environment;
pub mod middleware;
pub mod prelude;
mod provider;
mod proxy;
mod resource;
mod source;
mod token;
mod transport;

pub use config::{
    DEFAULT_MAX_AUTH_ATTEMPTS, PipelineConfig, PipelineConfigBuilder, TransportConfig,
    TransportConfigBuilder,
};
pub use credentials::{
    CredentialFuture, CredentialRequest, CredentialRequestType, CredentialService, Credentials,
    SharedCredentialService,
};
pub use environment::{
    ExecutionEnvironment, RuntimeEnvironment, supports_native_transport_controls,
};
pub use middleware::HandlerKind;
pub use provider::{HttpHandlerProvider, HttpHandlerProviderBuilder};
pub use proxy::{ProxyCache, ProxyConfig, SystemProxyCache};
pub use resource::{BoxedService, HttpHandlerResource, ServiceFuture};
pub use source::{ClientCertificate, PackageSource};
pub use token::{
    ENDPOINT_HEADER, MemoryTokenStore, REALM_HEADER, SecurityToken, StsChallenge, TOKEN_HEADER,
    TokenStore,
};
pub use transport::{
    DecompressionMethods, TransportBase, TransportSettings, build_transport_base,
};

// Re-export tower for layer composition
pub use tower;

// Re-export core types
pub use feedwire_core::{
    Error, HttpClient, HttpClientExt, Method, Request, RequestBuilder, Response, Result,
    from_json, to_json,
};

// Re-export http types for status codes and headers
pub use feedwire_core::{StatusCode, header};

// Re-export crates appearing in the public API
pub use url;
