//! Prelude module for convenient imports.
//!
//! ```ignore
//! use feedwire::prelude::*;
//! ```

pub use crate::{
    ClientCertificate, CredentialRequest, CredentialRequestType, CredentialService, Credentials,
    Error, HandlerKind, HttpClient, HttpClientExt, HttpHandlerProvider, HttpHandlerResource,
    Method, PackageSource, PipelineConfig, ProxyCache, ProxyConfig, Request, RequestBuilder,
    Response, Result, RuntimeEnvironment, SharedCredentialService, StatusCode, SystemProxyCache,
    TransportBase, TransportConfig,
};
