//! Tower layers composing a package-source pipeline.
//!
//! Every layer wraps a [`BoxedService`](crate::BoxedService) and is applied by
//! [`HttpHandlerProvider`](crate::HttpHandlerProvider) in a fixed order,
//! innermost first:
//!
//! | Layer | Present when |
//! |-------|--------------|
//! | [`ServerWarningLayer`] | always |
//! | [`ProxyAuthenticationLayer`] | native transport controls and a proxy |
//! | [`LegacyTokenAuthenticationLayer`] | `PipelineConfig::legacy_token_auth` |
//! | [`SourceAuthenticationLayer`] | native transport controls |
//!
//! The authentication layers never hold credentials themselves: they ask
//! the credential service and store the answer on the
//! [`TransportBase`](crate::TransportBase), then resend the request.

use derive_more::Display;
use feedwire_core::{Response, Result};

mod proxy_auth;
mod server_warning;
mod source_auth;
mod token_auth;

pub use proxy_auth::{ProxyAuthentication, ProxyAuthenticationLayer};
pub use server_warning::{ServerWarning, ServerWarningLayer, WARNING_HEADER, server_warning};
pub use source_auth::{SourceAuthentication, SourceAuthenticationLayer};
pub use token_auth::{LegacyTokenAuthentication, LegacyTokenAuthenticationLayer};

// Re-export tower types for convenience
pub use tower::{Layer, ServiceBuilder};

/// Kind of handler in a pipeline.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Endpoint credentials (401/403 challenges).
    #[display("source-authentication")]
    SourceAuthentication,
    /// Legacy security-token header.
    #[display("legacy-token-authentication")]
    LegacyTokenAuthentication,
    /// Proxy credentials (407 challenges).
    #[display("proxy-authentication")]
    ProxyAuthentication,
    /// Server warning diagnostics.
    #[display("server-warning")]
    ServerWarning,
    /// The transport base.
    #[display("transport")]
    Transport,
}

/// Status code of a response, or 407 for a refused proxy tunnel.
fn challenge_status<B>(outcome: &Result<Response<B>>) -> Option<u16> {
    match outcome {
        Ok(response) => Some(response.status()),
        Err(err) if err.is_proxy_authentication_required() => err.status(),
        Err(_) => None,
    }
}
