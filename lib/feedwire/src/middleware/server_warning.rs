//! Server warning diagnostics.
//!
//! Feeds report deprecations and similar notices through a response header.
//! The layer logs them and leaves the response untouched.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::{Layer, Service};

use crate::{Error, Request, Response, Result};

/// Response header carrying server warnings.
pub const WARNING_HEADER: &str = "X-NuGet-Warning";

/// Warning sent by the server, if any.
#[must_use]
pub fn server_warning<B>(response: &Response<B>) -> Option<&str> {
    response
        .header(WARNING_HEADER)
        .map(str::trim)
        .filter(|warning| !warning.is_empty())
}

/// Layer that logs server warnings.
#[derive(Debug, Clone)]
pub struct ServerWarningLayer {
    source: Arc<str>,
}

impl ServerWarningLayer {
    /// Log warnings under the given package source name.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: Arc::from(source.into()),
        }
    }
}

impl<S> Layer<S> for ServerWarningLayer {
    type Service = ServerWarning<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServerWarning {
            inner,
            source: Arc::clone(&self.source),
        }
    }
}

/// Service that logs server warnings.
#[derive(Debug, Clone)]
pub struct ServerWarning<S> {
    inner: S,
    source: Arc<str>,
}

impl<S> Service<Request<Bytes>> for ServerWarning<S>
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
        let url = request.url().to_string();
        let source = Arc::clone(&self.source);

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let response = inner.call(request).await?;
            if let Some(warning) = server_warning(&response) {
                tracing::warn!(source = %source, %url, warning, "package source warning");
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::middleware::test_support::{count, get, response, scripted};

    #[test]
    fn warning_is_read_case_insensitively() {
        let warned = response(200, &[("x-nuget-warning", " deprecated feed ")]);
        assert_eq!(server_warning(&warned), Some("deprecated feed"));

        let plain = response(200, &[]);
        assert_eq!(server_warning(&plain), None);

        let blank = response(200, &[("x-nuget-warning", "  ")]);
        assert_eq!(server_warning(&blank), None);
    }

    #[tokio::test]
    async fn response_passes_through_unchanged() {
        let (inner, seen) = scripted(|_, _| {
            Ok(response(
                200,
                &[("x-nuget-warning", "moving to v3"), ("etag", "abc")],
            ))
        });
        let service = ServerWarningLayer::new("legacy").layer(inner);

        let response = service
            .oneshot(get("https://legacy.example/api/v2/"))
            .await
            .expect("response");

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("etag"), Some("abc"));
        assert_eq!(server_warning(&response), Some("moving to v3"));
        assert_eq!(count(&seen), 1);
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let (inner, _seen) = scripted(|_, _| Err(Error::Timeout));
        let service = ServerWarningLayer::new("slow").layer(inner);

        let err = service
            .oneshot(get("https://slow.example/"))
            .await
            .expect_err("timeout");
        assert!(err.is_timeout());
    }
}
