//! Error types for feedwire.

use derive_more::{Display, Error, From};

/// Main error type for feedwire operations.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    /// HTTP-level errors (non-2xx status codes).
    #[display("HTTP error {status}: {message}")]
    #[from(skip)]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
        /// Response body, if available.
        #[error(not(source))]
        body: Option<bytes::Bytes>,
    },

    /// Network/connection errors.
    #[display("connection error: {_0}")]
    #[from(skip)]
    Connection(#[error(not(source))] String),

    /// TLS/SSL errors.
    #[display("TLS error: {_0}")]
    #[from(skip)]
    Tls(#[error(not(source))] String),

    /// Request timeout.
    #[display("request timeout")]
    #[from(skip)]
    Timeout,

    /// The proxy refused to open a tunnel without credentials (407).
    #[display("proxy authentication required by {proxy}")]
    #[from(skip)]
    ProxyAuthenticationRequired {
        /// Proxy address that issued the challenge.
        proxy: String,
    },

    /// Response body could not be decoded.
    #[display("decompression error: {_0}")]
    #[from(skip)]
    Decompression(#[error(not(source))] String),

    /// Client certificate or private key could not be loaded.
    #[display("invalid client certificate: {_0}")]
    #[from(skip)]
    InvalidCertificate(#[error(not(source))] String),

    /// Invalid request configuration.
    #[display("invalid request: {_0}")]
    #[from(skip)]
    InvalidRequest(#[error(not(source))] String),

    /// JSON serialization error.
    #[display("JSON serialization error: {_0}")]
    #[from]
    JsonSerialization(serde_json::Error),

    /// JSON deserialization error with path context.
    #[display("JSON deserialization error at '{path}': {message}")]
    #[from(skip)]
    JsonDeserialization {
        /// JSON path to the error (e.g., "resources[0].@id").
        path: String,
        /// Error message.
        message: String,
    },

    /// URL parsing error.
    #[display("invalid URL: {_0}")]
    #[from]
    InvalidUrl(url::ParseError),
}

/// Result type alias using [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an HTTP error from status code and message.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: None,
        }
    }

    /// Create an HTTP error with body.
    #[must_use]
    pub fn http_with_body(status: u16, message: impl Into<String>, body: bytes::Bytes) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: Some(body),
        }
    }

    /// Create a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a TLS error.
    #[must_use]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create a proxy authentication error for the given proxy.
    #[must_use]
    pub fn proxy_authentication_required(proxy: impl Into<String>) -> Self {
        Self::ProxyAuthenticationRequired {
            proxy: proxy.into(),
        }
    }

    /// Create a decompression error.
    #[must_use]
    pub fn decompression(message: impl Into<String>) -> Self {
        Self::Decompression(message.into())
    }

    /// Create an invalid certificate error.
    #[must_use]
    pub fn invalid_certificate(message: impl Into<String>) -> Self {
        Self::InvalidCertificate(message.into())
    }

    /// Create an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a JSON deserialization error with path context.
    #[must_use]
    pub fn json_deserialization(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JsonDeserialization {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns `true` if this is a connection error.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns `true` if a proxy asked for credentials.
    #[must_use]
    pub const fn is_proxy_authentication_required(&self) -> bool {
        matches!(self, Self::ProxyAuthenticationRequired { .. })
    }

    /// Returns the HTTP status code if this is an HTTP error.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::ProxyAuthenticationRequired { .. } => Some(407),
            _ => None,
        }
    }

    /// Returns `true` if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    /// Returns `true` if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }

    /// Returns the response body if this is an HTTP error with a body.
    #[must_use]
    pub fn body(&self) -> Option<&bytes::Bytes> {
        match self {
            Self::Http { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn error_display() {
        let err = Error::http(404, "Not Found");
        assert_eq!(err.to_string(), "HTTP error 404: Not Found");

        let err = Error::Timeout;
        assert_eq!(err.to_string(), "request timeout");

        let err = Error::connection("failed to connect");
        assert_eq!(err.to_string(), "connection error: failed to connect");

        let err = Error::proxy_authentication_required("http://proxy.corp:3128/");
        assert_eq!(
            err.to_string(),
            "proxy authentication required by http://proxy.corp:3128/"
        );

        let err = Error::json_deserialization("resources[0].@id", "missing field `@id`");
        assert_eq!(
            err.to_string(),
            "JSON deserialization error at 'resources[0].@id': missing field `@id`"
        );
    }

    #[test]
    fn error_status() {
        let err = Error::http(401, "Unauthorized");
        assert_eq!(err.status(), Some(401));
        assert!(err.is_client_error());
        assert!(!err.is_server_error());

        let err = Error::http(502, "Bad Gateway");
        assert!(err.is_server_error());

        let err = Error::proxy_authentication_required("http://proxy.corp:3128/");
        assert_eq!(err.status(), Some(407));
        assert!(err.is_proxy_authentication_required());

        assert_eq!(Error::Timeout.status(), None);
    }

    #[test]
    fn error_predicates() {
        check!(Error::Timeout.is_timeout());
        check!(!Error::http(404, "Not Found").is_timeout());
        check!(Error::connection("reset").is_connection());
        check!(!Error::Timeout.is_connection());
        check!(!Error::tls("bad cert").is_proxy_authentication_required());
        check!(Error::decompression("truncated gzip stream").status() == None);
    }

    #[test]
    fn error_body() {
        assert!(Error::http(404, "Not Found").body().is_none());

        let body = bytes::Bytes::from("feed not found");
        let err = Error::http_with_body(404, "Not Found", body.clone());
        assert_eq!(err.body(), Some(&body));

        assert!(Error::Timeout.body().is_none());
    }
}
