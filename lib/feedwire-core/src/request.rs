//! HTTP request building.
//!
//! Use [`Request::builder`] to construct requests with headers, query parameters, and bodies.
//!
//! # Example
//!
//! ```
//! use feedwire_core::{Request, Method};
//! use bytes::Bytes;
//!
//! let url = "https://feed.example/v3/index.json".parse().unwrap();
//! let request = Request::<Bytes>::builder(Method::Get, url)
//!     .header("accept", "application/json")
//!     .build();
//! ```

use std::collections::HashMap;

use bytes::Bytes;

use crate::Method;

/// An HTTP request with method, URL, headers, and optional body.
#[derive(Debug, Clone)]
pub struct Request<B = Bytes> {
    method: Method,
    url: url::Url,
    headers: HashMap<String, String>,
    body: Option<B>,
}

impl<B> Request<B> {
    /// Creates a new [`RequestBuilder`].
    #[must_use]
    pub fn builder(method: Method, url: url::Url) -> RequestBuilder<B> {
        RequestBuilder::new(method, url)
    }

    /// Rebuild a request from its parts.
    #[must_use]
    pub fn from_parts(
        method: Method,
        url: url::Url,
        headers: HashMap<String, String>,
        body: Option<B>,
    ) -> Self {
        Self {
            method,
            url,
            headers,
            body,
        }
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Mutable access to headers.
    #[must_use]
    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }

    /// Single header value by exact name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns `true` if a header with this name is set, ignoring ASCII case.
    #[must_use]
    pub fn contains_header(&self, name: &str) -> bool {
        self.headers.keys().any(|key| key.eq_ignore_ascii_case(name))
    }

    /// Replace a header, dropping any spelling of the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|key, _| !key.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
    }

    /// Request body.
    #[must_use]
    pub const fn body(&self) -> Option<&B> {
        self.body.as_ref()
    }

    /// Consume into (method, url, headers, body).
    #[must_use]
    pub fn into_parts(self) -> (Method, url::Url, HashMap<String, String>, Option<B>) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// Builder for constructing [`Request`] instances.
#[derive(Debug, Clone)]
pub struct RequestBuilder<B = Bytes> {
    method: Method,
    url: url::Url,
    headers: HashMap<String, String>,
    body: Option<B>,
}

impl<B> RequestBuilder<B> {
    /// Creates a new builder.
    #[must_use]
    pub fn new(method: Method, url: url::Url) -> Self {
        Self {
            method,
            url,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Sets a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets multiple headers.
    #[must_use]
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Appends a query parameter to the URL.
    #[must_use]
    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: B) -> Self {
        self.body = Some(body);
        self
    }

    /// Builds the [`Request`].
    #[must_use]
    pub fn build(self) -> Request<B> {
        Request {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl RequestBuilder<Bytes> {
    /// Set a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json<T: serde::Serialize>(self, value: &T) -> crate::Result<Self> {
        let body = crate::to_json(value)?;
        Ok(self.header("content-type", "application/json").body(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_url() -> url::Url {
        url::Url::parse("https://feed.example/v3/index.json").expect("valid URL")
    }

    #[test]
    fn request_builder_basic() {
        let request = Request::<Bytes>::builder(Method::Get, index_url())
            .header("accept", "application/json")
            .build();

        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.url().as_str(), "https://feed.example/v3/index.json");
        assert_eq!(request.header("accept"), Some("application/json"));
        assert!(request.body().is_none());
    }

    #[test]
    fn request_builder_with_query() {
        let url = url::Url::parse("https://feed.example/query").expect("valid URL");
        let request = Request::<Bytes>::builder(Method::Get, url)
            .query("q", "serilog")
            .query("take", "20")
            .build();

        assert_eq!(
            request.url().as_str(),
            "https://feed.example/query?q=serilog&take=20"
        );
    }

    #[test]
    fn set_header_replaces_any_case() {
        let mut request = Request::<Bytes>::builder(Method::Get, index_url())
            .header("Authorization", "Basic old")
            .build();

        request.set_header("authorization", "Basic new");

        assert!(request.contains_header("AUTHORIZATION"));
        assert_eq!(request.headers().len(), 1);
        assert_eq!(request.header("authorization"), Some("Basic new"));
    }

    #[test]
    fn from_parts_round_trips_body() {
        let body = Bytes::from_static(b"nupkg");
        let request = Request::builder(Method::Put, index_url())
            .body(body.clone())
            .build();

        let (method, url, headers, body_part) = request.into_parts();
        let rebuilt = Request::from_parts(method, url, headers, body_part);

        assert_eq!(rebuilt.method(), Method::Put);
        assert_eq!(rebuilt.body(), Some(&body));
    }

    #[test]
    fn request_builder_json() {
        #[derive(serde::Serialize)]
        struct Listing {
            listed: bool,
        }

        let request = Request::builder(Method::Post, index_url())
            .json(&Listing { listed: false })
            .expect("json")
            .build();

        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(
            request.body(),
            Some(&Bytes::from_static(br#"{"listed":false}"#))
        );
    }
}
