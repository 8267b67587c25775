//! HTTP methods used against package feeds.

/// HTTP request method.
///
/// Feeds are read with `GET`/`HEAD`, packages are pushed with `PUT`,
/// unlisted with `DELETE` and relisted with `POST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read a resource.
    Get,
    /// Read headers only, e.g. to probe a package download URL.
    Head,
    /// Push a package.
    Put,
    /// Unlist or delete a package.
    Delete,
    /// Relist a package or call a service endpoint.
    Post,
    /// Discover allowed methods.
    Options,
}

impl Method {
    /// Upper-case wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Post => "POST",
            Self::Options => "OPTIONS",
        }
    }

    /// Returns `true` if the method only reads.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Head => Self::HEAD,
            Method::Put => Self::PUT,
            Method::Delete => Self::DELETE,
            Method::Post => Self::POST,
            Method::Options => Self::OPTIONS,
        }
    }
}

impl TryFrom<http::Method> for Method {
    type Error = crate::Error;

    fn try_from(method: http::Method) -> Result<Self, Self::Error> {
        match method {
            http::Method::GET => Ok(Self::Get),
            http::Method::HEAD => Ok(Self::Head),
            http::Method::PUT => Ok(Self::Put),
            http::Method::DELETE => Ok(Self::Delete),
            http::Method::POST => Ok(Self::Post),
            http::Method::OPTIONS => Ok(Self::Options),
            other => Err(crate::Error::invalid_request(format!(
                "unsupported HTTP method for a package feed: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_display_matches_wire_name() {
        for method in [
            Method::Get,
            Method::Head,
            Method::Put,
            Method::Delete,
            Method::Post,
            Method::Options,
        ] {
            assert_eq!(method.to_string(), method.as_str());
            assert_eq!(http::Method::from(method).as_str(), method.as_str());
        }
    }

    #[test]
    fn method_is_read_only() {
        assert!(Method::Get.is_read_only());
        assert!(Method::Head.is_read_only());
        assert!(!Method::Put.is_read_only());
        assert!(!Method::Delete.is_read_only());
    }

    #[test]
    fn method_from_http() {
        assert_eq!(Method::try_from(http::Method::PUT).expect("PUT"), Method::Put);

        let err = Method::try_from(http::Method::PATCH).expect_err("PATCH unsupported");
        assert!(err.to_string().contains("PATCH"));
    }
}
