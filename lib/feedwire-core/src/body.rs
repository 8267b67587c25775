//! JSON body helpers.
//!
//! Package feeds answer with JSON documents (service index, registration
//! pages, search results). These helpers keep serialization errors inside
//! [`crate::Error`].

use bytes::Bytes;

use crate::Result;

/// Serialize a value to JSON bytes.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
///
/// # Example
///
/// ```
/// use feedwire_core::to_json;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Push { id: String }
///
/// let push = Push { id: "Newtonsoft.Json".to_string() };
/// let bytes = to_json(&push).expect("serialize");
/// assert_eq!(bytes.as_ref(), br#"{"id":"Newtonsoft.Json"}"#);
/// ```
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(Into::into)
}

/// Deserialize JSON bytes to a value with path-aware error messages.
///
/// Uses `serde_path_to_error` so the message names the field that failed,
/// e.g. `resources[3].@type`.
///
/// # Errors
///
/// Returns an error if JSON deserialization fails.
///
/// # Example
///
/// ```
/// use feedwire_core::from_json;
/// use serde::Deserialize;
///
/// #[derive(Debug, PartialEq, Deserialize)]
/// struct ServiceIndex { version: String }
///
/// let bytes = br#"{"version":"3.0.0"}"#;
/// let index: ServiceIndex = from_json(bytes).expect("deserialize");
/// assert_eq!(index.version, "3.0.0");
/// ```
pub fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|e| {
        crate::Error::json_deserialization(e.path().to_string(), e.inner().to_string())
    })
}
