//! Prelude module for convenient imports.
//!
//! ```ignore
//! use feedwire_core::prelude::*;
//! ```

pub use crate::{
    Error, HttpClient, HttpClientExt, Method, Request, RequestBuilder, Response, Result, from_json,
    to_json,
};
