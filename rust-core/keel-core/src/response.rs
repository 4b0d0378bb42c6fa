//! # HTTP Response
//!
//! Response type returned by handlers and middleware, plus the
//! [`IntoResponse`] conversions that let handlers return plain values.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::StatusCode;
use serde::Serialize;
use std::collections::HashMap;

/// HTTP response
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
    /// Content type
    pub content_type: String,
    /// Response headers
    pub headers: HashMap<String, String>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("body", &self.body)
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .finish()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            body: String::new(),
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: HashMap::new(),
        }
    }
}

impl Response {
    /// Create a JSON response from any serializable value
    ///
    /// Serialization failures become a bare 500 JSON response.
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self::raw_json(body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize response body");
                Self::raw_json(r#"{"message":"Server Error"}"#).with_status(500)
            }
        }
    }

    /// Create a JSON response from an already encoded body
    #[must_use]
    pub fn raw_json(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/json".to_string(),
            ..Self::default()
        }
    }

    /// Create a text response
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Create an HTML response
    #[must_use]
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "text/html; charset=utf-8".to_string(),
            ..Self::default()
        }
    }

    /// Redirect (302) to a location
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        Self::default()
            .with_status(302)
            .with_header("Location", location)
    }

    /// Empty 204 response
    #[must_use]
    pub fn no_content() -> Self {
        Self::default().with_status(204)
    }

    /// Set status code
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set a header (builder form)
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    /// Set or override a header
    pub fn set_header(&mut self, key: &str, value: &str) {
        if key.eq_ignore_ascii_case("content-type") {
            self.content_type = value.to_string();
        } else {
            self.headers.insert(key.to_ascii_lowercase(), value.to_string());
        }
    }

    /// Get a header value (case-insensitive)
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        if key.eq_ignore_ascii_case("content-type") {
            return Some(&self.content_type);
        }
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert to hyper Response
    ///
    /// `HEAD` responses keep their headers but drop the body.
    pub(crate) fn into_hyper(self, head: bool) -> hyper::Response<Full<Bytes>> {
        let body = if head || self.status == 204 {
            Bytes::new()
        } else {
            Bytes::from(self.body)
        };
        let mut response = hyper::Response::new(Full::new(body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let headers = response.headers_mut();
        if self.status != 204 {
            if let Ok(value) = HeaderValue::from_str(&self.content_type) {
                headers.insert(hyper::header::CONTENT_TYPE, value);
            }
        }
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }
        response
    }
}

/// Conversion of handler return values into a [`Response`]
pub trait IntoResponse {
    /// Build the response
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        Response::text(self)
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        Response::text(self)
    }
}

impl IntoResponse for serde_json::Value {
    fn into_response(self) -> Response {
        Response::json(&self)
    }
}

impl IntoResponse for () {
    fn into_response(self) -> Response {
        Response::no_content()
    }
}

impl<R: IntoResponse> IntoResponse for (u16, R) {
    fn into_response(self) -> Response {
        let (status, inner) = self;
        inner.into_response().with_status(status)
    }
}

/// JSON body wrapper for serializable handler results
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        Response::json(&self.0)
    }
}
