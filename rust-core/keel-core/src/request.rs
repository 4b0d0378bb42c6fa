//! # HTTP Request
//!
//! Request wrapper with query, form and JSON input merged into a single
//! `input` view, route parameters, authenticated claims and a handle to the
//! service container.

use crate::container::Container;
use crate::error::{Error, Result};
use crate::json::parse_json_bytes;
use crate::router::{Match, Method};
use crate::types::ParamValue;
use crate::validation::Validator;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// HTTP Request
///
/// Body input is parsed once at construction:
/// - `application/json` bodies are kept as a JSON value
/// - `application/x-www-form-urlencoded` bodies as a string map
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method (after form method spoofing)
    pub method: Method,
    /// Request path (without query string)
    pub path: String,
    /// Raw query string (e.g., "page=1&limit=10")
    query_string: Option<String>,
    /// Parsed query parameters
    query_params: HashMap<String, String>,
    /// Raw route parameters
    pub params: HashMap<String, String>,
    /// Typed route parameters
    pub typed_params: HashMap<String, ParamValue>,
    /// Request headers
    headers: hyper::HeaderMap,
    /// Request body (collected)
    body: Option<Bytes>,
    /// Parsed form body
    form: HashMap<String, String>,
    /// Parsed JSON body
    json_body: Option<Value>,
    /// Validated JWT claims
    claims: Option<Value>,
    /// Name of the matched route
    route_name: Option<String>,
    /// Service container of the application handling the request
    container: Option<Arc<Container>>,
    started_at: Instant,
}

impl Request {
    /// Create a Request manually (for testing/internal use)
    ///
    /// `path` may carry a query string.
    #[must_use]
    pub fn new(
        method: Method,
        path: String,
        headers_map: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        let (path, query_string) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path, None),
        };

        let mut headers = hyper::HeaderMap::new();
        for (k, v) in headers_map {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                headers.insert(n, v);
            }
        }

        Self::assemble(method, path, query_string, headers, body)
    }

    /// Create from hyper request with body size limit
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` when the declared or actual body
    /// exceeds `max_body_size`, `Error::BadRequest` when the body cannot be
    /// read, and a 405 abort for methods the router cannot route.
    pub async fn from_hyper_with_limit(
        req: hyper::Request<hyper::body::Incoming>,
        max_body_size: usize,
    ) -> Result<Self> {
        let method = Method::from_hyper(req.method()).ok_or_else(|| Error::Abort {
            status: 405,
            message: format!("Unsupported HTTP method: {}", req.method()),
        })?;

        let uri = req.uri();
        let path = uri.path().to_string();
        let query_string = uri.query().map(String::from);

        let headers = req.headers().clone();
        let declared = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<usize>().ok());
        if let Some(content_len) = declared {
            if content_len > max_body_size {
                return Err(Error::PayloadTooLarge {
                    limit: max_body_size,
                });
            }
        }

        let body = read_body(req.into_body(), max_body_size).await?;
        Ok(Self::assemble(method, path, query_string, headers, body))
    }

    fn assemble(
        method: Method,
        path: String,
        query_string: Option<String>,
        headers: hyper::HeaderMap,
        body: Option<Bytes>,
    ) -> Self {
        let query_params = parse_query_string(query_string.as_deref());

        let mut request = Self {
            method,
            path,
            query_string,
            query_params,
            params: HashMap::new(),
            typed_params: HashMap::new(),
            headers,
            body,
            form: HashMap::new(),
            json_body: None,
            claims: None,
            route_name: None,
            container: None,
            started_at: Instant::now(),
        };
        request.parse_body();
        request.apply_method_override();
        request
    }

    fn parse_body(&mut self) {
        let Some(body) = self.body.as_ref().filter(|b| !b.is_empty()) else {
            return;
        };
        if self.is_json() {
            let mut bytes = body.to_vec();
            match parse_json_bytes::<Value>(&mut bytes) {
                Ok(value) => self.json_body = Some(value),
                Err(e) => tracing::debug!(error = %e, "Request body is not valid JSON"),
            }
        } else if self.content_type_is("application/x-www-form-urlencoded") {
            self.form = parse_query_string(std::str::from_utf8(body).ok());
        }
    }

    /// POST requests may tunnel PUT/PATCH/DELETE via `_method` or
    /// `X-HTTP-Method-Override`
    fn apply_method_override(&mut self) {
        if self.method != Method::Post {
            return;
        }
        let requested = self
            .header("x-http-method-override")
            .map(str::to_string)
            .or_else(|| self.form.get("_method").cloned());
        if let Some(Ok(method)) = requested.map(|m| m.parse::<Method>()) {
            if matches!(method, Method::Put | Method::Patch | Method::Delete) {
                self.method = method;
            }
        }
    }

    pub(crate) fn set_route(&mut self, matched: &Match<'_>) {
        self.params.clone_from(&matched.params);
        self.typed_params.clone_from(&matched.typed_params);
        self.route_name.clone_from(&matched.route.name);
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set or override a header
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
    }

    /// Get all headers as a HashMap
    #[must_use]
    pub fn headers_map(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect()
    }

    /// Get query parameters as a HashMap
    #[must_use]
    pub fn query_map(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Get a single query parameter
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }

    /// Get raw query string
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Get the request body as bytes
    #[must_use]
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Get the request body as string (UTF-8)
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        self.body_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Get a raw route parameter
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Get a route parameter declared as `{name:int}`
    #[must_use]
    pub fn param_int(&self, name: &str) -> Option<i64> {
        self.typed_params.get(name).and_then(ParamValue::as_int)
    }

    /// Look up one input value
    ///
    /// Body input (JSON or form) wins over the query string.
    #[must_use]
    pub fn input(&self, key: &str) -> Option<Value> {
        if let Some(value) = self
            .json_body
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|o| o.get(key))
        {
            return Some(value.clone());
        }
        self.form
            .get(key)
            .or_else(|| self.query_params.get(key))
            .map(|v| Value::String(v.clone()))
    }

    /// Look up one input value as a string
    #[must_use]
    pub fn input_str(&self, key: &str) -> Option<String> {
        match self.input(key)? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// All input: query, then form, then JSON object fields
    #[must_use]
    pub fn all(&self) -> Map<String, Value> {
        let mut all: Map<String, Value> = self
            .query_params
            .iter()
            .chain(self.form.iter())
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        if let Some(Value::Object(body)) = &self.json_body {
            for (k, v) in body {
                all.insert(k.clone(), v.clone());
            }
        }
        all
    }

    /// Whether an input key is present
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.input(key).is_some()
    }

    /// Subset of input with only the listed keys
    #[must_use]
    pub fn only(&self, keys: &[&str]) -> Map<String, Value> {
        keys.iter()
            .filter_map(|k| self.input(k).map(|v| ((*k).to_string(), v)))
            .collect()
    }

    /// Deserialize the JSON body
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` if the body is missing or malformed.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self.body.as_ref().ok_or_else(|| Error::BadRequest {
            message: "Request body is empty".to_string(),
        })?;
        let mut bytes = body.to_vec();
        parse_json_bytes(&mut bytes)
    }

    /// Validate all input against rule strings
    ///
    /// ```ignore
    /// let data = req.validate(&[("email", "required|email"), ("age", "integer|min:18")])?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` with every failed rule, or
    /// `Error::InvalidRule` if a rule string is malformed.
    pub fn validate(&self, rules: &[(&str, &str)]) -> Result<Map<String, Value>> {
        Validator::make(&self.all(), rules)?
            .validate()
            .map_err(Error::Validation)
    }

    fn content_type_is(&self, mime: &str) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with(mime))
    }

    /// Whether the body is declared as JSON
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }

    /// Whether the client expects a JSON response
    #[must_use]
    pub fn wants_json(&self) -> bool {
        let accepts_json = self
            .header("accept")
            .is_some_and(|a| a.to_ascii_lowercase().contains("json"));
        let ajax = self
            .header("x-requested-with")
            .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"));
        accepts_json || ajax || self.is_json()
    }

    /// Claims of the authenticated user, if any
    #[must_use]
    pub fn user(&self) -> Option<&Value> {
        self.claims.as_ref()
    }

    /// Attach authenticated claims
    pub fn set_user(&mut self, claims: Value) {
        self.claims = Some(claims);
    }

    /// Client address as recorded by the server
    #[must_use]
    pub fn client_ip(&self) -> Option<&str> {
        self.header("x-client-ip")
    }

    /// Name of the matched route
    #[must_use]
    pub fn route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    /// Time since the request was constructed
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Container of the application handling this request
    #[must_use]
    pub fn container(&self) -> Option<&Arc<Container>> {
        self.container.as_ref()
    }

    /// Attach the application container
    pub fn attach_container(&mut self, container: Arc<Container>) {
        self.container = Some(container);
    }

    /// Resolve a service from the application container
    ///
    /// # Errors
    ///
    /// Returns `Error::Unresolvable` if no container is attached or the
    /// service is not bound.
    pub fn make<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.container
            .as_ref()
            .ok_or(Error::Unresolvable {
                type_name: std::any::type_name::<T>(),
            })?
            .make::<T>()
    }
}

/// Collect a body, stopping as soon as it grows past `limit` bytes
async fn read_body<B>(body: B, limit: usize) -> Result<Option<Bytes>>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(Some(collected.to_bytes())),
        Err(e) if e.is::<LengthLimitError>() => Err(Error::PayloadTooLarge { limit }),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request body");
            Err(Error::BadRequest {
                message: "Failed to read request body".to_string(),
            })
        }
    }
}

/// Parse query string into HashMap
///
/// Handles URL decoding and duplicate keys (last value wins).
fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (url_decode(key), url_decode(value))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// URL decoding of `+` and `%XX` escapes; invalid UTF-8 is replaced
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = decoded {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
