//! # Middleware System
//!
//! Request/response interception for logging, timing, CORS, rate limiting
//! and authentication.
//!
//! Middleware run in order before the handler and in reverse order after it.
//! Routes name their middleware by alias (`"auth"`, `"throttle:60,1"`) or by
//! group (`"api"`); the [`MiddlewareRegistry`] turns those names into a
//! [`MiddlewareChain`].

use crate::auth::JwtGuard;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::router::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Middleware trait for request/response interception
pub trait Middleware: Send + Sync {
    /// Called before the request handler
    ///
    /// Can modify the request or stop the pipeline with a response or an
    /// error.
    fn before_request(&self, _req: &mut Request) -> MiddlewareResult {
        MiddlewareResult::Continue
    }

    /// Called after the request handler
    ///
    /// Can modify the response or perform logging.
    fn after_response(&self, _req: &Request, _res: &mut Response) {}

    /// Middleware name for logging
    fn name(&self) -> &'static str {
        "Unknown"
    }
}

/// Result of middleware execution
#[derive(Debug)]
pub enum MiddlewareResult {
    /// Continue to next middleware/handler
    Continue,
    /// Short-circuit with this response (skip handler)
    Respond(Response),
    /// Short-circuit with an error rendered by the exception handler
    Reject(Error),
}

/// Middleware chain for processing requests
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MiddlewareChain {
    /// Create a new empty middleware chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware to the chain
    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Add an already shared middleware
    pub fn push_arc(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Run `before_request` in order until one short-circuits
    ///
    /// Returns how many middleware ran (including the one that
    /// short-circuited) together with the outcome.
    pub fn run_before(&self, req: &mut Request) -> (usize, MiddlewareResult) {
        for (i, mw) in self.middlewares.iter().enumerate() {
            match mw.before_request(req) {
                MiddlewareResult::Continue => {}
                result => {
                    debug!(middleware = mw.name(), "Middleware short-circuited request");
                    return (i + 1, result);
                }
            }
        }
        (self.middlewares.len(), MiddlewareResult::Continue)
    }

    /// Run `after_response` in reverse order over the first `ran` middleware
    pub fn run_after(&self, ran: usize, req: &Request, res: &mut Response) {
        let ran = ran.min(self.middlewares.len());
        for mw in self.middlewares[..ran].iter().rev() {
            mw.after_response(req, res);
        }
    }

    /// Names of the middleware in order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Get the number of middlewares
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

type Factory = Arc<dyn Fn(&[&str]) -> Result<Arc<dyn Middleware>> + Send + Sync>;

/// Named middleware aliases and groups
///
/// ```ignore
/// registry.alias("throttle", |params| RateLimitMiddleware::from_params(params));
/// registry.group("api", ["throttle:60,1", "cors"]);
/// let chain = registry.resolve(&["api".to_string(), "auth".to_string()])?;
/// ```
///
/// Each distinct alias string is built once and reused, so stateful
/// middleware such as rate limiters keep their state across requests and
/// routes.
#[derive(Default)]
pub struct MiddlewareRegistry {
    aliases: HashMap<String, Factory>,
    groups: HashMap<String, Vec<String>>,
    resolved: Mutex<HashMap<String, Arc<dyn Middleware>>>,
}

impl std::fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut aliases: Vec<&String> = self.aliases.keys().collect();
        aliases.sort();
        f.debug_struct("MiddlewareRegistry")
            .field("aliases", &aliases)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl MiddlewareRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an alias whose factory receives the `:a,b` parameters
    pub fn alias<M, F>(&mut self, name: &str, build: F)
    where
        M: Middleware + 'static,
        F: Fn(&[&str]) -> Result<M> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |params: &[&str]| {
            build(params).map(|m| Arc::new(m) as Arc<dyn Middleware>)
        });
        self.aliases.insert(name.to_string(), factory);
    }

    /// Register an alias for one shared instance
    pub fn alias_instance<M: Middleware + 'static>(&mut self, name: &str, middleware: M) {
        let shared: Arc<dyn Middleware> = Arc::new(middleware);
        self.aliases
            .insert(name.to_string(), Arc::new(move |_: &[&str]| Ok(Arc::clone(&shared))));
    }

    /// Register a group of aliases (groups may contain groups)
    pub fn group<I, S>(&mut self, name: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(name.to_string(), members.into_iter().map(Into::into).collect());
    }

    /// Whether an alias or group exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let (alias, _) = split_spec(name);
        self.aliases.contains_key(alias) || self.groups.contains_key(name)
    }

    /// Build the chain for a list of aliases and groups
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownMiddleware` for a name that is neither an alias
    /// nor a group, or for a group that contains itself.
    pub fn resolve(&self, names: &[String]) -> Result<MiddlewareChain> {
        let mut chain = MiddlewareChain::new();
        let mut stack = Vec::new();
        for name in names {
            self.expand(name, &mut chain, &mut stack)?;
        }
        Ok(chain)
    }

    fn expand<'a>(
        &'a self,
        name: &'a str,
        chain: &mut MiddlewareChain,
        stack: &mut Vec<&'a str>,
    ) -> Result<()> {
        if let Some(members) = self.groups.get(name) {
            if stack.contains(&name) {
                return Err(Error::UnknownMiddleware {
                    name: format!("{name} (group contains itself)"),
                });
            }
            stack.push(name);
            for member in members {
                self.expand(member, chain, stack)?;
            }
            stack.pop();
            return Ok(());
        }
        chain.push_arc(self.build(name)?);
        Ok(())
    }

    fn build(&self, spec: &str) -> Result<Arc<dyn Middleware>> {
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = resolved.get(spec) {
            return Ok(Arc::clone(existing));
        }
        let (alias, params) = split_spec(spec);
        let factory = self
            .aliases
            .get(alias)
            .ok_or_else(|| Error::UnknownMiddleware {
                name: spec.to_string(),
            })?;
        let middleware = factory(&params)?;
        resolved.insert(spec.to_string(), Arc::clone(&middleware));
        Ok(middleware)
    }
}

/// `"throttle:60,1"` into `("throttle", ["60", "1"])`
fn split_spec(spec: &str) -> (&str, Vec<&str>) {
    match spec.split_once(':') {
        Some((alias, params)) => (
            alias,
            params.split(',').map(str::trim).filter(|p| !p.is_empty()).collect(),
        ),
        None => (spec, Vec::new()),
    }
}

/// Logging middleware - one structured line per request and response
#[derive(Default)]
pub struct LoggingMiddleware {
    log_headers: bool,
}

impl LoggingMiddleware {
    /// Create a new logging middleware
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable header logging
    #[must_use]
    pub fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }
}

impl Middleware for LoggingMiddleware {
    fn before_request(&self, req: &mut Request) -> MiddlewareResult {
        let request_id = req.header("x-request-id").unwrap_or("-");
        if self.log_headers {
            info!(
                method = %req.method,
                path = %req.path,
                request_id = %request_id,
                headers = ?req.headers_map(),
                "Request received"
            );
        } else {
            info!(
                method = %req.method,
                path = %req.path,
                request_id = %request_id,
                "Request received"
            );
        }
        MiddlewareResult::Continue
    }

    fn after_response(&self, req: &Request, res: &mut Response) {
        let request_id = req.header("x-request-id").unwrap_or("-");
        info!(
            method = %req.method,
            path = %req.path,
            status = res.status,
            request_id = %request_id,
            "Response sent"
        );
    }

    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }
}

/// Timing middleware - reports the request duration in `X-Response-Time`
#[derive(Debug, Default)]
pub struct TimingMiddleware;

impl TimingMiddleware {
    /// Create a new timing middleware
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Middleware for TimingMiddleware {
    fn after_response(&self, req: &Request, res: &mut Response) {
        let duration = req.elapsed();
        res.set_header(
            "X-Response-Time",
            &format!("{:.3}ms", duration.as_secs_f64() * 1000.0),
        );
        debug!(
            method = %req.method,
            path = %req.path,
            duration_ms = %duration.as_millis(),
            "Request timing"
        );
    }

    fn name(&self) -> &'static str {
        "TimingMiddleware"
    }
}

/// CORS middleware - adds Cross-Origin Resource Sharing headers and
/// answers preflight requests
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    allow_origin: String,
    allow_methods: String,
    allow_headers: String,
    max_age: u64,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization, X-Requested-With".to_string(),
            max_age: 86_400,
        }
    }
}

impl CorsMiddleware {
    /// Create a new CORS middleware with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set allowed origin
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allow_origin = origin.into();
        self
    }

    /// Set allowed methods
    #[must_use]
    pub fn allow_methods(mut self, methods: impl Into<String>) -> Self {
        self.allow_methods = methods.into();
        self
    }

    /// Set allowed headers
    #[must_use]
    pub fn allow_headers(mut self, headers: impl Into<String>) -> Self {
        self.allow_headers = headers.into();
        self
    }

    /// Get the Access-Control-Allow-Origin header value
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.allow_origin
    }

    fn is_preflight(req: &Request) -> bool {
        req.method == Method::Options && req.header("access-control-request-method").is_some()
    }
}

impl Middleware for CorsMiddleware {
    fn before_request(&self, req: &mut Request) -> MiddlewareResult {
        if Self::is_preflight(req) {
            let response = Response::no_content()
                .with_header("Access-Control-Max-Age", &self.max_age.to_string());
            return MiddlewareResult::Respond(response);
        }
        MiddlewareResult::Continue
    }

    fn after_response(&self, _req: &Request, res: &mut Response) {
        res.set_header("Access-Control-Allow-Origin", &self.allow_origin);
        res.set_header("Access-Control-Allow-Methods", &self.allow_methods);
        res.set_header("Access-Control-Allow-Headers", &self.allow_headers);
    }

    fn name(&self) -> &'static str {
        "CorsMiddleware"
    }
}

/// How often idle buckets are swept out of a rate limiter
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Token bucket rate limiting middleware, keyed by client address
pub struct RateLimitMiddleware {
    /// Maximum burst capacity
    capacity: f64,
    /// Tokens refilled per second
    refill_per_sec: f64,
    /// Per-key buckets
    state: Mutex<Buckets>,
}

struct Buckets {
    map: HashMap<String, Bucket>,
    last_sweep: Instant,
}

/// Internal token bucket state
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitMiddleware {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            state: Mutex::new(Buckets {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// `max_attempts` requests per `minutes` window
    #[must_use]
    pub fn per_minute(max_attempts: u32, minutes: u32) -> Self {
        let window = f64::from(minutes.max(1)) * 60.0;
        Self::new(max_attempts, f64::from(max_attempts) / window)
    }

    /// Build from `throttle:<max>,<minutes>` parameters (default `60,1`)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for non-numeric parameters.
    pub fn from_params(params: &[&str]) -> Result<Self> {
        let number = |index: usize, default: u32| -> Result<u32> {
            params.get(index).map_or(Ok(default), |raw| {
                raw.parse().map_err(|_| Error::Config {
                    key: "throttle".to_string(),
                    reason: format!("'{raw}' is not a whole number"),
                })
            })
        };
        Ok(Self::per_minute(number(0, 60)?, number(1, 1)?))
    }

    /// Take a token for `key`, or the seconds until one is available
    fn acquire(&self, key: &str) -> std::result::Result<(), u64> {
        self.acquire_at(key, Instant::now())
    }

    fn acquire_at(&self, key: &str, now: Instant) -> std::result::Result<(), u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_duration_since(state.last_sweep) >= SWEEP_INTERVAL {
            self.sweep(&mut state, now);
        }

        let bucket = state.map.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.refill_per_sec, bucket.tokens).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        let wait = if self.refill_per_sec > 0.0 {
            ((1.0 - bucket.tokens) / self.refill_per_sec).ceil()
        } else {
            60.0
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Err(wait.max(1.0) as u64)
    }

    /// Drop buckets that have refilled completely; they behave exactly like
    /// a fresh bucket
    fn sweep(&self, state: &mut Buckets, now: Instant) {
        state.last_sweep = now;
        if self.refill_per_sec <= 0.0 {
            return;
        }
        let before = state.map.len();
        state.map.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
            idle.mul_add(self.refill_per_sec, bucket.tokens) < self.capacity
        });
        let evicted = before - state.map.len();
        if evicted > 0 {
            debug!(evicted, remaining = state.map.len(), "Swept idle rate limit buckets");
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map
            .len()
    }
}

impl Middleware for RateLimitMiddleware {
    fn before_request(&self, req: &mut Request) -> MiddlewareResult {
        let key = req.client_ip().unwrap_or("unknown");
        match self.acquire(key) {
            Ok(()) => MiddlewareResult::Continue,
            Err(retry_after) => {
                tracing::warn!(client = key, retry_after, "Rate limit exceeded");
                MiddlewareResult::Reject(Error::TooManyRequests { retry_after })
            }
        }
    }

    fn name(&self) -> &'static str {
        "RateLimitMiddleware"
    }
}

/// Bearer token guard; verified claims are available as `req.user()`
#[derive(Debug, Clone)]
pub struct AuthMiddleware {
    guard: Arc<JwtGuard>,
}

impl AuthMiddleware {
    /// Guard requests with `guard`
    #[must_use]
    pub const fn new(guard: Arc<JwtGuard>) -> Self {
        Self { guard }
    }
}

impl Middleware for AuthMiddleware {
    fn before_request(&self, req: &mut Request) -> MiddlewareResult {
        match self.guard.authenticate(req) {
            Ok(claims) => {
                req.set_user(claims);
                MiddlewareResult::Continue
            }
            Err(e) => MiddlewareResult::Reject(e),
        }
    }

    fn name(&self) -> &'static str {
        "AuthMiddleware"
    }
}
