//! # Application
//!
//! The application owns the service container, router, middleware and
//! exception handler, and runs the HTTP kernel:
//!
//! 1. assign `X-Request-Id` and attach the container
//! 2. global middleware `before_request`
//! 3. route match, then the route's middleware `before_request`
//! 4. handler
//! 5. route middleware `after_response` (reverse), then global (reverse)
//!
//! Any error along the way is rendered by the [`ExceptionHandler`].

use crate::auth::JwtGuard;
use crate::config::AppConfig;
use crate::container::Container;
use crate::error::{abort, Error, Result};
use crate::exception::ExceptionHandler;
use crate::middleware::{
    AuthMiddleware, CorsMiddleware, LoggingMiddleware, Middleware, MiddlewareChain,
    MiddlewareRegistry, MiddlewareResult, RateLimitMiddleware, TimingMiddleware,
};
use crate::provider::ServiceProvider;
use crate::request::Request;
use crate::response::Response;
use crate::router::{Match, Method, Router};
use crate::server::Server;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A Keel application
pub struct Application {
    config: AppConfig,
    container: Arc<Container>,
    router: Router,
    middleware: MiddlewareChain,
    registry: MiddlewareRegistry,
    route_middleware: Vec<MiddlewareChain>,
    providers: Vec<Box<dyn ServiceProvider>>,
    exceptions: ExceptionHandler,
    booted: bool,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.config.name)
            .field("routes", &self.router.routes().len())
            .field("middleware", &self.middleware)
            .field("providers", &self.providers.len())
            .field("booted", &self.booted)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Create an application with the built-in middleware aliases
    ///
    /// | alias      | middleware                                  |
    /// |------------|---------------------------------------------|
    /// | `log`      | [`LoggingMiddleware`]                       |
    /// | `timing`   | [`TimingMiddleware`]                        |
    /// | `cors`     | [`CorsMiddleware`]                          |
    /// | `throttle` | [`RateLimitMiddleware`], `throttle:<max>,<minutes>` |
    /// | `auth`     | [`AuthMiddleware`] keyed with `APP_KEY`     |
    ///
    /// and the `api` group (`throttle:60,1`).
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let container = Arc::new(Container::new());
        container.instance(config.clone());

        let guard = (!config.key.is_empty()).then(|| Arc::new(JwtGuard::new(&config.key)));
        if let Some(guard) = &guard {
            container.instance_arc(Arc::clone(guard));
        }

        let mut registry = MiddlewareRegistry::new();
        registry.alias_instance("log", LoggingMiddleware::new());
        registry.alias_instance("timing", TimingMiddleware::new());
        registry.alias_instance("cors", CorsMiddleware::new());
        registry.alias("throttle", RateLimitMiddleware::from_params);
        registry.alias("auth", move |_| {
            guard
                .as_ref()
                .map(|g| AuthMiddleware::new(Arc::clone(g)))
                .ok_or_else(|| Error::Config {
                    key: "APP_KEY".to_string(),
                    reason: "the auth middleware needs an application key".to_string(),
                })
        });
        registry.group("api", ["throttle:60,1"]);

        Self {
            exceptions: ExceptionHandler::new(config.debug),
            config,
            container,
            router: Router::new(),
            middleware: MiddlewareChain::new(),
            registry,
            route_middleware: Vec::new(),
            providers: Vec::new(),
            booted: false,
        }
    }

    /// Application configuration
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The service container
    #[must_use]
    pub const fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Resolve a service from the container
    ///
    /// # Errors
    ///
    /// Returns `Error::Unresolvable` if the service is not bound.
    pub fn make<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.container.make::<T>()
    }

    /// The router
    #[must_use]
    pub const fn router(&self) -> &Router {
        &self.router
    }

    /// The router, for registering routes
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Add a global middleware (runs for every request, matched or not)
    pub fn middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.middleware.add(middleware);
        self
    }

    /// The middleware alias registry
    pub fn registry_mut(&mut self) -> &mut MiddlewareRegistry {
        &mut self.registry
    }

    /// Replace the exception handler
    pub fn set_exception_handler(&mut self, handler: ExceptionHandler) {
        self.exceptions = handler;
    }

    /// Queue a service provider for bootstrapping
    pub fn register<P: ServiceProvider + 'static>(&mut self, provider: P) -> &mut Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Whether [`bootstrap`](Self::bootstrap) has completed
    #[must_use]
    pub const fn is_booted(&self) -> bool {
        self.booted
    }

    /// Run every provider's `register`, then every provider's `boot`, then
    /// resolve the middleware of every route
    ///
    /// Bootstrapping twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Provider` when a provider fails, or the resolution
    /// error of a route naming unknown middleware.
    pub fn bootstrap(&mut self) -> Result<()> {
        if self.booted {
            return Ok(());
        }

        let providers = std::mem::take(&mut self.providers);
        let result = self.run_providers(&providers);
        let added = std::mem::replace(&mut self.providers, providers);
        if !added.is_empty() {
            warn!(count = added.len(), "Providers registered during bootstrap are ignored");
        }
        result?;

        self.route_middleware = self
            .router
            .routes()
            .iter()
            .map(|route| self.registry.resolve(&route.middleware))
            .collect::<Result<_>>()?;

        self.booted = true;
        info!(
            app = %self.config.name,
            env = %self.config.env,
            routes = self.router.routes().len(),
            providers = self.providers.len(),
            "Application bootstrapped"
        );
        Ok(())
    }

    fn run_providers(&mut self, providers: &[Box<dyn ServiceProvider>]) -> Result<()> {
        for provider in providers {
            debug!(provider = provider.name(), "Registering provider");
            provider
                .register(self)
                .map_err(|e| provider_error(provider.name(), e))?;
        }
        for provider in providers {
            debug!(provider = provider.name(), "Booting provider");
            provider
                .boot(self)
                .map_err(|e| provider_error(provider.name(), e))?;
        }
        Ok(())
    }

    /// Dispatch a request through the kernel without touching the network
    pub async fn handle(&self, mut req: Request) -> Response {
        req.attach_container(Arc::clone(&self.container));
        if req.header("x-request-id").is_none() {
            req.set_header("x-request-id", &generate_request_id());
        }

        let (ran, outcome) = self.middleware.run_before(&mut req);
        let mut response = match outcome {
            MiddlewareResult::Continue => self.dispatch(&mut req).await,
            MiddlewareResult::Respond(response) => response,
            MiddlewareResult::Reject(err) => self.exceptions.render(&req, &err),
        };
        self.middleware.run_after(ran, &req, &mut response);

        if let Some(request_id) = req.header("x-request-id") {
            response.set_header("X-Request-Id", request_id);
        }
        response
    }

    async fn dispatch(&self, req: &mut Request) -> Response {
        let matched = match self.router.match_route(req.method, &req.path) {
            Ok(matched) => matched,
            Err(Error::MethodNotAllowed { allowed, .. }) if req.method == Method::Options => {
                return self.options(req, &allowed);
            }
            Err(err) => return self.exceptions.render(req, &err),
        };
        req.set_route(&matched);

        let handler_id = matched.handler_id();
        let chain = match self.route_chain(&matched) {
            Ok(chain) => chain,
            Err(err) => return self.exceptions.render(req, &err),
        };
        let Some(handler) = self.router.handler(handler_id) else {
            return self
                .exceptions
                .render(req, &abort(500, "Route has no handler"));
        };

        let (ran, outcome) = chain.run_before(req);
        let mut response = match outcome {
            MiddlewareResult::Continue => match handler(req.clone()).await {
                Ok(response) => response,
                Err(err) => self.exceptions.render(req, &err),
            },
            MiddlewareResult::Respond(response) => response,
            MiddlewareResult::Reject(err) => self.exceptions.render(req, &err),
        };
        chain.run_after(ran, req, &mut response);
        response
    }

    fn route_chain(&self, matched: &Match<'_>) -> Result<MiddlewareChain> {
        match self.route_middleware.get(matched.handler_id()) {
            Some(chain) => Ok(chain.clone()),
            None => self.registry.resolve(&matched.route.middleware),
        }
    }

    /// Automatic OPTIONS answer for a path routed under other methods
    ///
    /// Runs the middleware of the path's route so route-level `cors` can
    /// answer preflight requests, then replies 204 with an `Allow` header.
    fn options(&self, req: &mut Request, allowed: &[Method]) -> Response {
        let mut methods: Vec<String> = allowed.iter().map(ToString::to_string).collect();
        methods.push(Method::Options.to_string());
        let allow = methods.join(", ");

        let route_method = allowed.iter().copied().find(|m| *m != Method::Head);
        let chain = route_method
            .and_then(|method| self.router.match_route(method, &req.path).ok())
            .map(|matched| self.route_chain(&matched));
        let chain = match chain {
            Some(Ok(chain)) => chain,
            Some(Err(err)) => return self.exceptions.render(req, &err),
            None => MiddlewareChain::new(),
        };

        let (ran, outcome) = chain.run_before(req);
        let mut response = match outcome {
            MiddlewareResult::Continue => Response::no_content().with_header("Allow", &allow),
            MiddlewareResult::Respond(response) => response,
            MiddlewareResult::Reject(err) => self.exceptions.render(req, &err),
        };
        chain.run_after(ran, req, &mut response);
        response
    }

    /// Render an error the way the kernel would
    #[must_use]
    pub fn render_error(&self, req: &Request, err: &Error) -> Response {
        self.exceptions.render(req, err)
    }

    /// Bootstrap and serve over HTTP until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns bootstrapping errors and `Error::BindError` if the address
    /// cannot be bound.
    pub async fn serve(mut self) -> Result<()> {
        self.bootstrap()?;
        let server = Server::new(self.config.server());
        server.serve(Arc::new(self)).await
    }
}

fn provider_error(provider: &'static str, err: Error) -> Error {
    match err {
        Error::Provider { .. } => err,
        other => Error::Provider {
            provider,
            reason: other.to_string(),
        },
    }
}

static REQUEST_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Unique-enough request id: nanosecond clock plus a process counter
pub(crate) fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", now.as_nanos(), counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Method;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Mark {
        label: &'static str,
        trace: Trace,
        stop: bool,
    }

    impl Middleware for Mark {
        fn before_request(&self, _req: &mut Request) -> MiddlewareResult {
            self.trace.lock().unwrap().push(format!("{}:before", self.label));
            if self.stop {
                MiddlewareResult::Respond(Response::text("blocked").with_status(403))
            } else {
                MiddlewareResult::Continue
            }
        }

        fn after_response(&self, _req: &Request, _res: &mut Response) {
            self.trace.lock().unwrap().push(format!("{}:after", self.label));
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    struct Greeter {
        greeting: String,
    }

    struct GreeterProvider {
        trace: Trace,
    }

    impl ServiceProvider for GreeterProvider {
        fn name(&self) -> &'static str {
            "GreeterProvider"
        }

        fn register(&self, app: &mut Application) -> Result<()> {
            self.trace.lock().unwrap().push("greeter:register".to_string());
            app.container().singleton(|_| {
                Ok(Greeter {
                    greeting: "Hello".to_string(),
                })
            });
            app.router_mut()
                .get("/greet/{name}", |req: Request, greeter: Arc<Greeter>| async move {
                    let name = req.param("name").unwrap_or_default().to_string();
                    Ok(json!({"message": format!("{} {name}", greeter.greeting)}))
                })?
                .name("greet");
            Ok(())
        }

        fn boot(&self, app: &mut Application) -> Result<()> {
            self.trace.lock().unwrap().push("greeter:boot".to_string());
            app.make::<Greeter>().map(|_| ())
        }
    }

    struct Second {
        trace: Trace,
    }

    impl ServiceProvider for Second {
        fn name(&self) -> &'static str {
            "Second"
        }

        fn register(&self, _app: &mut Application) -> Result<()> {
            self.trace.lock().unwrap().push("second:register".to_string());
            Ok(())
        }

        fn boot(&self, _app: &mut Application) -> Result<()> {
            self.trace.lock().unwrap().push("second:boot".to_string());
            Ok(())
        }
    }

    struct Failing;

    impl ServiceProvider for Failing {
        fn name(&self) -> &'static str {
            "Failing"
        }

        fn register(&self, _app: &mut Application) -> Result<()> {
            Err(abort(500, "boom"))
        }
    }

    fn config() -> AppConfig {
        AppConfig {
            key: "test-key".to_string(),
            ..AppConfig::default()
        }
    }

    fn json_get(path: &str) -> Request {
        let headers = HashMap::from([("accept".to_string(), "application/json".to_string())]);
        Request::new(Method::Get, path.to_string(), headers, None)
    }

    fn body(response: &Response) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    fn trace_of(trace: &Trace) -> Vec<String> {
        trace.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_bootstrap_order_and_idempotence() {
        let trace = Trace::default();
        let mut app = Application::new(config());
        app.register(GreeterProvider {
            trace: Arc::clone(&trace),
        })
        .register(Second {
            trace: Arc::clone(&trace),
        });

        app.bootstrap().unwrap();
        app.bootstrap().unwrap();
        assert!(app.is_booted());
        assert_eq!(
            trace_of(&trace),
            [
                "greeter:register",
                "second:register",
                "greeter:boot",
                "second:boot"
            ]
        );

        let res = app.handle(json_get("/greet/Ada")).await;
        assert_eq!(res.status, 200);
        assert_eq!(body(&res)["message"], "Hello Ada");
    }

    #[tokio::test]
    async fn test_provider_failure_is_named() {
        let mut app = Application::new(config());
        app.register(Failing);
        let err = app.bootstrap().unwrap_err();
        assert!(matches!(err, Error::Provider { provider: "Failing", .. }));
        assert!(!app.is_booted());
    }

    #[tokio::test]
    async fn test_config_is_in_container() {
        let app = Application::new(config());
        assert_eq!(app.make::<AppConfig>().unwrap().key, "test-key");
        assert!(app.make::<JwtGuard>().is_ok());
    }

    #[tokio::test]
    async fn test_not_found_and_method_not_allowed() {
        let mut app = Application::new(config());
        app.router_mut()
            .post("/users", |_req: Request| async { Ok("created") })
            .unwrap();
        app.bootstrap().unwrap();

        let missing = app.handle(json_get("/nope")).await;
        assert_eq!(missing.status, 404);
        assert_eq!(body(&missing)["status"], 404);

        let wrong_method = app.handle(json_get("/users")).await;
        assert_eq!(wrong_method.status, 405);
        assert_eq!(wrong_method.header("allow"), Some("POST"));

        let html = app
            .handle(Request::new(Method::Get, "/nope".to_string(), HashMap::new(), None))
            .await;
        assert!(html.content_type.starts_with("text/html"));
    }

    #[tokio::test]
    async fn test_middleware_composition_order() {
        let trace = Trace::default();
        let mark = |label, stop| Mark {
            label,
            trace: Arc::clone(&trace),
            stop,
        };

        let mut app = Application::new(config());
        app.middleware(mark("global", false));
        app.registry_mut().alias_instance("outer", mark("outer", false));
        app.registry_mut().alias_instance("inner", mark("inner", false));
        app.registry_mut().group("both", ["outer", "inner"]);
        app.router_mut()
            .get("/ok", |_req: Request| async { Ok("ok") })
            .unwrap()
            .middleware(["both"]);
        app.bootstrap().unwrap();

        let res = app.handle(json_get("/ok")).await;
        assert_eq!(res.status, 200);
        assert_eq!(
            trace_of(&trace),
            [
                "global:before",
                "outer:before",
                "inner:before",
                "inner:after",
                "outer:after",
                "global:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_flows_back_through_ran_middleware() {
        let trace = Trace::default();
        let mut app = Application::new(config());
        app.registry_mut().alias_instance(
            "outer",
            Mark {
                label: "outer",
                trace: Arc::clone(&trace),
                stop: false,
            },
        );
        app.registry_mut().alias_instance(
            "gate",
            Mark {
                label: "gate",
                trace: Arc::clone(&trace),
                stop: true,
            },
        );
        app.registry_mut().alias_instance(
            "never",
            Mark {
                label: "never",
                trace: Arc::clone(&trace),
                stop: false,
            },
        );
        app.router_mut()
            .get("/guarded", |_req: Request| async { Ok("secret") })
            .unwrap()
            .middleware(["outer", "gate", "never"]);
        app.bootstrap().unwrap();

        let res = app.handle(json_get("/guarded")).await;
        assert_eq!(res.status, 403);
        assert_eq!(res.body, "blocked");
        assert_eq!(
            trace_of(&trace),
            ["outer:before", "gate:before", "gate:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_unknown_route_middleware_fails_bootstrap() {
        let mut app = Application::new(config());
        app.router_mut()
            .get("/", |_req: Request| async { Ok("home") })
            .unwrap()
            .middleware(["missing"]);
        assert!(matches!(
            app.bootstrap(),
            Err(Error::UnknownMiddleware { .. })
        ));
    }

    #[tokio::test]
    async fn test_auth_alias_guards_routes() {
        let mut app = Application::new(config());
        app.router_mut()
            .get("/me", |req: Request| async move {
                Ok(json!({"id": req.user().map(|u| u["sub"].clone())}))
            })
            .unwrap()
            .middleware(["auth"]);
        app.bootstrap().unwrap();

        let anonymous = app.handle(json_get("/me")).await;
        assert_eq!(anonymous.status, 401);

        let token = app.make::<JwtGuard>().unwrap().issue("5", &Value::Null).unwrap();
        let mut req = json_get("/me");
        req.set_header("authorization", &format!("Bearer {token}"));
        let res = app.handle(req).await;
        assert_eq!(res.status, 200);
        assert_eq!(body(&res)["id"], "5");
    }

    #[tokio::test]
    async fn test_auth_without_key_is_a_config_error() {
        let mut app = Application::new(AppConfig::default());
        app.router_mut()
            .get("/me", |_req: Request| async { Ok("me") })
            .unwrap()
            .middleware(["auth"]);
        assert!(matches!(app.bootstrap(), Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_throttle_returns_429_with_retry_after() {
        let mut app = Application::new(config());
        app.router_mut()
            .get("/limited", |_req: Request| async { Ok("ok") })
            .unwrap()
            .middleware(["throttle:1,1"]);
        app.bootstrap().unwrap();

        assert_eq!(app.handle(json_get("/limited")).await.status, 200);
        let limited = app.handle(json_get("/limited")).await;
        assert_eq!(limited.status, 429);
        assert!(limited.header("retry-after").is_some());
    }

    #[tokio::test]
    async fn test_request_id_assigned_or_echoed() {
        let mut app = Application::new(config());
        app.router_mut()
            .get("/", |_req: Request| async { Ok("home") })
            .unwrap();
        app.bootstrap().unwrap();

        let assigned = app.handle(json_get("/")).await;
        assert!(assigned.header("x-request-id").is_some_and(|id| !id.is_empty()));

        let mut req = json_get("/");
        req.set_header("x-request-id", "abc-123");
        let echoed = app.handle(req).await;
        assert_eq!(echoed.header("x-request-id"), Some("abc-123"));

        let missing = app.handle(json_get("/missing")).await;
        assert!(missing.header("x-request-id").is_some());
    }

    #[tokio::test]
    async fn test_handler_errors_are_rendered() {
        let mut app = Application::new(config());
        app.router_mut()
            .get("/fail", |_req: Request| async { Err::<Response, _>(abort(409, "Conflict here")) })
            .unwrap();
        app.router_mut()
            .get("/crash", |_req: Request| async {
                Err::<Response, _>(Error::database("disk full"))
            })
            .unwrap();
        app.bootstrap().unwrap();

        let conflict = app.handle(json_get("/fail")).await;
        assert_eq!(conflict.status, 409);
        assert_eq!(body(&conflict)["message"], "Conflict here");

        let crash = app.handle(json_get("/crash")).await;
        assert_eq!(crash.status, 500);
        assert_eq!(body(&crash)["message"], "Server Error");
    }

    #[tokio::test]
    async fn test_head_falls_back_to_get() {
        let mut app = Application::new(config());
        app.router_mut()
            .get("/ping", |_req: Request| async { Ok("pong") })
            .unwrap();
        app.bootstrap().unwrap();

        let res = app
            .handle(Request::new(Method::Head, "/ping".to_string(), HashMap::new(), None))
            .await;
        assert_eq!(res.status, 200);
    }

    #[tokio::test]
    async fn test_route_level_cors_answers_preflight() {
        let mut app = Application::new(config());
        app.router_mut()
            .post("/api/items", |_req: Request| async { Ok("created") })
            .unwrap()
            .middleware(["cors"]);
        app.bootstrap().unwrap();

        let headers = HashMap::from([
            ("origin".to_string(), "https://app.example".to_string()),
            ("access-control-request-method".to_string(), "POST".to_string()),
        ]);
        let preflight = app
            .handle(Request::new(Method::Options, "/api/items".to_string(), headers, None))
            .await;
        assert_eq!(preflight.status, 204);
        assert_eq!(preflight.header("access-control-allow-origin"), Some("*"));
        assert_eq!(preflight.header("access-control-max-age"), Some("86400"));
    }

    #[tokio::test]
    async fn test_options_without_route_lists_methods() {
        let mut app = Application::new(config());
        app.router_mut()
            .get("/users/{id:int}", |_req: Request| async { Ok("user") })
            .unwrap();
        app.bootstrap().unwrap();

        let res = app
            .handle(Request::new(Method::Options, "/users/3".to_string(), HashMap::new(), None))
            .await;
        assert_eq!(res.status, 204);
        assert_eq!(res.header("allow"), Some("GET, HEAD, OPTIONS"));
        assert!(res.header("access-control-allow-origin").is_none());

        let mismatch = app
            .handle(Request::new(Method::Options, "/users/x".to_string(), HashMap::new(), None))
            .await;
        assert_eq!(mismatch.status, 404);
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
