//! # Router
//!
//! Radix-trie based router using `matchit`, one trie per HTTP method.
//!
//! ## Features
//!
//! - Path parameter extraction (`/users/{id}`)
//! - Typed parameters (`/users/{id:int}`), a failed conversion is a miss
//! - Catch-all routes (`/files/{*path}`)
//! - Route groups with prefix, middleware and name prefix
//! - Named routes and reverse routing (`url_for`)
//! - 405 detection and `HEAD` to `GET` fallback

use crate::error::{Error, Result};
use crate::handler::{Handler, IntoHandler};
use crate::route::{normalize_path, RouteInfo};
use crate::types::{convert_param, ParamValue};
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use std::str::FromStr;

/// HTTP methods supported by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
    /// HTTP PATCH
    Patch,
    /// HTTP HEAD
    Head,
    /// HTTP OPTIONS
    Options,
}

impl Method {
    /// Every method, in the order `any` registers them
    pub const ALL: [Self; 7] = [
        Self::Get,
        Self::Head,
        Self::Post,
        Self::Put,
        Self::Patch,
        Self::Delete,
        Self::Options,
    ];

    /// Map a hyper method; extension methods are not routable
    #[must_use]
    pub fn from_hyper(method: &hyper::Method) -> Option<Self> {
        match *method {
            hyper::Method::GET => Some(Self::Get),
            hyper::Method::POST => Some(Self::Post),
            hyper::Method::PUT => Some(Self::Put),
            hyper::Method::DELETE => Some(Self::Delete),
            hyper::Method::PATCH => Some(Self::Patch),
            hyper::Method::HEAD => Some(Self::Head),
            hyper::Method::OPTIONS => Some(Self::Options),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
            Self::Patch => write!(f, "PATCH"),
            Self::Head => write!(f, "HEAD"),
            Self::Options => write!(f, "OPTIONS"),
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(Error::BadRequest {
                message: format!("Unsupported HTTP method: {other}"),
            }),
        }
    }
}

/// Route handler identifier
pub type HandlerId = usize;

/// Matched route with extracted and converted parameters
#[derive(Debug)]
pub struct Match<'a> {
    /// The matched route
    pub route: &'a RouteInfo,
    /// Raw extracted path parameters
    pub params: HashMap<String, String>,
    /// Typed path parameters
    pub typed_params: HashMap<String, ParamValue>,
}

impl<'a> Match<'a> {
    /// The handler ID for this route
    #[must_use]
    pub fn handler_id(&self) -> HandlerId {
        self.route.handler_id
    }

    /// Get a typed parameter by name
    #[must_use]
    pub fn get_typed(&self, name: &str) -> Option<&ParamValue> {
        self.typed_params.get(name)
    }

    /// Get a parameter as i64 (convenience method)
    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.typed_params.get(name).and_then(ParamValue::as_int)
    }

    /// Get a parameter as f64 (convenience method)
    #[must_use]
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.typed_params.get(name).and_then(ParamValue::as_float)
    }

    /// Get a parameter as bool (convenience method)
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.typed_params.get(name).and_then(ParamValue::as_bool)
    }
}

/// Attributes shared by every route registered inside a group
#[derive(Debug, Clone, Default)]
pub struct GroupAttributes {
    prefix: String,
    middleware: Vec<String>,
    name_prefix: String,
}

impl GroupAttributes {
    /// Empty group attributes
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Group with a path prefix
    #[must_use]
    pub fn prefix(prefix: &str) -> Self {
        Self::new().with_prefix(prefix)
    }

    /// Set the path prefix
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Add middleware aliases
    #[must_use]
    pub fn middleware<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.middleware.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Set the route name prefix (e.g. `"admin."`)
    #[must_use]
    pub fn name(mut self, prefix: &str) -> Self {
        self.name_prefix = prefix.to_string();
        self
    }
}

/// Router using one radix trie per method
#[derive(Clone, Default)]
pub struct Router {
    /// Per-method tries mapping patterns to route indexes
    method_routes: HashMap<Method, MatchitRouter<HandlerId>>,
    /// Route metadata indexed by handler ID
    routes: Vec<RouteInfo>,
    /// Handlers indexed by handler ID
    handlers: Vec<Handler>,
    /// Attributes of the groups currently being registered
    group_stack: Vec<GroupAttributes>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a new empty router
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route for the given methods and path pattern
    ///
    /// The current group prefix, middleware and name prefix are applied.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed or
    /// already registered for one of the methods.
    pub fn add_route(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: Handler,
    ) -> Result<&mut RouteInfo> {
        let handler_id = self.routes.len();
        let full_path = self.prefixed(path);

        let mut route_info = RouteInfo::new(handler_id, methods.to_vec(), &full_path);
        let (name_prefix, middleware) = self.inherited();
        route_info.inherit(name_prefix, middleware);

        for (inserted, method) in methods.iter().enumerate() {
            let result = self
                .method_routes
                .entry(*method)
                .or_insert_with(MatchitRouter::new)
                .insert(route_info.match_pattern.clone(), handler_id);

            if let Err(e) = result {
                // Undo earlier methods so no trie points at an unused ID
                for method in &methods[..inserted] {
                    if let Some(trie) = self.method_routes.get_mut(method) {
                        trie.remove(route_info.match_pattern.as_str());
                    }
                }
                return Err(Error::InvalidRoutePattern {
                    pattern: full_path,
                    reason: e.to_string(),
                });
            }
        }

        tracing::debug!(
            methods = ?methods,
            path = %route_info.path_pattern,
            handler_id,
            "Route registered"
        );

        self.routes.push(route_info);
        self.handlers.push(handler);
        Ok(&mut self.routes[handler_id])
    }

    /// Register routes inside a group
    ///
    /// Groups nest: prefixes and name prefixes concatenate, middleware
    /// lists append.
    ///
    /// # Errors
    ///
    /// Propagates any registration error from the closure.
    pub fn group<F>(&mut self, attributes: GroupAttributes, routes: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.group_stack.push(attributes);
        let result = routes(self);
        self.group_stack.pop();
        result
    }

    fn prefixed(&self, path: &str) -> String {
        let mut full = String::new();
        for group in &self.group_stack {
            full.push('/');
            full.push_str(group.prefix.trim_matches('/'));
        }
        full.push('/');
        full.push_str(path.trim_matches('/'));
        normalize_path(&full)
    }

    fn inherited(&self) -> (String, Vec<String>) {
        let name_prefix = self
            .group_stack
            .iter()
            .map(|g| g.name_prefix.as_str())
            .collect::<String>();
        let middleware = self
            .group_stack
            .iter()
            .flat_map(|g| g.middleware.iter().cloned())
            .collect();
        (name_prefix, middleware)
    }

    /// Match a request path against registered routes
    ///
    /// `HEAD` requests fall back to the `GET` route. Trailing slashes are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::RouteNotFound` if nothing matches (including a typed
    /// parameter that fails conversion) and `Error::MethodNotAllowed` if the
    /// path only matches under other methods.
    pub fn match_route(&self, method: Method, path: &str) -> Result<Match<'_>> {
        let path = normalize_path(path);

        let found = self.lookup(method, &path).or_else(|| {
            if method == Method::Head {
                self.lookup(Method::Get, &path)
            } else {
                None
            }
        });

        let Some((handler_id, raw_params)) = found else {
            let allowed = self.allowed_methods(&path);
            if allowed.is_empty() {
                return Err(Error::RouteNotFound { path });
            }
            return Err(Error::MethodNotAllowed { path, allowed });
        };

        let route = &self.routes[handler_id];
        let typed_params = typed_params(route, &raw_params).ok_or(Error::RouteNotFound { path })?;

        Ok(Match {
            route,
            params: raw_params,
            typed_params,
        })
    }

    fn lookup(&self, method: Method, path: &str) -> Option<(HandlerId, HashMap<String, String>)> {
        let matched = self.method_routes.get(&method)?.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some((*matched.value, params))
    }

    /// Methods that have a route matching this path, parameter types
    /// included
    #[must_use]
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let path = normalize_path(path);
        let mut allowed: Vec<Method> = self
            .method_routes
            .keys()
            .copied()
            .filter(|method| {
                self.lookup(*method, &path)
                    .is_some_and(|(id, params)| typed_params(&self.routes[id], &params).is_some())
            })
            .collect();
        if allowed.contains(&Method::Get) && !allowed.contains(&Method::Head) {
            allowed.push(Method::Head);
        }
        allowed.sort();
        allowed
    }

    /// Handler registered under an ID
    #[must_use]
    pub fn handler(&self, handler_id: HandlerId) -> Option<Handler> {
        self.handlers.get(handler_id).cloned()
    }

    /// All registered routes, in registration order
    #[must_use]
    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }

    /// Find a route by name
    #[must_use]
    pub fn route_by_name(&self, name: &str) -> Option<&RouteInfo> {
        self.routes
            .iter()
            .find(|r| r.name.as_deref() == Some(name))
    }

    /// Generate the URL of a named route
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRoute` for an unknown name and
    /// `Error::MissingRouteParameter` when a parameter is missing.
    pub fn url_for(&self, name: &str, params: &HashMap<&str, String>) -> Result<String> {
        self.route_by_name(name)
            .ok_or_else(|| Error::UnknownRoute {
                name: name.to_string(),
            })?
            .url(params)
    }

    /// Register a GET route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn get<A>(&mut self, path: &str, handler: impl IntoHandler<A>) -> Result<&mut RouteInfo> {
        self.add_route(&[Method::Get], path, handler.into_handler())
    }

    /// Register a POST route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn post<A>(&mut self, path: &str, handler: impl IntoHandler<A>) -> Result<&mut RouteInfo> {
        self.add_route(&[Method::Post], path, handler.into_handler())
    }

    /// Register a PUT route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn put<A>(&mut self, path: &str, handler: impl IntoHandler<A>) -> Result<&mut RouteInfo> {
        self.add_route(&[Method::Put], path, handler.into_handler())
    }

    /// Register a PATCH route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn patch<A>(&mut self, path: &str, handler: impl IntoHandler<A>) -> Result<&mut RouteInfo> {
        self.add_route(&[Method::Patch], path, handler.into_handler())
    }

    /// Register a DELETE route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn delete<A>(
        &mut self,
        path: &str,
        handler: impl IntoHandler<A>,
    ) -> Result<&mut RouteInfo> {
        self.add_route(&[Method::Delete], path, handler.into_handler())
    }

    /// Register an OPTIONS route
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn options<A>(
        &mut self,
        path: &str,
        handler: impl IntoHandler<A>,
    ) -> Result<&mut RouteInfo> {
        self.add_route(&[Method::Options], path, handler.into_handler())
    }

    /// Register a route answering every method
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn any<A>(&mut self, path: &str, handler: impl IntoHandler<A>) -> Result<&mut RouteInfo> {
        self.add_route(&Method::ALL, path, handler.into_handler())
    }

    /// Register a route answering the listed methods
    ///
    /// # Errors
    ///
    /// See [`Router::add_route`].
    pub fn match_methods<A>(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: impl IntoHandler<A>,
    ) -> Result<&mut RouteInfo> {
        self.add_route(methods, path, handler.into_handler())
    }
}

/// Convert raw segments to the route's declared types; `None` when a
/// segment fails its constraint
fn typed_params(
    route: &RouteInfo,
    raw_params: &HashMap<String, String>,
) -> Option<HashMap<String, ParamValue>> {
    raw_params
        .iter()
        .map(|(name, value)| match convert_param(value, route.get_param_type(name)) {
            Ok(typed) => Some((name.clone(), typed)),
            Err(e) => {
                tracing::debug!(param = %name, error = %e, "Route constraint rejected segment");
                None
            }
        })
        .collect()
}
