//! # Route Metadata
//!
//! Route definitions: the pattern as written, the normalized pattern handed
//! to matchit, declared parameter types, name and middleware.

use crate::error::{Error, Result};
use crate::router::{HandlerId, Method};
use crate::types::{convert_param, parse_param_pattern, ParamType};
use std::collections::HashMap;

/// Route metadata containing handler and type information
#[derive(Debug, Clone)]
pub struct RouteInfo {
    /// Index of the handler in the router
    pub handler_id: HandlerId,
    /// Methods this route answers
    pub methods: Vec<Method>,
    /// Original path pattern (e.g., "/users/{id:int}")
    pub path_pattern: String,
    /// Normalized path for matchit (e.g., "/users/{id}")
    pub match_pattern: String,
    /// Parameter name to type mapping
    pub param_types: HashMap<String, ParamType>,
    /// Route name used for reverse routing
    pub name: Option<String>,
    /// Middleware aliases applied to this route, outermost first
    pub middleware: Vec<String>,
    /// Name prefix inherited from enclosing groups
    name_prefix: String,
}

impl RouteInfo {
    /// Create a new RouteInfo from a path pattern
    ///
    /// Parses the pattern to extract parameter types and creates
    /// a normalized pattern for matchit routing.
    #[must_use]
    pub fn new(handler_id: HandlerId, methods: Vec<Method>, path: &str) -> Self {
        let (match_pattern, param_types) = Self::parse_path_pattern(path);

        Self {
            handler_id,
            methods,
            path_pattern: normalize_path(path),
            match_pattern,
            param_types,
            name: None,
            middleware: Vec::new(),
            name_prefix: String::new(),
        }
    }

    /// Name the route; group name prefixes are prepended
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.name = Some(format!("{}{}", self.name_prefix, name));
        self
    }

    /// Append middleware aliases to the route
    pub fn middleware<I, S>(&mut self, aliases: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.middleware.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub(crate) fn inherit(&mut self, name_prefix: String, middleware: Vec<String>) {
        self.name_prefix = name_prefix;
        self.middleware = middleware;
    }

    /// Parse path pattern to extract parameter types
    ///
    /// Converts `{name:type}` to `{name}` for matchit compatibility
    /// and builds the param_types map. Catch-all segments keep their `*`.
    fn parse_path_pattern(path: &str) -> (String, HashMap<String, ParamType>) {
        let mut param_types = HashMap::new();
        let mut normalized_parts = Vec::new();

        for segment in path.split('/') {
            if segment.is_empty() {
                continue;
            }

            if let Some(spec) = parse_param_pattern(segment) {
                if spec.catch_all {
                    normalized_parts.push(format!("{{*{}}}", spec.name));
                } else {
                    normalized_parts.push(format!("{{{}}}", spec.name));
                }
                param_types.insert(spec.name, spec.param_type);
            } else {
                normalized_parts.push(segment.to_string());
            }
        }

        let normalized = if normalized_parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", normalized_parts.join("/"))
        };

        (normalized, param_types)
    }

    /// Get the type for a parameter by name
    ///
    /// Returns `ParamType::String` if parameter not found.
    #[must_use]
    pub fn get_param_type(&self, name: &str) -> ParamType {
        self.param_types.get(name).copied().unwrap_or_default()
    }

    /// Build a URL for this route from parameter values
    ///
    /// Values are percent-encoded; a catch-all parameter keeps its `/`
    /// separators.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingRouteParameter` if a pattern parameter has no
    /// value and `Error::InvalidParameter` if a value does not fit the
    /// declared type.
    pub fn url(&self, params: &HashMap<&str, String>) -> Result<String> {
        let mut parts = Vec::new();
        for segment in self.path_pattern.split('/').filter(|s| !s.is_empty()) {
            let Some(spec) = parse_param_pattern(segment) else {
                parts.push(segment.to_string());
                continue;
            };
            let value = params
                .get(spec.name.as_str())
                .ok_or_else(|| Error::MissingRouteParameter {
                    route: self.name.clone().unwrap_or_default(),
                    parameter: spec.name.clone(),
                })?;
            convert_param(value, spec.param_type)?;

            if spec.catch_all {
                let pieces: Vec<String> = value
                    .split('/')
                    .filter(|p| !p.is_empty())
                    .map(encode_segment)
                    .collect();
                parts.push(pieces.join("/"));
            } else {
                parts.push(encode_segment(value));
            }
        }
        Ok(format!("/{}", parts.join("/")))
    }
}

/// Percent-encode everything outside the unreserved set
fn encode_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Collapse duplicate and trailing slashes (`/users/` -> `/users`)
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str) -> RouteInfo {
        RouteInfo::new(0, vec![Method::Get], path)
    }

    #[test]
    fn test_route_info_simple() {
        let info = info("/users");
        assert_eq!(info.match_pattern, "/users");
        assert!(info.param_types.is_empty());
        assert!(info.middleware.is_empty());
    }

    #[test]
    fn test_route_info_with_typed_param() {
        let info = info("/users/{id:int}");
        assert_eq!(info.match_pattern, "/users/{id}");
        assert_eq!(info.get_param_type("id"), ParamType::Int);
        assert_eq!(info.get_param_type("missing"), ParamType::String);
    }

    #[test]
    fn test_route_info_multiple_params() {
        let info = info("/users/{user_id:int}/posts/{post_id:int}");
        assert_eq!(info.match_pattern, "/users/{user_id}/posts/{post_id}");
        assert_eq!(info.get_param_type("user_id"), ParamType::Int);
        assert_eq!(info.get_param_type("post_id"), ParamType::Int);
    }

    #[test]
    fn test_route_info_catch_all() {
        let info = info("/files/{*path}");
        assert_eq!(info.match_pattern, "/files/{*path}");
    }

    #[test]
    fn test_route_info_root_and_trailing_slash() {
        assert_eq!(info("/").match_pattern, "/");
        assert_eq!(info("/users/").match_pattern, "/users");
        assert_eq!(normalize_path("//a//b/"), "/a/b");
    }

    #[test]
    fn test_name_uses_group_prefix() {
        let mut route = info("/users");
        route.inherit("admin.".to_string(), vec!["auth".to_string()]);
        route.name("users.index").middleware(["throttle"]);
        assert_eq!(route.name.as_deref(), Some("admin.users.index"));
        assert_eq!(route.middleware, vec!["auth", "throttle"]);
    }

    #[test]
    fn test_url_generation() {
        let mut route = info("/users/{id:int}/posts/{slug}");
        route.name("posts.show");

        let params = HashMap::from([("id", "7".to_string()), ("slug", "hello".to_string())]);
        assert_eq!(route.url(&params).unwrap(), "/users/7/posts/hello");

        let params = HashMap::from([("id", "7".to_string())]);
        assert!(matches!(
            route.url(&params),
            Err(Error::MissingRouteParameter { parameter, .. }) if parameter == "slug"
        ));
    }

    #[test]
    fn test_url_encodes_and_checks_types() {
        let route = info("/users/{id:int}/posts/{slug}");

        let params = HashMap::from([("id", "7".to_string()), ("slug", "a b/c?d".to_string())]);
        assert_eq!(route.url(&params).unwrap(), "/users/7/posts/a%20b%2Fc%3Fd");

        let params = HashMap::from([("id", "seven".to_string()), ("slug", "x".to_string())]);
        assert!(matches!(
            route.url(&params),
            Err(Error::InvalidParameter { expected: ParamType::Int, .. })
        ));

        let files = info("/files/{*path}");
        let params = HashMap::from([("path", "docs/read me.txt".to_string())]);
        assert_eq!(files.url(&params).unwrap(), "/files/docs/read%20me.txt");
    }
}
