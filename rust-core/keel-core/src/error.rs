//! # Error Handling
//!
//! Centralized error types for Keel core.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Every variant maps to an HTTP status through [`Error::status`], which is
//! what the exception handler uses when a handler or middleware fails.

use crate::router::Method;
use crate::types::ParamType;
use crate::validation::ValidationErrors;
use thiserror::Error;

/// Result type alias for Keel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Keel runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    BindError {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Router failed to match the requested path
    #[error("No route found for path: {path}")]
    RouteNotFound {
        /// The path that wasn't matched
        path: String,
    },

    /// The path exists but not for the requested method
    #[error("Method not allowed for path: {path} (allowed: {})", join_methods(.allowed))]
    MethodNotAllowed {
        /// The path that was matched
        path: String,
        /// Methods registered for this path
        allowed: Vec<Method>,
    },

    /// Invalid route pattern provided
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// A path segment could not be converted to the declared parameter type
    #[error("Cannot convert '{value}' to {expected}")]
    InvalidParameter {
        /// Raw segment value
        value: String,
        /// Declared type
        expected: ParamType,
    },

    /// `url_for` was called with a name no route carries
    #[error("Route [{name}] not defined")]
    UnknownRoute {
        /// Route name
        name: String,
    },

    /// `url_for` was called without a parameter the pattern needs
    #[error("Missing required parameter [{parameter}] for route [{route}]")]
    MissingRouteParameter {
        /// Route name
        route: String,
        /// Parameter name
        parameter: String,
    },

    /// Middleware alias or group is not registered
    #[error("Middleware [{name}] is not registered")]
    UnknownMiddleware {
        /// Alias as written on the route
        name: String,
    },

    /// The container has no binding for the requested type
    #[error("Target [{type_name}] is not bound in the container")]
    Unresolvable {
        /// Rust type name of the requested service
        type_name: &'static str,
    },

    /// A factory resolved, directly or indirectly, the type it is building
    #[error("Circular dependency detected while resolving [{type_name}]")]
    CircularDependency {
        /// Rust type name of the service that was requested again
        type_name: &'static str,
    },

    /// A service provider failed during register or boot
    #[error("Service provider {provider} failed: {reason}")]
    Provider {
        /// Provider name
        provider: &'static str,
        /// Failure description
        reason: String,
    },

    /// Configuration value could not be parsed
    #[error("Invalid configuration value for {key}: {reason}")]
    Config {
        /// Environment key
        key: String,
        /// Failure description
        reason: String,
    },

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// JSON serialization/deserialization error on the server side; client
    /// payloads that fail to parse are `BadRequest`
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {message}")]
    Database {
        /// Error message from database
        message: String,
    },

    /// A model lookup by key found nothing
    #[error("No query results for model [{model}] {key}")]
    ModelNotFound {
        /// Model name
        model: &'static str,
        /// Key that was looked up
        key: String,
    },

    /// Eager load requested a relation the model does not define
    #[error("Call to undefined relationship [{relation}] on model [{model}]")]
    UnknownRelation {
        /// Model name
        model: &'static str,
        /// Relation name
        relation: String,
    },

    /// Request payload too large
    #[error("Payload too large: limit={limit} bytes")]
    PayloadTooLarge {
        /// Max allowed size
        limit: usize,
    },

    /// Malformed request
    #[error("Bad request: {message}")]
    BadRequest {
        /// What was wrong with the request
        message: String,
    },

    /// Missing or invalid credentials
    #[error("Unauthenticated: {message}")]
    Unauthorized {
        /// Reason for rejection
        message: String,
    },

    /// Authenticated but not permitted
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Reason for rejection
        message: String,
    },

    /// Rate limit exceeded
    #[error("Too many attempts, retry after {retry_after}s")]
    TooManyRequests {
        /// Seconds until a token is available again
        retry_after: u64,
    },

    /// A validation rule string names an unknown rule or has bad arguments
    #[error("Invalid validation rule [{rule}] for field [{field}]")]
    InvalidRule {
        /// Field the rule was declared for
        field: String,
        /// Rule as written
        rule: String,
    },

    /// Input failed validation
    #[error("The given data was invalid.")]
    Validation(ValidationErrors),

    /// Explicit HTTP abort with a status code
    #[error("{message}")]
    Abort {
        /// HTTP status code
        status: u16,
        /// Message shown to the client
        message: String,
    },
}

impl Error {
    /// HTTP status code this error renders with
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::RouteNotFound { .. } | Self::ModelNotFound { .. } => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::PayloadTooLarge { .. } => 413,
            Self::BadRequest { .. } | Self::InvalidParameter { .. } => 400,
            Self::Unauthorized { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::TooManyRequests { .. } => 429,
            Self::Validation(_) => 422,
            Self::Abort { status, .. } => *status,
            _ => 500,
        }
    }

    /// Variant name, shown on the debug error page
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BindError { .. } => "BindError",
            Self::RouteNotFound { .. } => "RouteNotFound",
            Self::MethodNotAllowed { .. } => "MethodNotAllowed",
            Self::InvalidRoutePattern { .. } => "InvalidRoutePattern",
            Self::InvalidParameter { .. } => "InvalidParameter",
            Self::UnknownRoute { .. } => "UnknownRoute",
            Self::MissingRouteParameter { .. } => "MissingRouteParameter",
            Self::UnknownMiddleware { .. } => "UnknownMiddleware",
            Self::Unresolvable { .. } => "Unresolvable",
            Self::CircularDependency { .. } => "CircularDependency",
            Self::Provider { .. } => "Provider",
            Self::Config { .. } => "Config",
            Self::Http(_) => "Http",
            Self::Json(_) => "Json",
            Self::Io(_) => "Io",
            Self::Database { .. } => "Database",
            Self::ModelNotFound { .. } => "ModelNotFound",
            Self::UnknownRelation { .. } => "UnknownRelation",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::BadRequest { .. } => "BadRequest",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::Forbidden { .. } => "Forbidden",
            Self::TooManyRequests { .. } => "TooManyRequests",
            Self::InvalidRule { .. } => "InvalidRule",
            Self::Validation(_) => "Validation",
            Self::Abort { .. } => "Abort",
        }
    }

    /// Whether the error is the client's fault (4xx)
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Shorthand for a database error from any displayable source
    pub(crate) fn database(message: impl std::fmt::Display) -> Self {
        Self::Database {
            message: message.to_string(),
        }
    }
}

/// Abort the current request with a status code and message
///
/// ```ignore
/// if !allowed {
///     return Err(abort(403, "This action is unauthorized."));
/// }
/// ```
pub fn abort(status: u16, message: impl Into<String>) -> Error {
    Error::Abort {
        status,
        message: message.into(),
    }
}

fn join_methods(methods: &[Method]) -> String {
    methods
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_not_found_error() {
        let err = Error::RouteNotFound {
            path: "/unknown".to_string(),
        };
        assert!(err.to_string().contains("/unknown"));
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_bind_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = Error::BindError {
            address: "0.0.0.0:8000".to_string(),
            source: io_err,
        };
        assert!(err.to_string().contains("0.0.0.0:8000"));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let err = Error::MethodNotAllowed {
            path: "/users".to_string(),
            allowed: vec![Method::Get, Method::Post],
        };
        assert!(err.to_string().contains("GET, POST"));
        assert_eq!(err.status(), 405);
    }

    #[test]
    fn test_abort_carries_status() {
        let err = abort(418, "teapot");
        assert_eq!(err.status(), 418);
        assert_eq!(err.to_string(), "teapot");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_json_error_is_server_error() {
        let err: Error = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert_eq!(err.status(), 500);
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_validation_status() {
        let err = Error::Validation(ValidationErrors::new());
        assert_eq!(err.status(), 422);
    }
}
