//! # Keel Core
//!
//! Core runtime library for the Keel web framework.
//! Provides the service container, router, middleware pipeline, HTTP
//! kernel and server, query builder and model layer.
//!
//! ## Architecture
//!
//! An [`Application`] owns a [`Container`] and a [`Router`]. Service
//! providers bind services and register routes during bootstrap; after
//! that the application is shared behind an `Arc` and every request runs
//! through [`Application::handle`].
//!
//! ## Modules
//!
//! - `application` - HTTP kernel and bootstrapping
//! - `provider` - Service provider trait
//! - `container` - Type-keyed service container
//! - `server` - HTTP server built on Hyper
//! - `router` - Routing using matchit (radix trie)
//! - `route` - Route metadata and information
//! - `handler` - Type-erased async handlers
//! - `request` / `response` - HTTP abstractions
//! - `middleware` - Request/response middleware system
//! - `exception` - Error rendering (JSON or HTML)
//! - `validation` - Rule-based input validation
//! - `auth` - JWT bearer tokens
//! - `database` - SQLx database connectivity (SQLite, PostgreSQL)
//! - `query` - Fluent query builder
//! - `model` - Models, relations and eager loading
//! - `config` / `logging` - Environment configuration and tracing setup
//! - `json` - JSON parsing with simd-json
//! - `types` - Path parameter types and conversion
//! - `error` - Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod application;
pub mod auth;
pub mod config;
pub mod container;
pub mod database;
pub mod error;
pub mod exception;
pub mod handler;
pub mod json;
pub mod logging;
pub mod middleware;
pub mod model;
pub mod provider;
pub mod query;
pub mod request;
pub mod response;
pub mod route;
pub mod router;
pub mod server;
pub mod types;
pub mod validation;

pub use application::Application;
pub use auth::JwtGuard;
pub use config::{AppConfig, LogFormat, ServerConfig};
pub use container::{Container, Inject};
pub use database::{DatabasePool, DbValue, Dialect, Row};
pub use error::{abort, Error, Result};
pub use exception::ExceptionHandler;
pub use handler::{Handler, IntoHandler};
pub use json::{parse_json, to_json};
pub use middleware::{
    AuthMiddleware, CorsMiddleware, LoggingMiddleware, Middleware, MiddlewareChain,
    MiddlewareRegistry, MiddlewareResult, RateLimitMiddleware, TimingMiddleware,
};
pub use model::{Model, ModelMeta, ModelQuery, Record, Relation};
pub use provider::ServiceProvider;
pub use query::{Builder, Op, Paginator};
pub use request::Request;
pub use response::{IntoResponse, Json, Response};
pub use route::RouteInfo;
pub use router::{GroupAttributes, Method, Router};
pub use server::Server;
pub use types::{ParamType, ParamValue};
pub use validation::{FieldError, ValidationCode, ValidationErrors, ValidationResult, Validator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
