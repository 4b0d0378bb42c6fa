//! # Configuration
//!
//! Typed configuration read from the process environment.
//!
//! | Variable             | Default                    |
//! |----------------------|----------------------------|
//! | `APP_NAME`           | `Keel`                     |
//! | `APP_ENV`            | `production`               |
//! | `APP_DEBUG`          | `false`                    |
//! | `APP_KEY`            | empty                      |
//! | `APP_HOST`           | `127.0.0.1`                |
//! | `APP_PORT`           | `8000`                     |
//! | `DB_URL`             | `sqlite::memory:`          |
//! | `DB_MAX_CONNECTIONS` | `10`                       |
//! | `MAX_BODY_SIZE`      | `1048576`                  |
//! | `LOG_FORMAT`         | `pretty`                   |

use crate::database::DEFAULT_MAX_CONNECTIONS;
use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Default request body limit (1 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// HTTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// Enable keep-alive connections
    pub keep_alive: bool,
    /// Shutdown timeout for graceful shutdown (default: 30 seconds)
    pub shutdown_timeout: Duration,
    /// Max request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([127, 0, 0, 1], 8000).into(),
            keep_alive: true,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable output
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::Config {
                key: "LOG_FORMAT".to_string(),
                reason: format!("expected 'json' or 'pretty', got '{other}'"),
            }),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application name
    pub name: String,
    /// Environment name (`local`, `production`, ...)
    pub env: String,
    /// Expose error details
    pub debug: bool,
    /// Secret used to sign tokens
    pub key: String,
    /// Listen host
    pub host: IpAddr,
    /// Listen port
    pub port: u16,
    /// Database connection URL
    pub db_url: String,
    /// Database pool size
    pub db_max_connections: u32,
    /// Request body limit in bytes
    pub max_body_size: usize,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Keel".to_string(),
            env: "production".to_string(),
            debug: false,
            key: String::new(),
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8000,
            db_url: "sqlite::memory:".to_string(),
            db_max_connections: DEFAULT_MAX_CONNECTIONS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            log_format: LogFormat::Pretty,
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for values that do not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup function
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for values that do not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            name: get("APP_NAME").unwrap_or(defaults.name),
            env: get("APP_ENV").unwrap_or(defaults.env),
            debug: get("APP_DEBUG").map_or(Ok(defaults.debug), |v| parse_bool("APP_DEBUG", &v))?,
            key: get("APP_KEY").unwrap_or(defaults.key),
            host: parse_or("APP_HOST", get("APP_HOST"), defaults.host)?,
            port: parse_or("APP_PORT", get("APP_PORT"), defaults.port)?,
            db_url: get("DB_URL").unwrap_or(defaults.db_url),
            db_max_connections: parse_or(
                "DB_MAX_CONNECTIONS",
                get("DB_MAX_CONNECTIONS"),
                defaults.db_max_connections,
            )?,
            max_body_size: parse_or("MAX_BODY_SIZE", get("MAX_BODY_SIZE"), defaults.max_body_size)?,
            log_format: get("LOG_FORMAT")
                .map_or(Ok(defaults.log_format), |v| v.parse())?,
        })
    }

    /// Whether the environment is `local`
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.env.eq_ignore_ascii_case("local")
    }

    /// Server settings derived from this configuration
    #[must_use]
    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            address: SocketAddr::new(self.host, self.port),
            max_body_size: self.max_body_size,
            ..ServerConfig::default()
        }
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map_or(Ok(default), |value| {
        value.trim().parse().map_err(|e: T::Err| Error::Config {
            key: key.to_string(),
            reason: format!("'{value}': {e}"),
        })
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config {
            key: key.to_string(),
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}
