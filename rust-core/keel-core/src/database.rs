//! # Database Module
//!
//! Async database connectivity with SQLx for PostgreSQL and SQLite.
//!
//! Statements are written with `?` placeholders and bound [`DbValue`]s.
//! For PostgreSQL the placeholders are rewritten to `$1..$n` before the
//! statement reaches the driver.

use crate::error::{Error, Result};
use crate::model::TIMESTAMP_FORMAT;
use crate::query::quote_identifier;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

/// One result row, column name to value
pub type Row = BTreeMap<String, DbValue>;

/// Default pool size when none is configured
pub(crate) const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// SQL flavour of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite (`?` placeholders)
    Sqlite,
    /// PostgreSQL (`$n` placeholders)
    Postgres,
}

impl Dialect {
    /// Adapt `?` placeholders to this dialect
    #[must_use]
    pub fn prepare(self, sql: &str) -> Cow<'_, str> {
        match self {
            Self::Sqlite => Cow::Borrowed(sql),
            Self::Postgres => Cow::Owned(numbered_placeholders(sql, &[]).0),
        }
    }

    /// Adapt placeholders and pick the values to bind
    ///
    /// PostgreSQL types every parameter, and a NULL bound as text cannot
    /// go into an integer or timestamp column, so NULL values are written
    /// into the statement as `null` instead of being bound.
    #[must_use]
    pub fn bind<'a, 's>(
        self,
        sql: &'s str,
        bindings: &'a [DbValue],
    ) -> (Cow<'s, str>, Vec<&'a DbValue>) {
        match self {
            Self::Sqlite => (Cow::Borrowed(sql), bindings.iter().collect()),
            Self::Postgres => {
                let (sql, bound) = numbered_placeholders(sql, bindings);
                (Cow::Owned(sql), bound)
            }
        }
    }
}

/// Rewrite `?` to `$1..$n`, leaving quoted literals and identifiers alone;
/// placeholders whose binding is NULL become a `null` literal
fn numbered_placeholders<'a>(sql: &str, bindings: &'a [DbValue]) -> (String, Vec<&'a DbValue>) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut bound = Vec::with_capacity(bindings.len());
    let mut quote: Option<char> = None;
    let mut index = 0;
    let mut n = 0;

    for c in sql.chars() {
        match (quote, c) {
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (None, '?') => {
                match bindings.get(index) {
                    Some(DbValue::Null) => out.push_str("null"),
                    value => {
                        bound.extend(value);
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    }
                }
                index += 1;
            }
            _ => out.push(c),
        }
    }
    (out, bound)
}

#[derive(Clone)]
enum Backend {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

#[derive(Debug, Default)]
struct QueryLog {
    enabled: bool,
    entries: Vec<String>,
}

/// Database connection pool supporting multiple backends
///
/// Cloning is cheap; clones share the underlying pool and query log.
#[derive(Clone)]
pub struct DatabasePool {
    backend: Backend,
    log: Arc<Mutex<QueryLog>>,
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("dialect", &self.dialect())
            .finish_non_exhaustive()
    }
}

/// Run a statement on whichever backend the pool wraps
macro_rules! dispatch {
    ($self:ident, $sql:ident, $bindings:ident, |$query:ident, $pool:ident| $body:expr) => {{
        $self.record($sql, $bindings);
        let (prepared, bound) = $self.dialect().bind($sql, $bindings);
        match &$self.backend {
            Backend::Sqlite($pool) => {
                let $query = bind_values!(sqlx::query(&prepared), bound);
                $body
            }
            Backend::Postgres($pool) => {
                let $query = bind_values!(sqlx::query(&prepared), bound);
                $body
            }
        }
    }};
}

macro_rules! bind_values {
    ($query:expr, $bindings:expr) => {{
        let mut query = $query;
        for value in $bindings {
            query = match value {
                DbValue::Null => query.bind(None::<String>),
                DbValue::Int(v) => query.bind(*v),
                DbValue::Float(v) => query.bind(*v),
                DbValue::String(v) => query.bind(v.clone()),
                DbValue::Bool(v) => query.bind(*v),
                DbValue::Bytes(v) => query.bind(v.clone()),
            };
        }
        query
    }};
}

impl DatabasePool {
    /// Connect to the database named by `url`
    ///
    /// `sqlite:` URLs open SQLite, `postgres://` and `postgresql://` open
    /// PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown scheme, `Error::Database` if
    /// the connection fails.
    pub async fn connect(url: &str, max_connections: Option<u32>) -> Result<Self> {
        if url.starts_with("sqlite:") {
            Self::connect_sqlite(url, max_connections).await
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Self::connect_postgres(url, max_connections).await
        } else {
            Err(Error::Config {
                key: "DB_URL".to_string(),
                reason: format!("unsupported database URL scheme in '{url}'"),
            })
        }
    }

    /// Connect to a SQLite database
    ///
    /// # Arguments
    ///
    /// * `url` - Database URL (e.g., "sqlite:mydb.db" or "sqlite::memory:")
    /// * `max_connections` - Maximum pool size (default: 10)
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so
    /// in-memory pools should use a single connection.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let pool = DatabasePool::connect_sqlite("sqlite::memory:", Some(1)).await?;
    /// let pool = DatabasePool::connect_sqlite("sqlite:db.db", Some(20)).await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the URL is invalid or the connection fails.
    pub async fn connect_sqlite(url: &str, max_connections: Option<u32>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::database(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .map_err(|e| Error::database(format!("SQLite connection failed: {e}")))?;

        tracing::info!(url, "Connected to SQLite");
        Ok(Self::from_backend(Backend::Sqlite(pool)))
    }

    /// Connect to a PostgreSQL database
    ///
    /// # Example
    ///
    /// ```ignore
    /// let pool = DatabasePool::connect_postgres("postgres://localhost/mydb", None).await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the connection fails.
    pub async fn connect_postgres(url: &str, max_connections: Option<u32>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .connect(url)
            .await
            .map_err(|e| Error::database(format!("PostgreSQL connection failed: {e}")))?;

        tracing::info!("Connected to PostgreSQL");
        Ok(Self::from_backend(Backend::Postgres(pool)))
    }

    fn from_backend(backend: Backend) -> Self {
        Self {
            backend,
            log: Arc::new(Mutex::new(QueryLog::default())),
        }
    }

    /// SQL flavour of this pool
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        match self.backend {
            Backend::Sqlite(_) => Dialect::Sqlite,
            Backend::Postgres(_) => Dialect::Postgres,
        }
    }

    /// Start recording executed SQL
    pub fn enable_query_log(&self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.enabled = true;
        log.entries.clear();
    }

    /// SQL recorded since the log was enabled
    #[must_use]
    pub fn query_log(&self) -> Vec<String> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.entries.clone()
    }

    /// Clear recorded SQL
    pub fn flush_query_log(&self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.entries.clear();
    }

    fn record(&self, sql: &str, bindings: &[DbValue]) {
        tracing::debug!(sql, bindings = bindings.len(), "Executing statement");
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.enabled {
            log.entries.push(sql.to_string());
        }
    }

    /// Execute a statement that doesn't return rows (INSERT, UPDATE, DELETE, DDL)
    ///
    /// Returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the statement fails.
    pub async fn execute(&self, sql: &str, bindings: &[DbValue]) -> Result<u64> {
        dispatch!(self, sql, bindings, |query, pool| {
            let result = query
                .execute(pool)
                .await
                .map_err(|e| Error::database(format!("Query error: {e}")))?;
            Ok(result.rows_affected())
        })
    }

    /// Fetch all rows from a query
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn fetch_all(&self, sql: &str, bindings: &[DbValue]) -> Result<Vec<Row>> {
        dispatch!(self, sql, bindings, |query, pool| {
            let rows = query
                .fetch_all(pool)
                .await
                .map_err(|e| Error::database(format!("Query error: {e}")))?;
            Ok(rows.iter().map(RowExt::to_row).collect())
        })
    }

    /// Fetch a single row (optional)
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn fetch_optional(&self, sql: &str, bindings: &[DbValue]) -> Result<Option<Row>> {
        dispatch!(self, sql, bindings, |query, pool| {
            let row = query
                .fetch_optional(pool)
                .await
                .map_err(|e| Error::database(format!("Query error: {e}")))?;
            Ok(row.as_ref().map(RowExt::to_row))
        })
    }

    /// Fetch exactly one row
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails or returns no row.
    pub async fn fetch_one(&self, sql: &str, bindings: &[DbValue]) -> Result<Row> {
        self.fetch_optional(sql, bindings)
            .await?
            .ok_or_else(|| Error::database("Query returned no rows"))
    }

    /// Execute an INSERT and return the generated integer key
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the insert fails or no key comes back.
    pub async fn insert_get_id(
        &self,
        sql: &str,
        bindings: &[DbValue],
        primary_key: &str,
    ) -> Result<i64> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                self.record(sql, bindings);
                let result = bind_values!(sqlx::query(sql), bindings.iter())
                    .execute(pool)
                    .await
                    .map_err(|e| Error::database(format!("Query error: {e}")))?;
                Ok(result.last_insert_rowid())
            }
            Backend::Postgres(_) => {
                let returning = format!("{sql} returning {}", quote_identifier(primary_key));
                let row = self.fetch_one(&returning, bindings).await?;
                row.get(primary_key)
                    .and_then(DbValue::as_i64)
                    .ok_or_else(|| Error::database("INSERT returned no integer key"))
            }
        }
    }

    /// Close the database connection pool
    pub async fn close(&self) {
        match &self.backend {
            Backend::Sqlite(pool) => pool.close().await,
            Backend::Postgres(pool) => pool.close().await,
        }
    }
}

/// Database value types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DbValue {
    /// Null value
    Null,
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// String value
    String(String),
    /// Boolean value
    Bool(bool),
    /// Binary data
    Bytes(Vec<u8>),
}

impl DbValue {
    /// Whether the value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view; numeric strings are parsed
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Float view
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// String view
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Key used to match foreign keys against primary keys
    ///
    /// `Int(1)` and `String("1")` share a key; NULL and binary have none.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        match self {
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::Bool(v) => Some(i64::from(*v).to_string()),
            Self::Null | Self::Bytes(_) => None,
        }
    }

    /// Convert to a JSON value; binary data becomes an array of bytes
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => Value::from(*v),
            Self::String(s) => Value::String(s.clone()),
            Self::Bool(v) => Value::Bool(*v),
            Self::Bytes(b) => Value::from(b.clone()),
        }
    }

    /// Convert from a JSON scalar; arrays and objects are stored as JSON text
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            Value::String(s) => Self::String(s.clone()),
            other => Self::String(other.to_string()),
        }
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for DbValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl From<&Value> for DbValue {
    fn from(v: &Value) -> Self {
        Self::from_json(v)
    }
}

/// Row conversion shared by both drivers
trait RowExt {
    fn to_row(&self) -> Row;
}

impl RowExt for SqliteRow {
    /// SQLite is dynamically typed, so the storage class of each value
    /// decides the conversion rather than the declared column type.
    fn to_row(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(i, column)| (column.name().to_string(), sqlite_value(self, i)))
            .collect()
    }
}

fn sqlite_value(row: &SqliteRow, i: usize) -> DbValue {
    let storage = match row.try_get_raw(i) {
        Ok(raw) if raw.is_null() => return DbValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return DbValue::Null,
    };

    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(i).map(DbValue::Int),
        "REAL" => row.try_get_unchecked::<f64, _>(i).map(DbValue::Float),
        "BLOB" => row.try_get_unchecked::<Vec<u8>, _>(i).map(DbValue::Bytes),
        _ => row.try_get_unchecked::<String, _>(i).map(DbValue::String),
    };
    value.unwrap_or(DbValue::Null)
}

impl RowExt for PgRow {
    fn to_row(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let value = pg_value(self, i, column.type_info().name());
                (column.name().to_string(), value)
            })
            .collect()
    }
}

fn pg_value(row: &PgRow, i: usize, type_name: &str) -> DbValue {
    let value = match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(i)
            .map(|v| DbValue::from(v.map(i64::from))),
        "INT4" => row
            .try_get::<Option<i32>, _>(i)
            .map(|v| DbValue::from(v.map(i64::from))),
        "INT8" => row.try_get::<Option<i64>, _>(i).map(DbValue::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(i)
            .map(|v| DbValue::from(v.map(f64::from))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(i).map(DbValue::from),
        "BOOL" => row.try_get::<Option<bool>, _>(i).map(DbValue::from),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(i).map(DbValue::from),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(i)
            .map(|v| DbValue::from(v.map(|t| t.format(TIMESTAMP_FORMAT).to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
            .map(|v| DbValue::from(v.map(|t| t.to_rfc3339()))),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(i)
            .map(|v| DbValue::from(v.map(|d| d.to_string()))),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(i)
            .map(|v| v.map_or(DbValue::Null, decimal_value)),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(i)
            .map(|v| DbValue::from(v.map(|json| json.to_string()))),
        _ => row.try_get::<Option<String>, _>(i).map(DbValue::from),
    };
    value.unwrap_or_else(|e| {
        tracing::warn!(column = i, type_name, error = %e, "Unsupported column type, using NULL");
        DbValue::Null
    })
}

/// Whole decimals that fit become integers, the rest floats
fn decimal_value(value: Decimal) -> DbValue {
    if value.fract().is_zero() {
        if let Some(int) = value.to_i64() {
            return DbValue::Int(int);
        }
    }
    value
        .to_f64()
        .map_or_else(|| DbValue::String(value.to_string()), DbValue::Float)
}
