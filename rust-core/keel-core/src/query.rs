//! # Query Builder
//!
//! Fluent, owned SQL builder in the style of Laravel's query builder.
//!
//! ```ignore
//! let rows = pool
//!     .table("users")
//!     .where_eq("active", true)
//!     .where_op("age", Op::Gte, 18)
//!     .order_by_desc("created_at")
//!     .take(10)
//!     .get()
//!     .await?;
//! ```
//!
//! Values always travel as bindings; identifiers are quoted. Statements are
//! compiled with `?` placeholders and adapted to the pool's dialect when
//! executed.

use crate::database::{DatabasePool, DbValue, Dialect, Row};
use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Largest LIMIT/OFFSET either backend accepts (a signed 64-bit integer)
const MAX_ROWS: u64 = i64::MAX.unsigned_abs();

/// Comparison operators accepted in where and having clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `like`
    Like,
    /// `not like`
    NotLike,
}

impl Op {
    /// SQL text of the operator
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Like => "like",
            Self::NotLike => "not like",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Op {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::NotEq),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Lte),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Gte),
            "like" => Ok(Self::Like),
            "not like" => Ok(Self::NotLike),
            other => Err(Error::BadRequest {
                message: format!("Unsupported comparison operator: {other}"),
            }),
        }
    }
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// `count`
    Count,
    /// `max`
    Max,
    /// `min`
    Min,
    /// `sum`
    Sum,
    /// `avg`
    Avg,
}

impl Aggregate {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Max => "max",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::Avg => "avg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boolean {
    And,
    Or,
}

impl Boolean {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

#[derive(Debug, Clone)]
enum Condition {
    Basic {
        column: String,
        op: Op,
        value: DbValue,
    },
    In {
        column: String,
        values: Vec<DbValue>,
        not: bool,
    },
    Null {
        column: String,
        not: bool,
    },
    Between {
        column: String,
        low: DbValue,
        high: DbValue,
        not: bool,
    },
    Raw {
        sql: String,
        bindings: Vec<DbValue>,
    },
    Nested(Vec<Where>),
}

#[derive(Debug, Clone)]
struct Where {
    boolean: Boolean,
    condition: Condition,
}

#[derive(Debug, Clone)]
enum Column {
    Name(String),
    Raw(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone)]
struct Join {
    kind: JoinKind,
    table: String,
    first: String,
    op: Op,
    second: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Asc,
    Desc,
}

/// Fluent SQL query builder bound to one table
#[derive(Debug, Clone)]
pub struct Builder {
    pool: Option<DatabasePool>,
    table: String,
    columns: Vec<Column>,
    distinct: bool,
    joins: Vec<Join>,
    wheres: Vec<Where>,
    groups: Vec<String>,
    havings: Vec<Where>,
    orders: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl DatabasePool {
    /// Start a query against `table`
    #[must_use]
    pub fn table(&self, table: &str) -> Builder {
        Builder::table(table).on(self.clone())
    }
}

impl Builder {
    /// Start a query against `table` without a connection
    ///
    /// Such a builder can compile SQL; executing it needs [`Builder::on`].
    #[must_use]
    pub fn table(table: &str) -> Self {
        Self {
            pool: None,
            table: table.to_string(),
            columns: Vec::new(),
            distinct: false,
            joins: Vec::new(),
            wheres: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Attach the pool the query runs on
    #[must_use]
    pub fn on(mut self, pool: DatabasePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Table the query targets
    #[must_use]
    pub fn from_table(&self) -> &str {
        &self.table
    }

    /// Whether any where clause has been added
    #[must_use]
    pub fn has_wheres(&self) -> bool {
        !self.wheres.is_empty()
    }

    // ---- select ----

    /// Replace the selected columns
    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(|c| Column::Name(c.into())).collect();
        self
    }

    /// Add a column to the selection
    #[must_use]
    pub fn add_select(mut self, column: &str) -> Self {
        self.columns.push(Column::Name(column.to_string()));
        self
    }

    /// Add a raw select expression such as `count(*) as total`
    #[must_use]
    pub fn select_raw(mut self, expression: &str) -> Self {
        self.columns.push(Column::Raw(expression.to_string()));
        self
    }

    /// Select distinct rows
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    // ---- where ----

    fn push_where(mut self, boolean: Boolean, condition: Condition) -> Self {
        self.wheres.push(Where { boolean, condition });
        self
    }

    /// `column = value`
    #[must_use]
    pub fn where_eq(self, column: &str, value: impl Into<DbValue>) -> Self {
        self.where_op(column, Op::Eq, value)
    }

    /// `column <op> value`
    #[must_use]
    pub fn where_op(self, column: &str, op: Op, value: impl Into<DbValue>) -> Self {
        let condition = Condition::Basic {
            column: column.to_string(),
            op,
            value: value.into(),
        };
        self.push_where(Boolean::And, condition)
    }

    /// `or column <op> value`
    #[must_use]
    pub fn or_where(self, column: &str, op: Op, value: impl Into<DbValue>) -> Self {
        let condition = Condition::Basic {
            column: column.to_string(),
            op,
            value: value.into(),
        };
        self.push_where(Boolean::Or, condition)
    }

    /// `column in (...)`; an empty list matches nothing
    #[must_use]
    pub fn where_in<I>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<DbValue>,
    {
        let condition = Condition::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
            not: false,
        };
        self.push_where(Boolean::And, condition)
    }

    /// `column not in (...)`; an empty list matches everything
    #[must_use]
    pub fn where_not_in<I>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<DbValue>,
    {
        let condition = Condition::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
            not: true,
        };
        self.push_where(Boolean::And, condition)
    }

    /// `column is null`
    #[must_use]
    pub fn where_null(self, column: &str) -> Self {
        let condition = Condition::Null {
            column: column.to_string(),
            not: false,
        };
        self.push_where(Boolean::And, condition)
    }

    /// `column is not null`
    #[must_use]
    pub fn where_not_null(self, column: &str) -> Self {
        let condition = Condition::Null {
            column: column.to_string(),
            not: true,
        };
        self.push_where(Boolean::And, condition)
    }

    /// `column between low and high`
    #[must_use]
    pub fn where_between(
        self,
        column: &str,
        low: impl Into<DbValue>,
        high: impl Into<DbValue>,
    ) -> Self {
        let condition = Condition::Between {
            column: column.to_string(),
            low: low.into(),
            high: high.into(),
            not: false,
        };
        self.push_where(Boolean::And, condition)
    }

    /// `column not between low and high`
    #[must_use]
    pub fn where_not_between(
        self,
        column: &str,
        low: impl Into<DbValue>,
        high: impl Into<DbValue>,
    ) -> Self {
        let condition = Condition::Between {
            column: column.to_string(),
            low: low.into(),
            high: high.into(),
            not: true,
        };
        self.push_where(Boolean::And, condition)
    }

    /// Raw where fragment with its own `?` bindings
    #[must_use]
    pub fn where_raw(self, sql: &str, bindings: Vec<DbValue>) -> Self {
        let condition = Condition::Raw {
            sql: sql.to_string(),
            bindings,
        };
        self.push_where(Boolean::And, condition)
    }

    /// Parenthesised group of conditions joined with `and`
    ///
    /// ```ignore
    /// builder.where_group(|q| q.where_eq("role", "admin").or_where("votes", Op::Gt, 100))
    /// ```
    #[must_use]
    pub fn where_group(self, build: impl FnOnce(Self) -> Self) -> Self {
        self.group(Boolean::And, build)
    }

    /// Parenthesised group of conditions joined with `or`
    #[must_use]
    pub fn or_where_group(self, build: impl FnOnce(Self) -> Self) -> Self {
        self.group(Boolean::Or, build)
    }

    fn group(self, boolean: Boolean, build: impl FnOnce(Self) -> Self) -> Self {
        let nested = build(Self::table(&self.table)).wheres;
        self.push_where(boolean, Condition::Nested(nested))
    }

    /// Apply `build` only when `condition` holds
    #[must_use]
    pub fn when(self, condition: bool, build: impl FnOnce(Self) -> Self) -> Self {
        if condition {
            build(self)
        } else {
            self
        }
    }

    // ---- joins ----

    /// `inner join table on first <op> second`
    #[must_use]
    pub fn join(mut self, table: &str, first: &str, op: Op, second: &str) -> Self {
        self.joins.push(Join {
            kind: JoinKind::Inner,
            table: table.to_string(),
            first: first.to_string(),
            op,
            second: second.to_string(),
        });
        self
    }

    /// `left join table on first <op> second`
    #[must_use]
    pub fn left_join(mut self, table: &str, first: &str, op: Op, second: &str) -> Self {
        self.joins.push(Join {
            kind: JoinKind::Left,
            table: table.to_string(),
            first: first.to_string(),
            op,
            second: second.to_string(),
        });
        self
    }

    // ---- grouping ----

    /// `group by` columns
    #[must_use]
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(columns.into_iter().map(Into::into));
        self
    }

    /// `having column <op> value`
    #[must_use]
    pub fn having(mut self, column: &str, op: Op, value: impl Into<DbValue>) -> Self {
        self.havings.push(Where {
            boolean: Boolean::And,
            condition: Condition::Basic {
                column: column.to_string(),
                op,
                value: value.into(),
            },
        });
        self
    }

    // ---- ordering and paging ----

    /// Ascending order
    #[must_use]
    pub fn order_by(mut self, column: &str) -> Self {
        self.orders.push((column.to_string(), Direction::Asc));
        self
    }

    /// Descending order
    #[must_use]
    pub fn order_by_desc(mut self, column: &str) -> Self {
        self.orders.push((column.to_string(), Direction::Desc));
        self
    }

    /// Newest first by `created_at`
    #[must_use]
    pub fn latest(self) -> Self {
        self.order_by_desc("created_at")
    }

    /// Oldest first by `created_at`
    #[must_use]
    pub fn oldest(self) -> Self {
        self.order_by("created_at")
    }

    /// Maximum number of rows
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit.min(MAX_ROWS));
        self
    }

    /// Alias of [`Builder::limit`]
    #[must_use]
    pub fn take(self, limit: u64) -> Self {
        self.limit(limit)
    }

    /// Rows to skip
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset.min(MAX_ROWS));
        self
    }

    /// Alias of [`Builder::offset`]
    #[must_use]
    pub fn skip(self, offset: u64) -> Self {
        self.offset(offset)
    }

    /// Limit and offset for a 1-based page
    #[must_use]
    pub fn for_page(self, page: u64, per_page: u64) -> Self {
        let skipped = page.max(1) - 1;
        self.offset(skipped.saturating_mul(per_page)).limit(per_page)
    }

    // ---- compilation ----

    fn dialect(&self) -> Dialect {
        self.pool.as_ref().map_or(Dialect::Sqlite, DatabasePool::dialect)
    }

    /// Compile the select statement
    #[must_use]
    pub fn to_sql(&self) -> (String, Vec<DbValue>) {
        let mut bindings = Vec::new();
        let mut sql = String::from("select ");
        if self.distinct {
            sql.push_str("distinct ");
        }
        sql.push_str(&self.compile_columns());
        sql.push_str(" from ");
        sql.push_str(&quote_identifier(&self.table));

        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => "inner",
                JoinKind::Left => "left",
            };
            sql.push_str(&format!(
                " {kind} join {} on {} {} {}",
                quote_identifier(&join.table),
                quote_identifier(&join.first),
                join.op,
                quote_identifier(&join.second)
            ));
        }

        sql.push_str(&self.compile_wheres(&mut bindings));

        if !self.groups.is_empty() {
            let groups: Vec<String> = self.groups.iter().map(|g| quote_identifier(g)).collect();
            sql.push_str(" group by ");
            sql.push_str(&groups.join(", "));
        }

        let havings = compile_conditions(&self.havings, &mut bindings);
        if !havings.is_empty() {
            sql.push_str(" having ");
            sql.push_str(&havings);
        }

        if !self.orders.is_empty() {
            let orders: Vec<String> = self
                .orders
                .iter()
                .map(|(column, direction)| {
                    let direction = match direction {
                        Direction::Asc => "asc",
                        Direction::Desc => "desc",
                    };
                    format!("{} {direction}", quote_identifier(column))
                })
                .collect();
            sql.push_str(" order by ");
            sql.push_str(&orders.join(", "));
        }

        match (self.limit, self.offset, self.dialect()) {
            (Some(limit), _, _) => sql.push_str(&format!(" limit {limit}")),
            (None, Some(_), Dialect::Sqlite) => sql.push_str(" limit -1"),
            _ => {}
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" offset {offset}"));
        }

        (sql, bindings)
    }

    fn compile_columns(&self) -> String {
        if self.columns.is_empty() {
            return "*".to_string();
        }
        self.columns
            .iter()
            .map(|column| match column {
                Column::Name(name) => quote_identifier(name),
                Column::Raw(expression) => expression.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn compile_wheres(&self, bindings: &mut Vec<DbValue>) -> String {
        let wheres = compile_conditions(&self.wheres, bindings);
        if wheres.is_empty() {
            wheres
        } else {
            format!(" where {wheres}")
        }
    }

    /// Compile an insert of one row
    #[must_use]
    pub fn compile_insert(&self, values: &[(String, DbValue)]) -> (String, Vec<DbValue>) {
        let table = quote_identifier(&self.table);
        if values.is_empty() {
            return (format!("insert into {table} default values"), Vec::new());
        }
        let columns: Vec<String> = values.iter().map(|(c, _)| quote_identifier(c)).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        (
            format!(
                "insert into {table} ({}) values ({placeholders})",
                columns.join(", ")
            ),
            values.iter().map(|(_, v)| v.clone()).collect(),
        )
    }

    /// Compile an update of the matching rows
    #[must_use]
    pub fn compile_update(&self, values: &[(String, DbValue)]) -> (String, Vec<DbValue>) {
        let mut bindings: Vec<DbValue> = values.iter().map(|(_, v)| v.clone()).collect();
        let sets: Vec<String> = values
            .iter()
            .map(|(c, _)| format!("{} = ?", quote_identifier(c)))
            .collect();
        let wheres = self.compile_wheres(&mut bindings);
        (
            format!(
                "update {} set {}{wheres}",
                quote_identifier(&self.table),
                sets.join(", ")
            ),
            bindings,
        )
    }

    /// Compile a delete of the matching rows
    #[must_use]
    pub fn compile_delete(&self) -> (String, Vec<DbValue>) {
        let mut bindings = Vec::new();
        let wheres = self.compile_wheres(&mut bindings);
        (
            format!("delete from {}{wheres}", quote_identifier(&self.table)),
            bindings,
        )
    }

    /// Compile an aggregate over the matching rows
    ///
    /// Ordering and paging are dropped. Grouped or distinct queries are
    /// wrapped in a subquery so the aggregate runs over their result rows.
    #[must_use]
    pub fn compile_aggregate(&self, function: Aggregate, column: &str) -> (String, Vec<DbValue>) {
        let function = function.as_sql();
        if self.distinct || !self.groups.is_empty() {
            let (inner, bindings) = self.to_sql();
            let target = match column.rsplit('.').next() {
                Some("*") | None => "*".to_string(),
                Some(name) => quote_identifier(name),
            };
            return (
                format!(
                    "select {function}({target}) as \"aggregate\" from ({inner}) as \"aggregate_table\""
                ),
                bindings,
            );
        }

        let mut aggregate = self.clone();
        aggregate.columns = vec![Column::Raw(format!(
            "{function}({}) as \"aggregate\"",
            quote_identifier(column)
        ))];
        aggregate.orders.clear();
        aggregate.limit = None;
        aggregate.offset = None;
        aggregate.to_sql()
    }

    // ---- execution ----

    fn pool(&self) -> Result<&DatabasePool> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::database(format!("Query on '{}' has no connection", self.table)))
    }

    /// Fetch all matching rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn get(&self) -> Result<Vec<Row>> {
        let (sql, bindings) = self.to_sql();
        self.pool()?.fetch_all(&sql, &bindings).await
    }

    /// Fetch the first matching row
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn first(&self) -> Result<Option<Row>> {
        let (sql, bindings) = self.clone().limit(1).to_sql();
        self.pool()?.fetch_optional(&sql, &bindings).await
    }

    /// Fetch a row by its `id` column
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn find(&self, id: impl Into<DbValue>) -> Result<Option<Row>> {
        self.clone().where_eq("id", id).first().await
    }

    /// Single column of the first matching row
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn value(&self, column: &str) -> Result<Option<DbValue>> {
        let row = self.clone().select([column]).first().await?;
        Ok(row.and_then(|r| r.into_values().next()))
    }

    /// One column of every matching row
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn pluck(&self, column: &str) -> Result<Vec<DbValue>> {
        let rows = self.clone().select([column]).get().await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.into_values().next())
            .collect())
    }

    async fn aggregate(&self, function: Aggregate, column: &str) -> Result<DbValue> {
        let (sql, bindings) = self.compile_aggregate(function, column);
        let row = self.pool()?.fetch_optional(&sql, &bindings).await?;
        Ok(row
            .and_then(|mut r| r.remove("aggregate"))
            .unwrap_or(DbValue::Null))
    }

    /// Number of matching rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn count(&self) -> Result<i64> {
        Ok(self.aggregate(Aggregate::Count, "*").await?.as_i64().unwrap_or(0))
    }

    /// Whether any row matches
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn exists(&self) -> Result<bool> {
        let (inner, bindings) = self.to_sql();
        let sql = format!("select exists({inner}) as \"exists\"");
        let row = self.pool()?.fetch_one(&sql, &bindings).await?;
        Ok(row
            .get("exists")
            .and_then(DbValue::as_i64)
            .is_some_and(|v| v != 0))
    }

    /// Largest value of `column`
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn max(&self, column: &str) -> Result<DbValue> {
        self.aggregate(Aggregate::Max, column).await
    }

    /// Smallest value of `column`
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn min(&self, column: &str) -> Result<DbValue> {
        self.aggregate(Aggregate::Min, column).await
    }

    /// Sum of `column`
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn sum(&self, column: &str) -> Result<DbValue> {
        self.aggregate(Aggregate::Sum, column).await
    }

    /// Average of `column`, `None` when no row matches
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn avg(&self, column: &str) -> Result<Option<f64>> {
        Ok(self.aggregate(Aggregate::Avg, column).await?.as_f64())
    }

    /// Insert one row
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the insert fails.
    pub async fn insert<I, K, V>(&self, values: I) -> Result<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        let (sql, bindings) = self.compile_insert(&collect_values(values));
        self.pool()?.execute(&sql, &bindings).await
    }

    /// Insert one row and return its generated `id`
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the insert fails.
    pub async fn insert_get_id<I, K, V>(&self, values: I) -> Result<i64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        self.insert_get_key(&collect_values(values), "id").await
    }

    pub(crate) async fn insert_get_key(
        &self,
        values: &[(String, DbValue)],
        primary_key: &str,
    ) -> Result<i64> {
        let (sql, bindings) = self.compile_insert(values);
        self.pool()?
            .insert_get_id(&sql, &bindings, primary_key)
            .await
    }

    /// Update matching rows; returns the number of affected rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the update fails.
    pub async fn update<I, K, V>(&self, values: I) -> Result<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        let values = collect_values(values);
        if values.is_empty() {
            return Ok(0);
        }
        self.warn_if_unconstrained("update");
        let (sql, bindings) = self.compile_update(&values);
        self.pool()?.execute(&sql, &bindings).await
    }

    /// Delete matching rows; returns the number of affected rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the delete fails.
    pub async fn delete(&self) -> Result<u64> {
        self.warn_if_unconstrained("delete");
        let (sql, bindings) = self.compile_delete();
        self.pool()?.execute(&sql, &bindings).await
    }

    /// Add `amount` to `column` on matching rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the update fails.
    pub async fn increment(&self, column: &str, amount: i64) -> Result<u64> {
        self.warn_if_unconstrained("increment");
        let column = quote_identifier(column);
        let mut bindings = vec![DbValue::Int(amount)];
        let wheres = self.compile_wheres(&mut bindings);
        let sql = format!(
            "update {} set {column} = {column} + ?{wheres}",
            quote_identifier(&self.table)
        );
        self.pool()?.execute(&sql, &bindings).await
    }

    /// Subtract `amount` from `column` on matching rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the update fails.
    pub async fn decrement(&self, column: &str, amount: i64) -> Result<u64> {
        self.increment(column, -amount).await
    }

    /// One page of rows plus the total count
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if either query fails.
    pub async fn paginate(&self, page: u64, per_page: u64) -> Result<Paginator<Row>> {
        let total = u64::try_from(self.count().await?).unwrap_or(0);
        let page = page.max(1);
        let per_page = per_page.max(1);
        let data = self.clone().for_page(page, per_page).get().await?;
        Ok(Paginator::new(data, total, page, per_page))
    }

    fn warn_if_unconstrained(&self, statement: &str) {
        if self.wheres.is_empty() {
            tracing::warn!(table = %self.table, statement, "Statement without where clause affects every row");
        }
    }
}

fn collect_values<I, K, V>(values: I) -> Vec<(String, DbValue)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<DbValue>,
{
    values
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

fn compile_conditions(wheres: &[Where], bindings: &mut Vec<DbValue>) -> String {
    let mut sql = String::new();
    for clause in wheres {
        let Some(fragment) = compile_condition(&clause.condition, bindings) else {
            continue;
        };
        if !sql.is_empty() {
            sql.push(' ');
            sql.push_str(clause.boolean.as_sql());
            sql.push(' ');
        }
        sql.push_str(&fragment);
    }
    sql
}

fn compile_condition(condition: &Condition, bindings: &mut Vec<DbValue>) -> Option<String> {
    let not = |flag: bool| if flag { "not " } else { "" };
    let fragment = match condition {
        Condition::Basic { column, op, value } => {
            bindings.push(value.clone());
            format!("{} {op} ?", quote_identifier(column))
        }
        Condition::In {
            values, not: true, ..
        } if values.is_empty() => "1 = 1".to_string(),
        Condition::In { values, .. } if values.is_empty() => "0 = 1".to_string(),
        Condition::In {
            column,
            values,
            not: negated,
        } => {
            bindings.extend(values.iter().cloned());
            format!(
                "{} {}in ({})",
                quote_identifier(column),
                not(*negated),
                vec!["?"; values.len()].join(", ")
            )
        }
        Condition::Null {
            column,
            not: negated,
        } => format!("{} is {}null", quote_identifier(column), not(*negated)),
        Condition::Between {
            column,
            low,
            high,
            not: negated,
        } => {
            bindings.push(low.clone());
            bindings.push(high.clone());
            format!(
                "{} {}between ? and ?",
                quote_identifier(column),
                not(*negated)
            )
        }
        Condition::Raw {
            sql,
            bindings: raw,
        } => {
            bindings.extend(raw.iter().cloned());
            sql.clone()
        }
        Condition::Nested(inner) => {
            let nested = compile_conditions(inner, bindings);
            if nested.is_empty() {
                return None;
            }
            format!("({nested})")
        }
    };
    Some(fragment)
}

/// Quote an identifier: `users.id` becomes `"users"."id"`, `name as n`
/// becomes `"name" as "n"`, and `*` is left bare
#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    let lowered = identifier.to_ascii_lowercase();
    if let Some(at) = lowered.find(" as ") {
        let (column, alias) = (&identifier[..at], &identifier[at + 4..]);
        return format!(
            "{} as {}",
            quote_identifier(column.trim()),
            quote_segment(alias.trim())
        );
    }
    identifier
        .split('.')
        .map(quote_segment)
        .collect::<Vec<_>>()
        .join(".")
}

fn quote_segment(segment: &str) -> String {
    if segment == "*" {
        segment.to_string()
    } else {
        format!("\"{}\"", segment.replace('"', "\"\""))
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize)]
pub struct Paginator<T> {
    /// Items on this page
    pub data: Vec<T>,
    /// Total matching rows
    pub total: u64,
    /// Page size
    pub per_page: u64,
    /// 1-based page number
    pub current_page: u64,
    /// Number of the last page (at least 1)
    pub last_page: u64,
    /// 1-based position of the first item on this page
    pub from: Option<u64>,
    /// 1-based position of the last item on this page
    pub to: Option<u64>,
}

impl<T> Paginator<T> {
    /// Build a page from its items and the overall total
    #[must_use]
    pub fn new(data: Vec<T>, total: u64, current_page: u64, per_page: u64) -> Self {
        let per_page = per_page.max(1);
        let last_page = total.div_ceil(per_page).max(1);
        let (from, to) = if data.is_empty() {
            (None, None)
        } else {
            let from = current_page
                .saturating_sub(1)
                .saturating_mul(per_page)
                .saturating_add(1);
            let count = u64::try_from(data.len()).unwrap_or(u64::MAX);
            (Some(from), Some(from.saturating_add(count - 1)))
        };
        Self {
            data,
            total,
            per_page,
            current_page,
            last_page,
            from,
            to,
        }
    }

    /// Whether another page follows
    #[must_use]
    pub const fn has_more_pages(&self) -> bool {
        self.current_page < self.last_page
    }

    /// Convert the items, keeping the page metadata
    #[must_use]
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginator<U> {
        Paginator {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
            per_page: self.per_page,
            current_page: self.current_page,
            last_page: self.last_page,
            from: self.from,
            to: self.to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Builder {
        Builder::table("users")
    }

    #[test]
    fn test_select_all() {
        let (sql, bindings) = users().to_sql();
        assert_eq!(sql, r#"select * from "users""#);
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_select_columns_and_aliases() {
        let (sql, _) = users()
            .select(["id", "users.name as display_name"])
            .add_select("posts.*")
            .distinct()
            .to_sql();
        assert_eq!(
            sql,
            r#"select distinct "id", "users"."name" as "display_name", "posts".* from "users""#
        );
    }

    #[test]
    fn test_wheres_and_bindings() {
        let (sql, bindings) = users()
            .where_eq("active", true)
            .where_op("age", Op::Gte, 18)
            .or_where("role", Op::Eq, "admin")
            .to_sql();
        assert_eq!(
            sql,
            r#"select * from "users" where "active" = ? and "age" >= ? or "role" = ?"#
        );
        assert_eq!(
            bindings,
            vec![DbValue::Bool(true), DbValue::Int(18), DbValue::from("admin")]
        );
    }

    #[test]
    fn test_values_are_never_interpolated() {
        let (sql, bindings) = users().where_eq("name", "x' or 1=1 --").to_sql();
        assert!(!sql.contains("or 1=1"));
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn test_where_in_and_empty_lists() {
        let (sql, bindings) = users().where_in("id", [1, 2, 3]).to_sql();
        assert_eq!(sql, r#"select * from "users" where "id" in (?, ?, ?)"#);
        assert_eq!(bindings.len(), 3);

        let (sql, _) = users().where_in("id", Vec::<i64>::new()).to_sql();
        assert_eq!(sql, r#"select * from "users" where 0 = 1"#);

        let (sql, _) = users().where_not_in("id", Vec::<i64>::new()).to_sql();
        assert_eq!(sql, r#"select * from "users" where 1 = 1"#);
    }

    #[test]
    fn test_null_between_raw() {
        let (sql, bindings) = users()
            .where_null("deleted_at")
            .where_not_null("email")
            .where_between("age", 18, 65)
            .where_raw("lower(name) = ?", vec!["ada".into()])
            .to_sql();
        assert_eq!(
            sql,
            r#"select * from "users" where "deleted_at" is null and "email" is not null and "age" between ? and ? and lower(name) = ?"#
        );
        assert_eq!(bindings.len(), 3);
    }

    #[test]
    fn test_nested_groups() {
        let (sql, bindings) = users()
            .where_eq("active", 1)
            .where_group(|q| q.where_eq("role", "admin").or_where("votes", Op::Gt, 100))
            .or_where_group(|q| q)
            .to_sql();
        assert_eq!(
            sql,
            r#"select * from "users" where "active" = ? and ("role" = ? or "votes" > ?)"#
        );
        assert_eq!(bindings.len(), 3);
    }

    #[test]
    fn test_joins_groups_orders_paging() {
        let (sql, bindings) = users()
            .select(["users.id"])
            .select_raw("count(posts.id) as posts_count")
            .left_join("posts", "posts.user_id", Op::Eq, "users.id")
            .group_by(["users.id"])
            .having("posts_count", Op::Gt, 2)
            .order_by_desc("posts_count")
            .order_by("users.id")
            .for_page(3, 10)
            .to_sql();
        assert_eq!(
            sql,
            r#"select "users"."id", count(posts.id) as posts_count from "users" left join "posts" on "posts"."user_id" = "users"."id" group by "users"."id" having "posts_count" > ? order by "posts_count" desc, "users"."id" asc limit 10 offset 20"#
        );
        assert_eq!(bindings, vec![DbValue::Int(2)]);
    }

    #[test]
    fn test_offset_without_limit_on_sqlite() {
        let (sql, _) = users().skip(5).to_sql();
        assert_eq!(sql, r#"select * from "users" limit -1 offset 5"#);
    }

    #[test]
    fn test_when() {
        let search: Option<&str> = None;
        let (sql, _) = users()
            .when(search.is_some(), |q| q.where_op("name", Op::Like, "%a%"))
            .to_sql();
        assert_eq!(sql, r#"select * from "users""#);
    }

    #[test]
    fn test_compile_insert_update_delete() {
        let values = vec![
            ("name".to_string(), DbValue::from("Ada")),
            ("age".to_string(), DbValue::Int(36)),
        ];
        let (sql, bindings) = users().compile_insert(&values);
        assert_eq!(sql, r#"insert into "users" ("name", "age") values (?, ?)"#);
        assert_eq!(bindings.len(), 2);

        let (sql, bindings) = users().where_eq("id", 1).compile_update(&values);
        assert_eq!(sql, r#"update "users" set "name" = ?, "age" = ? where "id" = ?"#);
        assert_eq!(bindings[2], DbValue::Int(1));

        let (sql, bindings) = users().where_in("id", [1, 2]).compile_delete();
        assert_eq!(sql, r#"delete from "users" where "id" in (?, ?)"#);
        assert_eq!(bindings.len(), 2);

        let (sql, _) = users().compile_insert(&[]);
        assert_eq!(sql, r#"insert into "users" default values"#);
    }

    #[test]
    fn test_compile_aggregate() {
        let (sql, _) = users()
            .where_eq("active", 1)
            .order_by("id")
            .limit(5)
            .compile_aggregate(Aggregate::Count, "*");
        assert_eq!(
            sql,
            r#"select count(*) as "aggregate" from "users" where "active" = ?"#
        );

        let (sql, _) = users()
            .group_by(["role"])
            .compile_aggregate(Aggregate::Count, "*");
        assert_eq!(
            sql,
            r#"select count(*) as "aggregate" from (select * from "users" group by "role") as "aggregate_table""#
        );
    }

    #[test]
    fn test_operator_whitelist() {
        assert_eq!("<>".parse::<Op>().unwrap(), Op::NotEq);
        assert_eq!("NOT LIKE".parse::<Op>().unwrap(), Op::NotLike);
        assert!("; drop table users".parse::<Op>().is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), r#""users""#);
        assert_eq!(quote_identifier("u.*"), r#""u".*"#);
        assert_eq!(quote_identifier("name AS n"), r#""name" as "n""#);
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn test_for_page_huge_page_saturates() {
        let (sql, _) = users().for_page(u64::MAX, 15).to_sql();
        assert_eq!(
            sql,
            format!(r#"select * from "users" limit 15 offset {}"#, i64::MAX)
        );

        let (sql, _) = users().for_page(0, 10).to_sql();
        assert_eq!(sql, r#"select * from "users" limit 10 offset 0"#);
    }

    #[test]
    fn test_paginator_huge_page_does_not_overflow() {
        let page = Paginator::new(vec![1], 1, u64::MAX, 15);
        assert_eq!(page.from, Some(u64::MAX));
        assert_eq!(page.to, Some(u64::MAX));
        assert!(!page.has_more_pages());
    }

    #[test]
    fn test_paginator_meta() {
        let page = Paginator::new(vec![1, 2], 12, 3, 5);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.from, Some(11));
        assert_eq!(page.to, Some(12));
        assert!(!page.has_more_pages());

        let empty: Paginator<i32> = Paginator::new(Vec::new(), 0, 1, 15);
        assert_eq!(empty.last_page, 1);
        assert_eq!(empty.from, None);
        assert_eq!(empty.map(|x| x * 2).total, 0);
    }

    async fn seeded() -> DatabasePool {
        let pool = DatabasePool::connect_sqlite("sqlite::memory:", Some(1))
            .await
            .unwrap();
        pool.execute(
            "create table users (id integer primary key, name text, age integer, votes integer default 0)",
            &[],
        )
        .await
        .unwrap();
        for (name, age) in [("Ada", 36), ("Linus", 28), ("Grace", 45), ("Alan", 41)] {
            pool.table("users")
                .insert([("name", DbValue::from(name)), ("age", DbValue::from(age))])
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_get_first_find() {
        let pool = seeded().await;

        let adults = pool
            .table("users")
            .where_op("age", Op::Gt, 40)
            .order_by("name")
            .get()
            .await
            .unwrap();
        assert_eq!(adults.len(), 2);
        assert_eq!(adults[0]["name"], DbValue::from("Alan"));

        let first = pool.table("users").order_by("id").first().await.unwrap().unwrap();
        assert_eq!(first["name"], DbValue::from("Ada"));

        let found = pool.table("users").find(2).await.unwrap().unwrap();
        assert_eq!(found["name"], DbValue::from("Linus"));
        assert!(pool.table("users").find(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_value_pluck_aggregates() {
        let pool = seeded().await;
        let users = pool.table("users");

        assert_eq!(
            users.clone().where_eq("id", 3).value("name").await.unwrap(),
            Some(DbValue::from("Grace"))
        );
        assert_eq!(users.clone().order_by("id").pluck("age").await.unwrap().len(), 4);
        assert_eq!(users.count().await.unwrap(), 4);
        assert_eq!(users.max("age").await.unwrap(), DbValue::Int(45));
        assert_eq!(users.min("age").await.unwrap(), DbValue::Int(28));
        assert_eq!(users.sum("age").await.unwrap(), DbValue::Int(150));
        assert_eq!(users.avg("age").await.unwrap(), Some(37.5));
        assert!(users.clone().where_eq("name", "Ada").exists().await.unwrap());
        assert!(!users.clone().where_eq("name", "Bob").exists().await.unwrap());
        assert_eq!(
            users.clone().where_eq("name", "Bob").avg("age").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_insert_get_id_update_increment_delete() {
        let pool = seeded().await;
        let id = pool
            .table("users")
            .insert_get_id([("name", "Barbara")])
            .await
            .unwrap();
        assert_eq!(id, 5);

        let updated = pool
            .table("users")
            .where_eq("id", id)
            .update([("age", 29)])
            .await
            .unwrap();
        assert_eq!(updated, 1);

        pool.table("users")
            .where_in("id", [1, 2])
            .increment("votes", 3)
            .await
            .unwrap();
        assert_eq!(pool.table("users").sum("votes").await.unwrap(), DbValue::Int(6));

        let deleted = pool
            .table("users")
            .where_op("age", Op::Lt, 30)
            .delete()
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(pool.table("users").count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_paginate() {
        let pool = seeded().await;
        let page = pool
            .table("users")
            .order_by("id")
            .paginate(2, 3)
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.last_page, 2);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0]["name"], DbValue::from("Alan"));
    }

    #[tokio::test]
    async fn test_builder_without_connection() {
        let err = Builder::table("users").get().await.unwrap_err();
        assert!(matches!(err, Error::Database { .. }));
    }
}
