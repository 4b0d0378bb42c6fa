//! # Models
//!
//! Active-record style models over the query builder.
//!
//! A model is a marker type that describes its table and relations:
//!
//! ```ignore
//! pub struct User;
//!
//! impl Model for User {
//!     fn meta() -> &'static ModelMeta {
//!         static META: ModelMeta = ModelMeta::new("User", "users")
//!             .fillable(&["name", "email", "password"])
//!             .hidden(&["password"]);
//!         &META
//!     }
//!
//!     fn relation(name: &str) -> Option<Relation> {
//!         match name {
//!             "posts" => Some(Relation::has_many::<Post>("user_id")),
//!             _ => None,
//!         }
//!     }
//! }
//!
//! let users = User::query(&pool).with(["posts.comments"]).get().await?;
//! ```
//!
//! Rows come back as [`Record`]s. Eager loading runs one `where in` query
//! per relation, however many parents were loaded.

use crate::database::{DatabasePool, DbValue, Row};
use crate::error::{Error, Result};
use crate::handler::BoxFuture;
use crate::query::{Builder, Op, Paginator};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;

/// Format of `created_at` / `updated_at` values
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

type RelationFn = fn(&str) -> Option<Relation>;

/// Static description of a model's table
#[derive(Debug, Clone, Copy)]
pub struct ModelMeta {
    /// Model name used in errors and logs
    pub name: &'static str,
    /// Table name
    pub table: &'static str,
    /// Primary key column
    pub primary_key: &'static str,
    /// Attributes accepted by mass assignment
    pub fillable: &'static [&'static str],
    /// Attributes left out of JSON output
    pub hidden: &'static [&'static str],
    /// Whether `created_at` / `updated_at` are maintained
    pub timestamps: bool,
}

impl ModelMeta {
    /// Metadata with an `id` key, timestamps on and nothing fillable
    #[must_use]
    pub const fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            primary_key: "id",
            fillable: &[],
            hidden: &[],
            timestamps: true,
        }
    }

    /// Set the primary key column
    #[must_use]
    pub const fn primary_key(mut self, key: &'static str) -> Self {
        self.primary_key = key;
        self
    }

    /// Set the mass-assignable attributes
    #[must_use]
    pub const fn fillable(mut self, fillable: &'static [&'static str]) -> Self {
        self.fillable = fillable;
        self
    }

    /// Set the attributes hidden from JSON
    #[must_use]
    pub const fn hidden(mut self, hidden: &'static [&'static str]) -> Self {
        self.hidden = hidden;
        self
    }

    /// Turn timestamp maintenance off
    #[must_use]
    pub const fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    /// Whether `attribute` may be mass assigned
    #[must_use]
    pub fn is_fillable(&self, attribute: &str) -> bool {
        self.fillable.contains(&attribute)
    }
}

/// A model type
pub trait Model: Send + Sync + 'static {
    /// Table metadata
    fn meta() -> &'static ModelMeta;

    /// Relation definition by name
    fn relation(_name: &str) -> Option<Relation> {
        None
    }

    /// Start a query for this model
    fn query(pool: &DatabasePool) -> ModelQuery<Self>
    where
        Self: Sized,
    {
        ModelQuery::new(pool)
    }
}

/// Kind of relation between two models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Parent key referenced by many related rows
    HasMany,
    /// Parent key referenced by one related row
    HasOne,
    /// Foreign key on this model referencing the related key
    BelongsTo,
}

/// Relation definition
#[derive(Clone, Copy)]
pub struct Relation {
    /// Relation kind
    pub kind: RelationKind,
    /// Metadata of the related model
    pub related: &'static ModelMeta,
    /// For `HasMany`/`HasOne` the column on the related table, for
    /// `BelongsTo` the column on this table
    pub foreign_key: &'static str,
    /// For `HasMany`/`HasOne` the key on this table, for `BelongsTo` the
    /// key on the related table
    pub local_key: &'static str,
    related_relations: RelationFn,
}

impl std::fmt::Debug for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation")
            .field("kind", &self.kind)
            .field("related", &self.related.name)
            .field("foreign_key", &self.foreign_key)
            .field("local_key", &self.local_key)
            .finish()
    }
}

impl Relation {
    fn of<M: Model>(kind: RelationKind, foreign_key: &'static str, local_key: &'static str) -> Self {
        Self {
            kind,
            related: M::meta(),
            foreign_key,
            local_key,
            related_relations: M::relation,
        }
    }

    /// `M` rows whose `foreign_key` holds this model's `id`
    #[must_use]
    pub fn has_many<M: Model>(foreign_key: &'static str) -> Self {
        Self::of::<M>(RelationKind::HasMany, foreign_key, "id")
    }

    /// The `M` row whose `foreign_key` holds this model's `id`
    #[must_use]
    pub fn has_one<M: Model>(foreign_key: &'static str) -> Self {
        Self::of::<M>(RelationKind::HasOne, foreign_key, "id")
    }

    /// The `M` row whose primary key is held in this model's `foreign_key`
    #[must_use]
    pub fn belongs_to<M: Model>(foreign_key: &'static str) -> Self {
        Self::of::<M>(RelationKind::BelongsTo, foreign_key, M::meta().primary_key)
    }

    /// Override the local key
    #[must_use]
    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = key;
        self
    }

    /// Columns matched during eager loading: (on parent, on related)
    const fn key_pair(&self) -> (&'static str, &'static str) {
        match self.kind {
            RelationKind::HasMany | RelationKind::HasOne => (self.local_key, self.foreign_key),
            RelationKind::BelongsTo => (self.foreign_key, self.local_key),
        }
    }
}

/// Relation results attached to a record
#[derive(Debug, Clone)]
pub enum Loaded {
    /// `HasMany` results
    Many(Vec<Record>),
    /// `HasOne` / `BelongsTo` result
    One(Option<Record>),
}

impl Loaded {
    fn to_json(&self) -> Value {
        match self {
            Self::Many(records) => Value::Array(records.iter().map(Record::to_json).collect()),
            Self::One(record) => record.as_ref().map_or(Value::Null, Record::to_json),
        }
    }
}

/// One model row
#[derive(Clone)]
pub struct Record {
    meta: &'static ModelMeta,
    relation_fn: RelationFn,
    attributes: Row,
    original: Row,
    exists: bool,
    relations: BTreeMap<String, Loaded>,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.meta.name)
            .field("attributes", &self.attributes)
            .field("exists", &self.exists)
            .field("relations", &self.relations)
            .finish_non_exhaustive()
    }
}

impl Record {
    /// New, unsaved record of model `M`
    #[must_use]
    pub fn new<M: Model>() -> Self {
        Self::blank(M::meta(), M::relation)
    }

    fn blank(meta: &'static ModelMeta, relation_fn: RelationFn) -> Self {
        Self {
            meta,
            relation_fn,
            attributes: Row::new(),
            original: Row::new(),
            exists: false,
            relations: BTreeMap::new(),
        }
    }

    fn from_row(meta: &'static ModelMeta, relation_fn: RelationFn, row: Row) -> Self {
        Self {
            original: row.clone(),
            attributes: row,
            exists: true,
            ..Self::blank(meta, relation_fn)
        }
    }

    /// Model metadata
    #[must_use]
    pub const fn meta(&self) -> &'static ModelMeta {
        self.meta
    }

    /// Whether the record is stored in the database
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.exists
    }

    /// All attributes
    #[must_use]
    pub const fn attributes(&self) -> &Row {
        &self.attributes
    }

    /// One attribute
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&DbValue> {
        self.attributes.get(attribute)
    }

    /// Integer attribute
    #[must_use]
    pub fn get_i64(&self, attribute: &str) -> Option<i64> {
        self.get(attribute).and_then(DbValue::as_i64)
    }

    /// String attribute
    #[must_use]
    pub fn get_str(&self, attribute: &str) -> Option<&str> {
        self.get(attribute).and_then(DbValue::as_str)
    }

    /// Primary key value
    #[must_use]
    pub fn key(&self) -> Option<&DbValue> {
        self.get(self.meta.primary_key).filter(|v| !v.is_null())
    }

    /// Key of the stored row, which differs from [`Record::key`] while a
    /// changed primary key is unsaved
    fn stored_key(&self) -> Option<&DbValue> {
        self.original
            .get(self.meta.primary_key)
            .filter(|v| !v.is_null())
            .or_else(|| self.key())
    }

    /// Set one attribute, bypassing mass-assignment rules
    pub fn set(&mut self, attribute: &str, value: impl Into<DbValue>) -> &mut Self {
        self.attributes.insert(attribute.to_string(), value.into());
        self
    }

    /// Mass-assign input; attributes outside `fillable` are skipped
    pub fn fill(&mut self, input: &Map<String, Value>) -> &mut Self {
        for (attribute, value) in input {
            if self.meta.is_fillable(attribute) {
                self.attributes
                    .insert(attribute.clone(), DbValue::from_json(value));
            } else {
                tracing::debug!(model = self.meta.name, attribute, "Skipping guarded attribute");
            }
        }
        self
    }

    /// Attributes changed since the record was loaded or saved
    #[must_use]
    pub fn dirty(&self) -> Row {
        self.attributes
            .iter()
            .filter(|(k, v)| self.original.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether any attribute changed
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty().is_empty()
    }

    /// Loaded relation by name
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Loaded> {
        self.relations.get(name)
    }

    /// Records of a loaded to-many relation (empty when not loaded)
    #[must_use]
    pub fn related(&self, name: &str) -> &[Record] {
        match self.relations.get(name) {
            Some(Loaded::Many(records)) => records,
            _ => &[],
        }
    }

    /// Record of a loaded to-one relation
    #[must_use]
    pub fn related_one(&self, name: &str) -> Option<&Record> {
        match self.relations.get(name) {
            Some(Loaded::One(record)) => record.as_ref(),
            _ => None,
        }
    }

    fn missing_key(&self) -> Error {
        Error::database(format!("{} has no primary key value", self.meta.name))
    }

    /// Insert or update the record
    ///
    /// New records are inserted with both timestamps and receive their
    /// generated key; stored records update only their dirty columns.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the statement fails and
    /// `Error::ModelNotFound` if the stored row is gone; the record then
    /// stays dirty.
    pub async fn save(&mut self, pool: &DatabasePool) -> Result<()> {
        let meta = self.meta;
        let now = Utc::now().format(TIMESTAMP_FORMAT).to_string();

        if self.exists {
            let mut dirty = self.dirty();
            if dirty.is_empty() {
                return Ok(());
            }
            if meta.timestamps {
                self.set("updated_at", now.clone());
                dirty.insert("updated_at".to_string(), DbValue::String(now));
            }
            let key = self.stored_key().cloned().ok_or_else(|| self.missing_key())?;
            let updated = pool
                .table(meta.table)
                .where_eq(meta.primary_key, key.clone())
                .update(dirty)
                .await?;
            if updated == 0 {
                return Err(Error::ModelNotFound {
                    model: meta.name,
                    key: key.key().unwrap_or_default(),
                });
            }
        } else {
            if meta.timestamps {
                for column in ["created_at", "updated_at"] {
                    self.attributes
                        .entry(column.to_string())
                        .or_insert_with(|| DbValue::String(now.clone()));
                }
            }
            let values: Vec<(String, DbValue)> = self
                .attributes
                .iter()
                .filter(|(k, v)| !(k.as_str() == meta.primary_key && v.is_null()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let table = pool.table(meta.table);
            if self.key().is_some() {
                table.insert(values).await?;
            } else {
                let id = table.insert_get_key(&values, meta.primary_key).await?;
                self.set(meta.primary_key, id);
            }
            self.exists = true;
        }

        self.original = self.attributes.clone();
        tracing::debug!(model = meta.name, key = ?self.key(), "Model saved");
        Ok(())
    }

    /// Delete the stored row
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the record has no key or the delete fails.
    pub async fn delete(&mut self, pool: &DatabasePool) -> Result<bool> {
        if !self.exists {
            return Ok(false);
        }
        let key = self.stored_key().cloned().ok_or_else(|| self.missing_key())?;
        let deleted = pool
            .table(self.meta.table)
            .where_eq(self.meta.primary_key, key)
            .delete()
            .await?;
        self.exists = false;
        Ok(deleted > 0)
    }

    /// Reload attributes from the database, then reload any loaded relations
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelNotFound` if the row no longer exists.
    pub async fn refresh(&mut self, pool: &DatabasePool) -> Result<()> {
        let key = self.key().cloned().ok_or_else(|| self.missing_key())?;
        let row = pool
            .table(self.meta.table)
            .where_eq(self.meta.primary_key, key.clone())
            .first()
            .await?
            .ok_or_else(|| Error::ModelNotFound {
                model: self.meta.name,
                key: key.key().unwrap_or_default(),
            })?;

        let loaded: Vec<String> = std::mem::take(&mut self.relations).into_keys().collect();
        self.original = row.clone();
        self.attributes = row;
        self.exists = true;
        self.load(pool, &loaded).await
    }

    /// Eager load relations onto an already fetched record
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownRelation` for an undefined relation name.
    pub async fn load<S: AsRef<str>>(&mut self, pool: &DatabasePool, names: &[S]) -> Result<()> {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        let (model, relation_fn) = (self.meta.name, self.relation_fn);
        eager_load(pool, std::slice::from_mut(self), model, relation_fn, &names).await
    }

    /// JSON view: hidden attributes removed, loaded relations nested
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut object: Map<String, Value> = self
            .attributes
            .iter()
            .filter(|(k, _)| !self.meta.hidden.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        for (name, loaded) in &self.relations {
            object.insert(name.clone(), loaded.to_json());
        }
        Value::Object(object)
    }

    /// Deserialize the visible attributes into a typed struct
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the attributes do not fit `T`.
    pub fn cast<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Split `["posts.comments", "profile"]` into top-level names and their
/// nested remainders, keeping first-seen order
fn parse_relations(names: &[String]) -> Vec<(String, Vec<String>)> {
    let mut tree: Vec<(String, Vec<String>)> = Vec::new();
    for name in names {
        let (head, rest) = match name.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (name.as_str(), None),
        };
        let position = tree.iter().position(|(h, _)| h == head).unwrap_or_else(|| {
            tree.push((head.to_string(), Vec::new()));
            tree.len() - 1
        });
        if let Some(rest) = rest {
            tree[position].1.push(rest.to_string());
        }
    }
    tree
}

fn eager_load<'a>(
    pool: &'a DatabasePool,
    records: &'a mut [Record],
    model: &'static str,
    relation_fn: RelationFn,
    names: &'a [String],
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for (name, nested) in parse_relations(names) {
            let relation = relation_fn(&name).ok_or_else(|| Error::UnknownRelation {
                model,
                relation: name.clone(),
            })?;
            load_relation(pool, records, &name, relation, &nested).await?;
        }
        Ok(())
    })
}

async fn load_relation(
    pool: &DatabasePool,
    records: &mut [Record],
    name: &str,
    relation: Relation,
    nested: &[String],
) -> Result<()> {
    let (parent_column, related_column) = relation.key_pair();

    let mut seen = HashSet::new();
    let keys: Vec<DbValue> = records
        .iter()
        .filter_map(|r| r.get(parent_column))
        .filter(|v| v.key().is_some_and(|k| seen.insert(k)))
        .cloned()
        .collect();

    let mut related: Vec<Record> = if keys.is_empty() {
        Vec::new()
    } else {
        let meta = relation.related;
        pool.table(meta.table)
            .where_in(related_column, keys)
            .order_by(meta.primary_key)
            .get()
            .await?
            .into_iter()
            .map(|row| Record::from_row(meta, relation.related_relations, row))
            .collect()
    };

    eager_load(
        pool,
        &mut related,
        relation.related.name,
        relation.related_relations,
        nested,
    )
    .await?;

    let mut buckets: HashMap<String, Vec<Record>> = HashMap::new();
    for record in related {
        if let Some(key) = record.get(related_column).and_then(DbValue::key) {
            buckets.entry(key).or_default().push(record);
        }
    }

    for record in records.iter_mut() {
        let bucket = record
            .get(parent_column)
            .and_then(DbValue::key)
            .and_then(|key| buckets.get(&key));
        let loaded = match relation.kind {
            RelationKind::HasMany => Loaded::Many(bucket.cloned().unwrap_or_default()),
            RelationKind::HasOne | RelationKind::BelongsTo => {
                Loaded::One(bucket.and_then(|b| b.first().cloned()))
            }
        };
        record.relations.insert(name.to_string(), loaded);
    }
    Ok(())
}

/// Query over one model's table
pub struct ModelQuery<M> {
    pool: DatabasePool,
    builder: Builder,
    eager: Vec<String>,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for ModelQuery<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            builder: self.builder.clone(),
            eager: self.eager.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> std::fmt::Debug for ModelQuery<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelQuery")
            .field("model", &M::meta().name)
            .field("builder", &self.builder)
            .field("eager", &self.eager)
            .finish()
    }
}

/// Forward fluent builder methods
macro_rules! forward {
    ($( $(#[$doc:meta])* fn $name:ident($($arg:ident: $ty:ty),*); )*) => {
        $(
            $(#[$doc])*
            #[must_use]
            pub fn $name(mut self, $($arg: $ty),*) -> Self {
                self.builder = self.builder.$name($($arg),*);
                self
            }
        )*
    };
}

impl<M: Model> ModelQuery<M> {
    /// Query over `M`'s table
    #[must_use]
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            builder: pool.table(M::meta().table),
            pool: pool.clone(),
            eager: Vec::new(),
            _model: PhantomData,
        }
    }

    forward! {
        /// `column = value`
        fn where_eq(column: &str, value: impl Into<DbValue>);
        /// `column <op> value`
        fn where_op(column: &str, op: Op, value: impl Into<DbValue>);
        /// `or column <op> value`
        fn or_where(column: &str, op: Op, value: impl Into<DbValue>);
        /// `column in (...)`
        fn where_in(column: &str, values: impl IntoIterator<Item = impl Into<DbValue>>);
        /// `column not in (...)`
        fn where_not_in(column: &str, values: impl IntoIterator<Item = impl Into<DbValue>>);
        /// `column is null`
        fn where_null(column: &str);
        /// `column is not null`
        fn where_not_null(column: &str);
        /// `column between low and high`
        fn where_between(column: &str, low: impl Into<DbValue>, high: impl Into<DbValue>);
        /// Raw where fragment
        fn where_raw(sql: &str, bindings: Vec<DbValue>);
        /// Parenthesised `and` group
        fn where_group(build: impl FnOnce(Builder) -> Builder);
        /// Parenthesised `or` group
        fn or_where_group(build: impl FnOnce(Builder) -> Builder);
        /// Ascending order
        fn order_by(column: &str);
        /// Descending order
        fn order_by_desc(column: &str);
        /// Newest first
        fn latest();
        /// Oldest first
        fn oldest();
        /// Maximum number of records
        fn limit(limit: u64);
        /// Alias of `limit`
        fn take(limit: u64);
        /// Records to skip
        fn offset(offset: u64);
        /// Alias of `offset`
        fn skip(offset: u64);
    }

    /// Apply arbitrary builder calls (a local scope)
    ///
    /// ```ignore
    /// fn published(q: Builder) -> Builder { q.where_not_null("published_at") }
    /// let posts = Post::query(&pool).scope(published).get().await?;
    /// ```
    #[must_use]
    pub fn scope(mut self, scope: impl FnOnce(Builder) -> Builder) -> Self {
        self.builder = scope(self.builder);
        self
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

    /// Relations to eager load; nested relations use dot notation
    #[must_use]
    pub fn with<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eager.extend(relations.into_iter().map(Into::into));
        self
    }

    /// The underlying builder
    #[must_use]
    pub fn into_builder(self) -> Builder {
        self.builder
    }

    fn hydrate(&self, rows: Vec<Row>) -> Vec<Record> {
        rows.into_iter()
            .map(|row| Record::from_row(M::meta(), M::relation, row))
            .collect()
    }

    async fn load_eager(&self, records: &mut [Record]) -> Result<()> {
        eager_load(&self.pool, records, M::meta().name, M::relation, &self.eager).await
    }

    /// Fetch matching records with their eager loads
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if a query fails, `Error::UnknownRelation`
    /// for an undefined relation name.
    pub async fn get(&self) -> Result<Vec<Record>> {
        let rows = self.builder.get().await?;
        let mut records = self.hydrate(rows);
        self.load_eager(&mut records).await?;
        Ok(records)
    }

    /// Every record of the model, ignoring constraints added so far
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if a query fails.
    pub async fn all(self) -> Result<Vec<Record>> {
        let eager = self.eager.clone();
        Self::new(&self.pool).with(eager).get().await
    }

    /// First matching record
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if a query fails.
    pub async fn first(&self) -> Result<Option<Record>> {
        let mut records = self.clone().limit(1).get().await?;
        Ok(records.pop())
    }

    /// Record by primary key
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if a query fails.
    pub async fn find(&self, key: impl Into<DbValue>) -> Result<Option<Record>> {
        self.clone().where_eq(M::meta().primary_key, key).first().await
    }

    /// Record by primary key, or `Error::ModelNotFound` (404)
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelNotFound` when no row has the key.
    pub async fn find_or_fail(&self, key: impl Into<DbValue>) -> Result<Record> {
        let key = key.into();
        self.find(key.clone())
            .await?
            .ok_or_else(|| Error::ModelNotFound {
                model: M::meta().name,
                key: key.key().unwrap_or_default(),
            })
    }

    /// Mass-assign `input` into a new record and save it
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the insert fails.
    pub async fn create(&self, input: &Map<String, Value>) -> Result<Record> {
        let mut record = Record::new::<M>();
        record.fill(input);
        record.save(&self.pool).await?;
        Ok(record)
    }

    /// Number of matching records
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn count(&self) -> Result<i64> {
        self.builder.count().await
    }

    /// Whether any record matches
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if the query fails.
    pub async fn exists(&self) -> Result<bool> {
        self.builder.exists().await
    }

    /// One page of records with their eager loads
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` if a query fails.
    pub async fn paginate(&self, page: u64, per_page: u64) -> Result<Paginator<Record>> {
        let Paginator {
            data,
            total,
            current_page,
            per_page,
            ..
        } = self.builder.paginate(page, per_page).await?;
        let mut records = self.hydrate(data);
        self.load_eager(&mut records).await?;
        Ok(Paginator::new(records, total, current_page, per_page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct User;
    struct Post;
    struct Comment;
    struct Profile;

    impl Model for User {
        fn meta() -> &'static ModelMeta {
            static META: ModelMeta = ModelMeta::new("User", "users")
                .fillable(&["name", "email", "password"])
                .hidden(&["password"]);
            &META
        }

        fn relation(name: &str) -> Option<Relation> {
            match name {
                "posts" => Some(Relation::has_many::<Post>("user_id")),
                "profile" => Some(Relation::has_one::<Profile>("user_id")),
                _ => None,
            }
        }
    }

    impl Model for Post {
        fn meta() -> &'static ModelMeta {
            static META: ModelMeta = ModelMeta::new("Post", "posts").fillable(&["title", "user_id"]);
            &META
        }

        fn relation(name: &str) -> Option<Relation> {
            match name {
                "author" => Some(Relation::belongs_to::<User>("user_id")),
                "comments" => Some(Relation::has_many::<Comment>("post_id")),
                _ => None,
            }
        }
    }

    impl Model for Comment {
        fn meta() -> &'static ModelMeta {
            static META: ModelMeta = ModelMeta::new("Comment", "comments").without_timestamps();
            &META
        }
    }

    impl Model for Profile {
        fn meta() -> &'static ModelMeta {
            static META: ModelMeta = ModelMeta::new("Profile", "profiles").without_timestamps();
            &META
        }
    }

    fn input(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn schema() -> DatabasePool {
        let pool = DatabasePool::connect_sqlite("sqlite::memory:", Some(1))
            .await
            .unwrap();
        for ddl in [
            "create table users (id integer primary key, name text, email text, password text, created_at text, updated_at text)",
            "create table posts (id integer primary key, user_id integer, title text, created_at text, updated_at text)",
            "create table comments (id integer primary key, post_id integer, body text)",
            "create table profiles (id integer primary key, user_id integer, bio text)",
        ] {
            pool.execute(ddl, &[]).await.unwrap();
        }
        pool
    }

    async fn seeded() -> DatabasePool {
        let pool = schema().await;
        for (name, email) in [("Ada", "ada@x.io"), ("Linus", "linus@x.io"), ("Grace", "grace@x.io")] {
            User::query(&pool)
                .create(&input(json!({"name": name, "email": email, "password": "secret"})))
                .await
                .unwrap();
        }
        for (user_id, title) in [(1, "Engines"), (1, "Notes"), (2, "Kernels"), (3, "Compilers")] {
            pool.table("posts")
                .insert([("user_id", DbValue::from(user_id)), ("title", DbValue::from(title))])
                .await
                .unwrap();
        }
        for (post_id, body) in [(1, "first"), (1, "second"), (3, "nice")] {
            pool.table("comments")
                .insert([("post_id", DbValue::from(post_id)), ("body", DbValue::from(body))])
                .await
                .unwrap();
        }
        pool.table("profiles")
            .insert([("user_id", DbValue::from(2)), ("bio", DbValue::from("Finnish"))])
            .await
            .unwrap();
        pool
    }

    #[test]
    fn test_parse_relations() {
        let names = vec![
            "posts".to_string(),
            "posts.comments".to_string(),
            "profile".to_string(),
        ];
        let tree = parse_relations(&names);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0], ("posts".to_string(), vec!["comments".to_string()]));
        assert!(tree[1].1.is_empty());
    }

    #[test]
    fn test_fill_respects_fillable() {
        let mut user = Record::new::<User>();
        user.fill(&input(json!({"name": "Ada", "is_admin": true})));
        assert_eq!(user.get_str("name"), Some("Ada"));
        assert!(user.get("is_admin").is_none());
        assert!(user.is_dirty());
        assert!(!user.exists());
    }

    #[tokio::test]
    async fn test_create_sets_key_and_timestamps() {
        let pool = schema().await;
        let user = User::query(&pool)
            .create(&input(json!({"name": "Ada", "email": "ada@x.io", "password": "pw"})))
            .await
            .unwrap();

        assert!(user.exists());
        assert_eq!(user.get_i64("id"), Some(1));
        assert!(user.get_str("created_at").is_some());
        assert!(!user.is_dirty());
    }

    #[tokio::test]
    async fn test_save_updates_dirty_columns_only() {
        let pool = seeded().await;
        let mut user = User::query(&pool).find_or_fail(1).await.unwrap();
        assert!(!user.is_dirty());

        user.set("name", "Augusta Ada");
        assert_eq!(user.dirty().len(), 1);

        pool.enable_query_log();
        user.save(&pool).await.unwrap();
        let log = pool.query_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with(r#"update "users" set "name" = ?, "updated_at" = ?"#));

        user.save(&pool).await.unwrap();
        assert_eq!(pool.query_log().len(), 1);

        let reloaded = User::query(&pool).find(1).await.unwrap().unwrap();
        assert_eq!(reloaded.get_str("name"), Some("Augusta Ada"));
    }

    #[tokio::test]
    async fn test_save_with_changed_key_targets_stored_row() {
        let pool = seeded().await;
        let mut user = User::query(&pool).find_or_fail(1).await.unwrap();
        user.set("id", 10).set("name", "Countess");
        user.save(&pool).await.unwrap();
        assert!(!user.is_dirty());

        assert!(User::query(&pool).find(1).await.unwrap().is_none());
        let moved = User::query(&pool).find_or_fail(10).await.unwrap();
        assert_eq!(moved.get_str("name"), Some("Countess"));
    }

    #[tokio::test]
    async fn test_save_of_vanished_row_stays_dirty() {
        let pool = seeded().await;
        let mut user = User::query(&pool).find_or_fail(2).await.unwrap();
        pool.table("users").where_eq("id", 2).delete().await.unwrap();

        user.set("name", "Ghost");
        let err = user.save(&pool).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound { model: "User", ref key } if key == "2"));
        assert!(user.is_dirty());
    }

    #[tokio::test]
    async fn test_find_or_fail_is_not_found() {
        let pool = seeded().await;
        let err = User::query(&pool).find_or_fail(42).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound { model: "User", ref key } if key == "42"));
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_delete_and_refresh() {
        let pool = seeded().await;
        let mut user = User::query(&pool).find_or_fail(3).await.unwrap();
        assert!(user.delete(&pool).await.unwrap());
        assert!(!user.exists());
        assert!(matches!(
            user.refresh(&pool).await,
            Err(Error::ModelNotFound { .. })
        ));
        assert_eq!(User::query(&pool).count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_eager_loading_runs_one_query_per_relation() {
        let pool = seeded().await;
        pool.enable_query_log();

        let users = User::query(&pool)
            .with(["posts.comments", "profile"])
            .order_by("id")
            .get()
            .await
            .unwrap();

        // users, posts, comments, profiles
        assert_eq!(pool.query_log().len(), 4);
        assert!(pool.query_log()[1].contains(r#""user_id" in (?, ?, ?)"#));

        assert_eq!(users[0].related("posts").len(), 2);
        assert_eq!(users[0].related("posts")[0].related("comments").len(), 2);
        assert_eq!(users[1].related("posts")[0].related("comments").len(), 1);
        assert!(users[2].related("posts")[0].related("comments").is_empty());
        assert!(users[0].related_one("profile").is_none());
        assert_eq!(
            users[1].related_one("profile").and_then(|p| p.get_str("bio")),
            Some("Finnish")
        );
    }

    #[tokio::test]
    async fn test_belongs_to() {
        let pool = seeded().await;
        let posts = Post::query(&pool).with(["author"]).get().await.unwrap();
        assert_eq!(posts.len(), 4);
        let author = posts[3].related_one("author").unwrap();
        assert_eq!(author.get_str("name"), Some("Grace"));
    }

    #[tokio::test]
    async fn test_unknown_relation() {
        let pool = seeded().await;
        let err = User::query(&pool).with(["friends"]).get().await.unwrap_err();
        assert!(matches!(err, Error::UnknownRelation { model: "User", .. }));

        let err = User::query(&pool)
            .with(["posts.likes"])
            .get()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRelation { model: "Post", .. }));
    }

    #[tokio::test]
    async fn test_json_hides_attributes_and_nests_relations() {
        let pool = seeded().await;
        let user = User::query(&pool)
            .with(["posts"])
            .find_or_fail(2)
            .await
            .unwrap();
        let json = user.to_json();

        assert!(json.get("password").is_none());
        assert_eq!(json["name"], "Linus");
        assert_eq!(json["posts"][0]["title"], "Kernels");
        assert_eq!(serde_json::to_value(&user).unwrap(), json);
    }

    #[tokio::test]
    async fn test_load_and_cast() {
        #[derive(serde::Deserialize)]
        struct UserView {
            id: i64,
            name: String,
        }

        let pool = seeded().await;
        let mut user = User::query(&pool).find_or_fail(1).await.unwrap();
        user.load(&pool, &["posts"]).await.unwrap();
        assert_eq!(user.related("posts").len(), 2);

        let view: UserView = user.cast().unwrap();
        assert_eq!((view.id, view.name.as_str()), (1, "Ada"));
    }

    #[tokio::test]
    async fn test_paginate_with_eager_loads() {
        let pool = seeded().await;
        let page = User::query(&pool)
            .with(["posts"])
            .order_by("id")
            .paginate(1, 2)
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0].related("posts").len(), 2);
    }

    #[tokio::test]
    async fn test_scope_and_where_in_empty() {
        fn titled(q: Builder) -> Builder {
            q.where_op("title", Op::Like, "%er%")
        }

        let pool = seeded().await;
        let posts = Post::query(&pool).scope(titled).get().await.unwrap();
        assert_eq!(posts.len(), 2);

        let none = Post::query(&pool)
            .where_in("id", Vec::<i64>::new())
            .get()
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
