//! High-level typed operations.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rmpv::Value;

use tntdb_protocol::consts::{body, IteratorType, RequestType};
use tntdb_protocol::ProtocolError;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::schema::{IndexRef, Schema, SpaceMeta, SpaceRef};

/// Tuples and keys are plain sequences of msgpack values.
pub type Tuple = Vec<Value>;

/// Default SELECT limit (2^30).
pub const DEFAULT_LIMIT: u32 = 1 << 30;

/// SELECT knobs.
#[derive(Debug, Clone, Copy)]
pub struct SelectOptions {
    pub iterator: IteratorType,
    pub limit: u32,
    pub offset: u32,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            iterator: IteratorType::Equal,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl SelectOptions {
    pub fn with_iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }

    /// Sets the iterator from a string alias like `">="` or `"all"`.
    pub fn with_iterator_alias(self, alias: &str) -> Result<Self, Error> {
        Ok(self.with_iterator(alias.parse::<IteratorType>()?))
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// A single update instruction, `[op, field, ...]` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp(Value);

impl UpdateOp {
    fn entry(op: &str, field: i64, args: Vec<Value>) -> Self {
        let mut entry = vec![Value::from(op), Value::from(field)];
        entry.extend(args);
        UpdateOp(Value::Array(entry))
    }

    /// `["=", field, value]`
    pub fn assign(field: i64, value: impl Into<Value>) -> Self {
        Self::entry("=", field, vec![value.into()])
    }

    /// `["+", field, amount]`
    pub fn add(field: i64, amount: i64) -> Self {
        Self::entry("+", field, vec![Value::from(amount)])
    }

    /// `["-", field, amount]`
    pub fn subtract(field: i64, amount: i64) -> Self {
        Self::entry("-", field, vec![Value::from(amount)])
    }

    /// `["&", field, mask]`
    pub fn bit_and(field: i64, mask: u64) -> Self {
        Self::entry("&", field, vec![Value::from(mask)])
    }

    /// `["|", field, mask]`
    pub fn bit_or(field: i64, mask: u64) -> Self {
        Self::entry("|", field, vec![Value::from(mask)])
    }

    /// `["^", field, mask]`
    pub fn bit_xor(field: i64, mask: u64) -> Self {
        Self::entry("^", field, vec![Value::from(mask)])
    }

    /// `[":", field, start, len, replacement]` string splice.
    pub fn splice(field: i64, start: i64, len: i64, replacement: &str) -> Self {
        Self::entry(
            ":",
            field,
            vec![
                Value::from(start),
                Value::from(len),
                Value::from(replacement),
            ],
        )
    }

    /// `["#", field, count]` field deletion.
    pub fn remove(field: i64, count: i64) -> Self {
        Self::entry("#", field, vec![Value::from(count)])
    }

    /// `["!", field, value]` field insertion.
    pub fn insert(field: i64, value: impl Into<Value>) -> Self {
        Self::entry("!", field, vec![value.into()])
    }

    /// An operation passed through as-is.
    pub fn raw(value: Value) -> Self {
        UpdateOp(value)
    }

    fn into_value(self) -> Value {
        self.0
    }
}

/// High-level client: typed operations over a shared [`Connection`].
#[derive(Clone)]
pub struct Client {
    conn: Connection,
}

impl Client {
    /// Connects and wraps the connection.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, Error> {
        Ok(Self {
            conn: Connection::connect(config).await?,
        })
    }

    /// Wraps an already established connection.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn close(&self) {
        self.conn.close().await
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Health probe; returns the elapsed time between enqueue and response.
    pub async fn ping(&self) -> Result<Duration, Error> {
        let started = Instant::now();
        self.conn.send(RequestType::Ping, None).await?;
        Ok(started.elapsed())
    }

    pub async fn select(
        &self,
        space: impl Into<SpaceRef<'_>>,
        index: impl Into<IndexRef<'_>>,
        key: Tuple,
        options: SelectOptions,
    ) -> Result<Vec<Value>, Error> {
        let (space_id, index_id) = self.resolve(space.into(), index.into())?;
        let request_body = [
            (body::SPACE_ID, Value::from(space_id)),
            (body::INDEX_ID, Value::from(index_id)),
            (body::LIMIT, Value::from(options.limit)),
            (body::OFFSET, Value::from(options.offset)),
            (body::ITERATOR, Value::from(options.iterator as u8)),
            (body::KEY, Value::Array(key)),
        ];
        self.request(RequestType::Select, &request_body).await
    }

    /// Point lookup by primary index; returns the matching tuple, if any.
    pub async fn get(
        &self,
        space: impl Into<SpaceRef<'_>>,
        key: Tuple,
    ) -> Result<Option<Value>, Error> {
        let options = SelectOptions::default().with_limit(1);
        let space: SpaceRef<'_> = space.into();
        let mut rows = self.select(space, 0u32, key, options).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    pub async fn insert(
        &self,
        space: impl Into<SpaceRef<'_>>,
        tuple: Tuple,
    ) -> Result<Vec<Value>, Error> {
        let space_id = self.resolve_space(space.into())?;
        let request_body = [
            (body::SPACE_ID, Value::from(space_id)),
            (body::TUPLE, Value::Array(tuple)),
        ];
        self.request(RequestType::Insert, &request_body).await
    }

    pub async fn replace(
        &self,
        space: impl Into<SpaceRef<'_>>,
        tuple: Tuple,
    ) -> Result<Vec<Value>, Error> {
        let space_id = self.resolve_space(space.into())?;
        let request_body = [
            (body::SPACE_ID, Value::from(space_id)),
            (body::TUPLE, Value::Array(tuple)),
        ];
        self.request(RequestType::Replace, &request_body).await
    }

    pub async fn update(
        &self,
        space: impl Into<SpaceRef<'_>>,
        index: impl Into<IndexRef<'_>>,
        key: Tuple,
        ops: Vec<UpdateOp>,
    ) -> Result<Vec<Value>, Error> {
        let (space_id, index_id) = self.resolve(space.into(), index.into())?;
        let ops: Vec<Value> = ops.into_iter().map(UpdateOp::into_value).collect();
        // UPDATE carries its operations under the tuple key.
        let request_body = [
            (body::SPACE_ID, Value::from(space_id)),
            (body::INDEX_ID, Value::from(index_id)),
            (body::KEY, Value::Array(key)),
            (body::TUPLE, Value::Array(ops)),
        ];
        self.request(RequestType::Update, &request_body).await
    }

    pub async fn delete(
        &self,
        space: impl Into<SpaceRef<'_>>,
        index: impl Into<IndexRef<'_>>,
        key: Tuple,
    ) -> Result<Vec<Value>, Error> {
        let (space_id, index_id) = self.resolve(space.into(), index.into())?;
        let request_body = [
            (body::SPACE_ID, Value::from(space_id)),
            (body::INDEX_ID, Value::from(index_id)),
            (body::KEY, Value::Array(key)),
        ];
        self.request(RequestType::Delete, &request_body).await
    }

    /// Update-or-insert against the primary index.
    pub async fn upsert(
        &self,
        space: impl Into<SpaceRef<'_>>,
        tuple: Tuple,
        ops: Vec<UpdateOp>,
    ) -> Result<Vec<Value>, Error> {
        let space_id = self.resolve_space(space.into())?;
        let ops: Vec<Value> = ops.into_iter().map(UpdateOp::into_value).collect();
        let request_body = [
            (body::SPACE_ID, Value::from(space_id)),
            (body::TUPLE, Value::Array(tuple)),
            (body::OPS, Value::Array(ops)),
        ];
        self.request(RequestType::Upsert, &request_body).await
    }

    pub async fn call(&self, function: &str, args: Tuple) -> Result<Vec<Value>, Error> {
        let request_body = [
            (body::FUNCTION_NAME, Value::from(function)),
            (body::TUPLE, Value::Array(args)),
        ];
        self.request(RequestType::Call, &request_body).await
    }

    pub async fn eval(&self, expression: &str, args: Tuple) -> Result<Vec<Value>, Error> {
        let request_body = [
            (body::EXPRESSION, Value::from(expression)),
            (body::TUPLE, Value::Array(args)),
        ];
        self.request(RequestType::Eval, &request_body).await
    }

    async fn request(
        &self,
        request: RequestType,
        request_body: &[(u8, Value)],
    ) -> Result<Vec<Value>, Error> {
        let response = self.conn.send(request, Some(request_body)).await?;
        Ok(response.into_data())
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    /// Returns a snapshot of the cached schema.
    pub fn schema(&self) -> Schema {
        self.conn.schema()
    }

    /// Refreshes the schema cache from the server: lists the spaces, then
    /// fetches each space's indexes and id. Replaces any prior snapshot.
    ///
    /// Requires execute access to the universe; a denial surfaces as the
    /// server's error.
    pub async fn parse_schema(&self) -> Result<(), Error> {
        let mut schema = Schema::default();
        for name in self.fetch_space_names().await? {
            let indexes = self.fetch_indexes(&name).await?;
            let id = self.fetch_space_id(&name).await?;
            schema.insert(name, SpaceMeta { id, indexes });
        }
        tracing::debug!("schema cache refreshed: {} spaces", schema.len());
        self.conn.set_schema(schema);
        Ok(())
    }

    async fn fetch_space_names(&self) -> Result<Vec<String>, Error> {
        let data = self.eval("return box.space", Vec::new()).await?;
        let entries = match data.into_iter().next() {
            Some(Value::Map(entries)) => entries,
            _ => {
                return Err(Error::Protocol(ProtocolError::MalformedResponse(
                    "box.space did not return a map",
                )))
            }
        };
        // Spaces are listed under both name and numeric id; only the
        // string keys name them.
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| match key {
                Value::String(name) => name.into_str(),
                _ => None,
            })
            .collect())
    }

    async fn fetch_indexes(&self, space: &str) -> Result<HashMap<String, u32>, Error> {
        let expression = format!("return box.space.{space}.index");
        let data = self.eval(&expression, Vec::new()).await?;
        let entries = match data.into_iter().next() {
            Some(Value::Map(entries)) => entries,
            _ => {
                return Err(Error::Protocol(ProtocolError::MalformedResponse(
                    "space indexes did not return a map",
                )))
            }
        };

        let mut indexes = HashMap::new();
        for (key, value) in entries {
            let Value::String(name) = key else { continue };
            let Some(name) = name.into_str() else { continue };
            let Some(id) = index_object_id(&value) else { continue };
            indexes.insert(name, id);
        }
        Ok(indexes)
    }

    async fn fetch_space_id(&self, space: &str) -> Result<u32, Error> {
        let expression = format!("return box.space.{space}.id");
        let data = self.eval(&expression, Vec::new()).await?;
        data.first()
            .and_then(Value::as_u64)
            .map(|id| id as u32)
            .ok_or(Error::Protocol(ProtocolError::MalformedResponse(
                "space id is not an integer",
            )))
    }

    // ------------------------------------------------------------------
    // Name resolution
    // ------------------------------------------------------------------

    fn resolve_space(&self, space: SpaceRef<'_>) -> Result<u32, Error> {
        match space {
            SpaceRef::Id(id) => Ok(id),
            SpaceRef::Name(name) => self
                .conn
                .read_schema(|schema| schema.space_id(name))
                .ok_or_else(|| Error::NotResolved(format!("space {name:?}"))),
        }
    }

    fn resolve(&self, space: SpaceRef<'_>, index: IndexRef<'_>) -> Result<(u32, u32), Error> {
        let space_id = self.resolve_space(space)?;
        let index_id = match index {
            IndexRef::Id(id) => id,
            IndexRef::Name(name) => self
                .conn
                .read_schema(|schema| match space {
                    SpaceRef::Name(space_name) => schema.index_id(space_name, name),
                    SpaceRef::Id(id) => schema.index_id_in(id, name),
                })
                .ok_or_else(|| Error::NotResolved(format!("index {name:?}")))?,
        };
        Ok((space_id, index_id))
    }
}

/// Extracts the `id` field of a server-side index object.
fn index_object_id(value: &Value) -> Option<u32> {
    value.as_map()?.iter().find_map(|(key, value)| {
        if key.as_str() == Some("id") {
            value.as_u64().map(|id| id as u32)
        } else {
            None
        }
    })
}
