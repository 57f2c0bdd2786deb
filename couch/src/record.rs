//! Typed wrapper around a stored document
//!
//! A `Record` owns the document body and remembers the database it came
//! from, so changed fields can be written back with `update`.

use serde_json::Value;
use std::fmt;

use crate::database::Database;
use crate::error::{CouchError, Result};
use crate::server::Document;

pub struct Record {
    db: Database,
    data: Document,
}

impl Record {
    pub(crate) fn new(db: Database, data: Document) -> Self {
        Self { db, data }
    }

    pub fn id(&self) -> Option<&str> {
        self.data.get("_id").and_then(Value::as_str)
    }

    pub fn rev(&self) -> Option<&str> {
        self.data.get("_rev").and_then(Value::as_str)
    }

    pub fn record_type(&self) -> Option<&str> {
        self.data.get("record_type").and_then(Value::as_str)
    }

    /// Mapping-style lookup
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Field access that treats a missing field as an error
    pub fn field(&self, name: &str) -> Result<&Value> {
        self.data
            .get(name)
            .ok_or_else(|| CouchError::NotFound(format!("field '{}'", name)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Change a field locally; nothing is written until `update` or `Database::put`
    pub fn set(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    pub fn data(&self) -> &Document {
        &self.data
    }

    pub fn into_data(self) -> Document {
        self.data
    }

    /// Merge `fields` into the record and store the whole body.
    ///
    /// `_id` and `_rev` cannot be changed this way. The write carries the
    /// revision we last saw; there is no retry when someone else updated
    /// the document in between, the store reports a `Conflict` instead.
    pub async fn update<I>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let updates: Vec<(String, Value)> = fields.into_iter().collect();
        if let Some((key, _)) = updates.iter().find(|(k, _)| k == "_id" || k == "_rev") {
            return Err(CouchError::ImmutableField(key.clone()));
        }

        let id = self
            .id()
            .ok_or_else(|| CouchError::NotFound("record has no _id".to_string()))?
            .to_string();

        self.data.extend(updates);
        self.db.put(&id, &mut self.data).await?;
        Ok(())
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record({:?})", self.data)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.data.clone()))
    }
}
