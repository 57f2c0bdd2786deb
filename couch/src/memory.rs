//! In-process CouchDB stand-in
//!
//! Keeps databases in memory with CouchDB's revision rules. Views can't run
//! JavaScript here, so map functions are registered as Rust closures.
//! Rows are ordered with CouchDB's collation for JSON keys.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::error::{CouchError, Result};
use crate::server::{Connector, CouchServer, Document};
use crate::view::{ViewQuery, ViewResult, ViewRow};

/// Map function: emits `(key, value)` pairs for a document
pub type MapFn = Arc<dyn Fn(&Document) -> Vec<(Value, Value)> + Send + Sync>;

#[derive(Default)]
struct State {
    databases: HashMap<String, BTreeMap<String, Document>>,
    views: HashMap<(String, String, String), MapFn>,
    writes: HashMap<(String, String), usize>,
}

#[derive(Default)]
pub struct MemoryServer {
    state: Mutex<State>,
    pending_collisions: AtomicUsize,
    restarts: AtomicUsize,
    fail_restart: AtomicBool,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes of new documents fail as id collisions
    pub fn inject_id_collisions(&self, count: usize) {
        self.pending_collisions.store(count, AtomicOrdering::SeqCst);
    }

    /// Successful writes of one document
    pub fn write_count(&self, db: &str, id: &str) -> usize {
        self.lock()
            .writes
            .get(&(db.to_string(), id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn register_view(&self, db: &str, design: &str, view: &str, map: MapFn) {
        self.lock()
            .views
            .insert((db.to_string(), design.to_string(), view.to_string()), map);
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(AtomicOrdering::SeqCst)
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.fail_restart.store(fail, AtomicOrdering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_collision(&self) -> bool {
        self.pending_collisions
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn next_rev(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl CouchServer for MemoryServer {
    fn display_url(&self) -> String {
        "memory://".to_string()
    }

    async fn database_exists(&self, db: &str) -> Result<bool> {
        Ok(self.lock().databases.contains_key(db))
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        let mut state = self.lock();
        if state.databases.contains_key(db) {
            return Err(CouchError::Server {
                status: 412,
                message: format!("database {} already exists", db),
            });
        }
        state.databases.insert(db.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn get_document(&self, db: &str, id: &str) -> Result<Option<Document>> {
        let state = self.lock();
        let database = state
            .databases
            .get(db)
            .ok_or_else(|| CouchError::NotFound(db.to_string()))?;
        Ok(database.get(id).cloned())
    }

    async fn put_document(&self, db: &str, id: &str, body: &Document) -> Result<String> {
        let given_rev = body.get("_rev").and_then(Value::as_str).map(str::to_string);
        if given_rev.is_none() && self.take_collision() {
            return Err(CouchError::IdentifierConflict(id.to_string()));
        }

        let mut state = self.lock();
        let database = state
            .databases
            .get_mut(db)
            .ok_or_else(|| CouchError::NotFound(db.to_string()))?;

        let current_rev = database
            .get(id)
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match (&current_rev, &given_rev) {
            (Some(_), None) => return Err(CouchError::IdentifierConflict(id.to_string())),
            (Some(current), Some(given)) if current != given => {
                return Err(CouchError::Conflict(id.to_string()))
            }
            (None, Some(_)) => return Err(CouchError::Conflict(id.to_string())),
            _ => {}
        }

        let rev = next_rev(current_rev.as_deref());
        let mut stored = body.clone();
        stored.insert("_id".to_string(), Value::String(id.to_string()));
        stored.insert("_rev".to_string(), Value::String(rev.clone()));
        database.insert(id.to_string(), stored);

        *state
            .writes
            .entry((db.to_string(), id.to_string()))
            .or_insert(0) += 1;
        Ok(rev)
    }

    async fn delete_document(&self, db: &str, id: &str, rev: &str) -> Result<()> {
        let mut state = self.lock();
        let database = state
            .databases
            .get_mut(db)
            .ok_or_else(|| CouchError::NotFound(db.to_string()))?;

        let current = database
            .get(id)
            .ok_or_else(|| CouchError::NotFound(id.to_string()))?;
        if current.get("_rev").and_then(Value::as_str) != Some(rev) {
            return Err(CouchError::Conflict(id.to_string()));
        }
        database.remove(id);
        Ok(())
    }

    async fn query_view(
        &self,
        db: &str,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<ViewResult> {
        let state = self.lock();
        let database = state
            .databases
            .get(db)
            .ok_or_else(|| CouchError::NotFound(db.to_string()))?;
        let map = state
            .views
            .get(&(db.to_string(), design.to_string(), view.to_string()))
            .ok_or_else(|| CouchError::NotFound(format!("{}/{}", design, view)))?;

        let mut rows: Vec<ViewRow> = database
            .iter()
            .filter(|(id, _)| !id.starts_with('_'))
            .flat_map(|(id, doc)| {
                map(doc).into_iter().map(move |(key, value)| ViewRow {
                    id: Some(id.clone()),
                    key,
                    value,
                    doc: None,
                })
            })
            .collect();
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        let total_rows = rows.len() as u64;

        let (low, high) = if query.descending {
            (&query.endkey, &query.startkey)
        } else {
            (&query.startkey, &query.endkey)
        };
        let mut rows: Vec<ViewRow> = rows
            .into_iter()
            .filter(|row| match &query.key {
                Some(key) => collate(&row.key, key) == Ordering::Equal,
                None => true,
            })
            .filter(|row| low.as_ref().map_or(true, |low| collate(&row.key, low) != Ordering::Less))
            .filter(|row| {
                high.as_ref()
                    .map_or(true, |high| collate(&row.key, high) != Ordering::Greater)
            })
            .collect();

        if query.descending {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }
        if query.include_docs {
            for row in &mut rows {
                row.doc = row
                    .id
                    .as_ref()
                    .and_then(|id| database.get(id))
                    .map(|doc| Value::Object(doc.clone()));
            }
        }

        Ok(ViewResult {
            total_rows,
            offset: 0,
            rows,
        })
    }

    async fn restart(&self) -> Result<()> {
        if self.fail_restart.load(AtomicOrdering::SeqCst) {
            return Err(CouchError::Server {
                status: 500,
                message: "restart refused".to_string(),
            });
        }
        self.restarts.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared `MemoryServer` for every URI
#[derive(Clone, Default)]
pub struct MemoryConnector {
    pub server: Arc<MemoryServer>,
    connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, _uri: &str) -> Result<Arc<dyn CouchServer>> {
        self.connects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(self.server.clone())
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// CouchDB view collation, with plain code point order for strings
pub fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                match collate(left, right) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                match lk.cmp(rk).then_with(|| collate(lv, rv)) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
