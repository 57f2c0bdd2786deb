//! A database on a connected server
//!
//! Besides plain document access this handles:
//! - record creation with generated ids, retried on id collisions
//! - record types: short names are expanded against a base template
//! - design documents that are only rewritten when their code changes

use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{CouchError, Result};
use crate::record::Record;
use crate::sequence::TimeSequence;
use crate::server::{CouchServer, Document, DESIGN_PREFIX};
use crate::view::{ViewQuery, ViewResult};

/// Marker replaced by the short record type in the base template
pub const RECORD_TYPE_MARKER: &str = "$$";

/// Attempts at finding an unused generated id
const MAX_ID_ATTEMPTS: usize = 100;

struct Inner {
    name: String,
    server: Arc<dyn CouchServer>,
    shared_record_type_base: Arc<RwLock<String>>,
    record_type_base: RwLock<Option<String>>,
    sequence: Arc<TimeSequence>,
}

/// Handle to one database, cheap to clone
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    pub(crate) fn new(
        name: &str,
        server: Arc<dyn CouchServer>,
        shared_record_type_base: Arc<RwLock<String>>,
        sequence: Arc<TimeSequence>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                server,
                shared_record_type_base,
                record_type_base: RwLock::new(None),
                sequence,
            }),
        }
    }

    /// Same database through another server connection
    pub(crate) fn rebind(&self, server: Arc<dyn CouchServer>) -> Self {
        let own_base = self
            .inner
            .record_type_base
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        let db = Self::new(
            &self.inner.name,
            server,
            self.inner.shared_record_type_base.clone(),
            self.inner.sequence.clone(),
        );
        db.set_record_type_base(own_base.as_deref());
        db
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server(&self) -> &Arc<dyn CouchServer> {
        &self.inner.server
    }

    /// Tie-breaker source shared by all databases of a connection
    pub fn time_sequence(&self) -> &Arc<TimeSequence> {
        &self.inner.sequence
    }

    /// Base template for this database, falling back to the connection's
    pub fn record_type_base(&self) -> String {
        let own = self
            .inner
            .record_type_base
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        own.unwrap_or_else(|| {
            self.inner
                .shared_record_type_base
                .read()
                .map(|guard| guard.clone())
                .unwrap_or_default()
        })
    }

    pub fn set_record_type_base(&self, base: Option<&str>) {
        if let Ok(mut guard) = self.inner.record_type_base.write() {
            *guard = base.map(str::to_string);
        }
    }

    /// Expand a short record type, unless it already looks like a URL
    pub fn full_record_type(&self, record_type: &str) -> String {
        if record_type.contains("://") {
            record_type.to_string()
        } else {
            self.record_type_base()
                .replace(RECORD_TYPE_MARKER, record_type)
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        let doc = self.inner.server.get_document(&self.inner.name, id).await?;
        Ok(doc.map(|doc| Record::new(self.clone(), doc)))
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self
            .inner
            .server
            .get_document(&self.inner.name, id)
            .await?
            .is_some())
    }

    /// Store a document under `id` and write the new `_id`/`_rev` into it
    pub async fn put(&self, id: &str, doc: &mut Document) -> Result<String> {
        let rev = self
            .inner
            .server
            .put_document(&self.inner.name, id, doc)
            .await?;
        doc.insert("_id".to_string(), Value::String(id.to_string()));
        doc.insert("_rev".to_string(), Value::String(rev.clone()));
        Ok(rev)
    }

    pub async fn delete(&self, id: &str, rev: &str) -> Result<()> {
        self.inner
            .server
            .delete_document(&self.inner.name, id, rev)
            .await
    }

    /// Create a record, generating an id unless `_id` is given.
    ///
    /// `record_type`, either passed here or present in `fields`, is
    /// expanded with `full_record_type`. A generated id that is already
    /// taken is replaced by a fresh one; a caller-supplied id is written as
    /// it is and a collision is returned to the caller.
    pub async fn create_record(
        &self,
        fields: Document,
        record_type: Option<&str>,
    ) -> Result<Record> {
        let mut record = fields;
        if let Some(record_type) = record_type {
            record.insert(
                "record_type".to_string(),
                Value::String(record_type.to_string()),
            );
        }

        match record.get("record_type").and_then(Value::as_str) {
            Some(record_type) => {
                let full = self.full_record_type(record_type);
                record.insert("record_type".to_string(), Value::String(full));
            }
            None => warn!("record_type not set on a record"),
        }

        if let Some(id) = record.get("_id").and_then(Value::as_str).map(str::to_string) {
            self.put(&id, &mut record).await?;
            return Ok(Record::new(self.clone(), record));
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = uuid::Uuid::new_v4().to_string();
            match self.put(&id, &mut record).await {
                Ok(_) => return Ok(Record::new(self.clone(), record)),
                Err(CouchError::IdentifierConflict(_)) => {
                    debug!("Generated id {} is taken, trying another one", id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(CouchError::IdentifierConflict(format!(
            "no free id after {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    /// Make sure a design document holds `code` under `<kind>s/<name>`.
    ///
    /// CouchDB rebuilds the index whenever a design document changes, so it
    /// is only written when the stored code differs. Returns whether it was
    /// written.
    pub async fn need_design(
        &self,
        design_doc: &str,
        kind: &str,
        name: &str,
        code: Value,
    ) -> Result<bool> {
        let design_id = if design_doc.starts_with(DESIGN_PREFIX) {
            design_doc.to_string()
        } else {
            format!("{}{}", DESIGN_PREFIX, design_doc)
        };

        let mut doc = self
            .inner
            .server
            .get_document(&self.inner.name, &design_id)
            .await?
            .unwrap_or_default();

        // stored under the plural, e.g. "views"
        let section_key = format!("{}s", kind);
        if !matches!(doc.get(&section_key), Some(Value::Object(_))) {
            doc.insert(section_key.clone(), Value::Object(Document::new()));
        }
        if doc.get(&section_key).and_then(|section| section.get(name)) == Some(&code) {
            return Ok(false);
        }

        info!(
            "Updating design document {}: {}/{}",
            design_id, section_key, name
        );
        if let Some(Value::Object(section)) = doc.get_mut(&section_key) {
            section.insert(name.to_string(), code);
        }
        self.put(&design_id, &mut doc).await?;
        Ok(true)
    }

    pub async fn need_view(&self, design_doc: &str, view_name: &str, code: Value) -> Result<bool> {
        self.need_design(design_doc, "view", view_name, code).await
    }

    /// View over the records of one type; `body` sees `doc` and may `emit`
    pub async fn need_record_view(
        &self,
        record_type: &str,
        design_doc: &str,
        view_name: &str,
        body: &str,
    ) -> Result<bool> {
        let code = record_view_code(&self.full_record_type(record_type), body);
        self.need_view(design_doc, view_name, serde_json::json!({ "map": code }))
            .await
    }

    /// Query a view named `design/view`
    pub async fn view(&self, name: &str, query: &ViewQuery) -> Result<ViewResult> {
        let (design, view) = name.split_once('/').ok_or_else(|| {
            CouchError::NotFound(format!("view name must be 'design/view': {}", name))
        })?;
        let design = design.strip_prefix(DESIGN_PREFIX).unwrap_or(design);
        self.inner
            .server
            .query_view(&self.inner.name, design, view, query)
            .await
    }
}

/// Map function that only looks at records of `full_type`
pub fn record_view_code(full_type: &str, body: &str) -> String {
    format!(
        "function(doc) {{ if (doc.record_type == \"{}\") {{\n\t{}\n}}}}",
        full_type,
        body.replace('\n', "\n\t")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use serde_json::json;
    use std::collections::HashSet;

    async fn database(base: &str) -> (Arc<MemoryServer>, Database) {
        let server = Arc::new(MemoryServer::new());
        server.create_database("test").await.unwrap();
        let db = Database::new(
            "test",
            server.clone(),
            Arc::new(RwLock::new(base.to_string())),
            Arc::new(TimeSequence::new()),
        );
        (server, db)
    }

    fn fields(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_create_record_populates_id_and_rev() {
        let (_, db) = database("http://blub/$$").await;

        let a = fields(json!({"blub": 42, "foo": "bar"}));
        let x1 = db.create_record(a.clone(), None).await.unwrap();
        let mut with_d = a.clone();
        with_d.insert("d".to_string(), json!(7));
        let x2 = db.create_record(with_d, None).await.unwrap();

        assert!(x1.id().is_some() && x1.rev().is_some());
        assert!(x2.id().is_some() && x2.rev().is_some());
        assert_ne!(x1.id(), x2.id());
        assert!(!a.contains_key("d"));
        assert!(!x1.contains("d"));
        assert_eq!(x2.field("d").unwrap(), &json!(7));

        let y1 = db.get(x1.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(y1.rev(), x1.rev());
        assert_eq!(y1.get("blub"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_missing_field_is_error() {
        let (_, db) = database("http://blub/$$").await;
        let record = db.create_record(fields(json!({"d": 7})), None).await.unwrap();

        match record.field("blub") {
            Err(CouchError::NotFound(_)) => {}
            other => panic!("Expected NotFound, got {:?}", other),
        }
        assert_eq!(record.get("blub"), None);
    }

    #[tokio::test]
    async fn test_record_type_expansion() {
        let (_, db) = database("http://example/$$").await;

        let record = db
            .create_record(fields(json!({"record_type": "note", "title": "x"})), None)
            .await
            .unwrap();
        let fetched = db.get(record.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(fetched.record_type(), Some("http://example/note"));

        let record = db
            .create_record(fields(json!({"title": "y"})), Some("http://other/type"))
            .await
            .unwrap();
        assert_eq!(record.record_type(), Some("http://other/type"));
    }

    #[tokio::test]
    async fn test_database_base_overrides_connection_base() {
        let (_, db) = database("http://shared/$$").await;
        assert_eq!(db.full_record_type("mail"), "http://shared/mail");

        db.set_record_type_base(Some("urn:own:$$"));
        assert_eq!(db.full_record_type("mail"), "urn:own:mail");
    }

    #[tokio::test]
    async fn test_create_record_retries_collisions() {
        let (server, db) = database("http://blub/$$").await;
        server.inject_id_collisions(5);

        let mut ids = HashSet::new();
        for _ in 0..3 {
            let record = db.create_record(fields(json!({"n": 1})), None).await.unwrap();
            assert!(record.rev().is_some());
            assert!(ids.insert(record.id().unwrap().to_string()));
        }
    }

    #[tokio::test]
    async fn test_create_record_gives_up_after_max_attempts() {
        let (server, db) = database("http://blub/$$").await;
        server.inject_id_collisions(MAX_ID_ATTEMPTS + 10);

        match db.create_record(fields(json!({"n": 1})), None).await {
            Err(CouchError::IdentifierConflict(message)) => {
                assert!(message.contains(&MAX_ID_ATTEMPTS.to_string()))
            }
            other => panic!("Expected IdentifierConflict, got {:?}", other),
        }

        // drop the collisions left over
        server.inject_id_collisions(0);
        let record = db.create_record(fields(json!({"n": 2})), None).await.unwrap();
        assert_eq!(server.write_count("test", record.id().unwrap()), 1);
    }

    #[tokio::test]
    async fn test_explicit_id_collision_reaches_caller() {
        let (_, db) = database("http://blub/$$").await;
        db.create_record(fields(json!({"_id": "fixed"})), None)
            .await
            .unwrap();

        match db.create_record(fields(json!({"_id": "fixed"})), None).await {
            Err(CouchError::IdentifierConflict(id)) => assert_eq!(id, "fixed"),
            other => panic!("Expected IdentifierConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_need_view_writes_only_on_change() {
        let (server, db) = database("http://blub/$$").await;
        let code = json!({"map": "function(doc) { emit(doc._id, null); }"});

        assert!(db.need_view("mail", "all", code.clone()).await.unwrap());
        assert!(!db.need_view("mail", "all", code.clone()).await.unwrap());
        assert!(!db.need_view("_design/mail", "all", code).await.unwrap());
        assert_eq!(server.write_count("test", "_design/mail"), 1);

        let changed = json!({"map": "function(doc) { emit(doc.name, null); }"});
        assert!(db.need_view("mail", "all", changed).await.unwrap());
        assert_eq!(server.write_count("test", "_design/mail"), 2);

        let design = db.get("_design/mail").await.unwrap().unwrap();
        assert_eq!(
            design.field("views").unwrap()["all"]["map"],
            "function(doc) { emit(doc.name, null); }"
        );
    }

    #[tokio::test]
    async fn test_need_record_view_code() {
        let (_, db) = database("http://blub/$$").await;
        db.need_record_view("mail", "mail_folder", "mail_folders", "emit(doc.name, doc);\nreturn;")
            .await
            .unwrap();

        let design = db.get("_design/mail_folder").await.unwrap().unwrap();
        assert_eq!(
            design.field("views").unwrap()["mail_folders"]["map"],
            "function(doc) { if (doc.record_type == \"http://blub/mail\") {\n\temit(doc.name, doc);\n\treturn;\n}}"
        );
    }

    #[tokio::test]
    async fn test_record_update() {
        let (_, db) = database("http://blub/$$").await;
        let mut record = db
            .create_record(fields(json!({"title": "old"})), Some("note"))
            .await
            .unwrap();
        let first_rev = record.rev().unwrap().to_string();

        record
            .update(vec![("title".to_string(), json!("new")), ("n".to_string(), json!(1))])
            .await
            .unwrap();
        assert_ne!(record.rev().unwrap(), first_rev);

        let fetched = db.get(record.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(fetched.get("title"), Some(&json!("new")));
        assert_eq!(fetched.get("n"), Some(&json!(1)));
        assert_eq!(fetched.rev(), record.rev());
    }

    #[tokio::test]
    async fn test_update_rejects_id_and_rev() {
        let (_, db) = database("http://blub/$$").await;
        let mut record = db.create_record(fields(json!({"a": 1})), None).await.unwrap();

        for key in ["_id", "_rev"] {
            match record.update(vec![(key.to_string(), json!("x"))]).await {
                Err(CouchError::ImmutableField(field)) => assert_eq!(field, key),
                other => panic!("Expected ImmutableField, got {:?}", other),
            }
        }
        assert_eq!(record.get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_view_query_by_name() {
        let (server, db) = database("http://blub/$$").await;
        server.register_view(
            "test",
            "mail",
            "names",
            Arc::new(|doc: &Document| vec![(doc["name"].clone(), Value::Null)]),
        );
        for name in ["b", "a", "c"] {
            db.create_record(fields(json!({"name": name})), Some("mail"))
                .await
                .unwrap();
        }

        let result = db
            .view("mail/names", &ViewQuery::range(json!("a"), json!("b")))
            .await
            .unwrap();
        let keys: Vec<&Value> = result.rows.iter().map(|row| &row.key).collect();
        assert_eq!(keys, vec![&json!("a"), &json!("b")]);
    }
}
