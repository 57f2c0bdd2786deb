//! Connections resolved from locator strings
//!
//! `Couch::open` accepts any locator (see `locator`) and hides which kind
//! of server is behind it. Private servers in a directory are started on
//! demand and stay up after the connection is dropped; call `shutdown` to
//! stop them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::environment::Environment;
use crate::error::{CouchError, Result};
use crate::forward::{futon_url, DebugForwarder};
use crate::instance::ManagedInstance;
use crate::locator::{strip_userinfo, Locator};
use crate::options::AdditionalOptions;
use crate::sequence::TimeSequence;
use crate::server::CouchServer;

enum Backend {
    Desktop,
    Managed(ManagedInstance),
    Remote,
}

pub struct Couch {
    env: Environment,
    backend: Backend,
    server: Arc<dyn CouchServer>,
    uri: String,
    name: String,
    db: Option<Database>,
    db_created: bool,
    record_type_base: Arc<RwLock<String>>,
    sequence: Arc<TimeSequence>,
}

impl Couch {
    /// Resolve `locator` with the process-wide configuration.
    ///
    /// A database named in the locator wins over `default_dbname`; with
    /// neither, the connection has no database selected.
    pub async fn open(locator: &str, default_dbname: Option<&str>) -> Result<Self> {
        Self::open_with(locator, default_dbname, &Environment::system()?).await
    }

    pub async fn open_with(
        locator: &str,
        default_dbname: Option<&str>,
        env: &Environment,
    ) -> Result<Self> {
        let parsed = Locator::parse(locator)?;
        let dbname = parsed.effective_dbname(default_dbname);
        debug!("Resolving {:?}", parsed);

        let mut couch = match parsed {
            Locator::DesktopService { .. } => {
                let uri = desktop_uri(env).await?;
                let server = env.connector.connect(&uri)?;
                Self::new(env, Backend::Desktop, server, uri, "desktopcouch://".to_string())
            }
            Locator::LocalDirectory { dir, options, .. } => {
                let name = format!("file://{}", dir.display());
                let instance = ManagedInstance::ensure_running(dir, options, env).await?;
                Self::managed(env, instance, name)
            }
            Locator::RemoteServer { url, .. } => {
                let server = env.connector.connect(&url)?;
                let name = strip_userinfo(&url);
                Self::new(env, Backend::Remote, server, url, name)
            }
            Locator::TempDirectory {
                name_hint, options, ..
            } => {
                let dir = temp_dir(&name_hint)?;
                let name = format!("tmp://{}", dir.display());
                Self::managed(env, start_in_temp_dir(dir, options, env).await?, name)
            }
        };

        if let Some(dbname) = dbname {
            let db = couch.create_or_use(&dbname).await?;
            couch.db = Some(db);
        }

        Ok(couch)
    }

    fn new(
        env: &Environment,
        backend: Backend,
        server: Arc<dyn CouchServer>,
        uri: String,
        name: String,
    ) -> Self {
        Self {
            env: env.clone(),
            backend,
            server,
            uri,
            name,
            db: None,
            db_created: false,
            record_type_base: Arc::new(RwLock::new(env.config.record_type_base.clone())),
            sequence: Arc::new(TimeSequence::new()),
        }
    }

    fn managed(env: &Environment, instance: ManagedInstance, name: String) -> Self {
        let server = instance.server();
        let uri = instance.uri().to_string();
        Self::new(env, Backend::Managed(instance), server, uri, name)
    }

    fn wrap(&self, name: &str) -> Database {
        Database::new(
            name,
            self.server.clone(),
            self.record_type_base.clone(),
            self.sequence.clone(),
        )
    }

    /// Create a database; fails if it exists
    pub async fn create(&self, name: &str) -> Result<Database> {
        info!("Creating couch database '{}' in '{}'", name, self);
        self.server.create_database(name).await?;
        Ok(self.wrap(name))
    }

    /// Open a database, creating it if needed; see `db_created`
    pub async fn create_or_use(&mut self, name: &str) -> Result<Database> {
        if self.server.database_exists(name).await? {
            self.db_created = false;
            Ok(self.wrap(name))
        } else {
            let db = self.create(name).await?;
            self.db_created = true;
            Ok(db)
        }
    }

    /// Open an existing database
    pub async fn database(&self, name: &str) -> Result<Database> {
        if self.server.database_exists(name).await? {
            Ok(self.wrap(name))
        } else {
            Err(CouchError::NotFound(format!("database '{}'", name)))
        }
    }

    /// Database selected by the locator or the default name
    pub fn db(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    pub fn dbname(&self) -> Option<&str> {
        self.db.as_ref().map(Database::name)
    }

    /// Whether the last `create_or_use` had to create the database
    pub fn db_created(&self) -> bool {
        self.db_created
    }

    pub fn server(&self) -> Arc<dyn CouchServer> {
        self.server.clone()
    }

    /// Server URI, including credentials for managed servers
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn instance(&self) -> Option<&ManagedInstance> {
        match &self.backend {
            Backend::Managed(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn instance_mut(&mut self) -> Option<&mut ManagedInstance> {
        match &mut self.backend {
            Backend::Managed(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn record_type_base(&self) -> String {
        self.record_type_base
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Change the template for all databases of this connection
    pub fn set_record_type_base(&self, base: &str) {
        if let Ok(mut guard) = self.record_type_base.write() {
            *guard = base.to_string();
        }
    }

    pub fn time_sequence(&self) -> &Arc<TimeSequence> {
        &self.sequence
    }

    /// Stop a managed server and run its shutdown hooks
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Backend::Managed(instance) = &mut self.backend {
            return instance.shutdown().await;
        }
        debug!("{} is not managed by us, not shutting it down", self);
        Ok(())
    }

    /// Restart the server and reconnect.
    ///
    /// The selected database follows the new connection; `Database`
    /// handles cloned before keep talking to the old one.
    pub async fn restart(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Managed(instance) => {
                instance.restart().await?;
                self.server = instance.server();
                self.uri = instance.uri().to_string();
            }
            _ => {
                self.server
                    .restart()
                    .await
                    .map_err(|e| CouchError::RestartFailed(e.to_string()))?;
                self.server = self.env.connector.connect(&self.uri)?;
            }
        }

        self.db = self.db.take().map(|db| db.rebind(self.server.clone()));
        Ok(())
    }

    /// Futon web interface of the server, or of the selected database
    pub fn futon_url(&self) -> String {
        futon_url(&self.uri, self.dbname())
    }

    /// URLs reachable from other machines, see `DebugForwarder`
    pub fn debug_url(&self, local: bool) -> DebugForwarder {
        DebugForwarder::new(&self.uri, self.dbname(), local)
    }
}

impl fmt::Display for Couch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dbname() {
            Some(dbname) => write!(f, "Couch({}#{})", self.name, dbname),
            None => write!(f, "Couch({})", self.name),
        }
    }
}

impl fmt::Debug for Couch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// URI published by the desktop CouchDB service
async fn desktop_uri(env: &Environment) -> Result<String> {
    let path = env.config.desktop_uri_file().ok_or_else(|| {
        CouchError::UnsupportedBackend("No location known for the desktop CouchDB".to_string())
    })?;

    match tokio::fs::read_to_string(&path).await {
        Ok(uri) if !uri.trim().is_empty() => Ok(uri.trim().to_string()),
        _ => Err(CouchError::UnsupportedBackend(format!(
            "Desktop CouchDB is not running, no URI in {}",
            path.display()
        ))),
    }
}

/// Fresh directory whose name starts with `name_hint`
fn temp_dir(name_hint: &str) -> Result<PathBuf> {
    let dir = tempfile::Builder::new().prefix(name_hint).tempdir()?;
    Ok(dir.keep())
}

async fn start_in_temp_dir(
    dir: PathBuf,
    options: AdditionalOptions,
    env: &Environment,
) -> Result<ManagedInstance> {
    let mut instance = ManagedInstance::ensure_running(&dir, options, env).await?;
    instance.on_shutdown(move || remove_temp_dir(&dir));
    Ok(instance)
}

fn remove_temp_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed {}", dir.display()),
        Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::{fake_env, FakeControl, FAKE_URI};
    use serde_json::json;

    fn remote_env() -> (Environment, crate::memory::MemoryConnector) {
        fake_env(Path::new("/nonexistent"), Arc::new(FakeControl::default()))
    }

    #[tokio::test]
    async fn test_remote_server() {
        let (env, connector) = remote_env();

        let couch = Couch::open_with("http://u:p@example.org:5984/#maildb", None, &env)
            .await
            .unwrap();
        assert_eq!(couch.to_string(), "Couch(http://example.org:5984/#maildb)");
        assert_eq!(couch.uri(), "http://u:p@example.org:5984/");
        assert!(couch.db_created());
        assert!(couch.instance().is_none());

        let again = Couch::open_with("http://u:p@example.org:5984/#maildb", None, &env)
            .await
            .unwrap();
        assert!(!again.db_created());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_default_dbname() {
        let (env, _) = remote_env();

        let couch = Couch::open_with("https://example.org/", Some("fallback"), &env)
            .await
            .unwrap();
        assert_eq!(couch.dbname(), Some("fallback"));

        let couch = Couch::open_with("https://example.org/#given", Some("fallback"), &env)
            .await
            .unwrap();
        assert_eq!(couch.dbname(), Some("given"));

        let couch = Couch::open_with("https://example.org/", None, &env)
            .await
            .unwrap();
        assert!(couch.db().is_none());
        assert_eq!(couch.to_string(), "Couch(https://example.org/)");
    }

    #[tokio::test]
    async fn test_unknown_locator() {
        let (env, _) = remote_env();

        match Couch::open_with("ftp://example.org/", None, &env).await {
            Err(CouchError::InvalidLocator(_)) => {}
            other => panic!("Expected InvalidLocator, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_directory_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("x");
        let control = Arc::new(FakeControl::default());
        let (env, _) = fake_env(&dir, control.clone());
        let locator = format!("file://{}#maildb?stats=no", dir.display());

        let couch = Couch::open_with(&locator, None, &env).await.unwrap();

        assert_eq!(couch.dbname(), Some("maildb"));
        assert_eq!(couch.to_string(), format!("Couch(file://{}#maildb)", dir.display()));
        assert!(dir.join("log").is_dir() && dir.join("data").is_dir());
        let config = std::fs::read_to_string(dir.join("couch.ini")).unwrap();
        assert!(config.contains("[stats]\nrate = \n"));

        let credentials = couch.instance().unwrap().credentials().clone();
        assert_eq!(
            couch.futon_url(),
            format!(
                "http://{}:{}@127.0.0.1:5984/_utils/database.html?maildb",
                credentials.user, credentials.password
            )
        );

        let pid_before = std::fs::metadata(dir.join("couch.pid")).unwrap().modified().unwrap();
        let again = Couch::open_with(&locator, None, &env).await.unwrap();
        assert_eq!(control.starts(), 1);
        assert!(!again.db_created());
        assert_eq!(
            std::fs::metadata(dir.join("couch.pid")).unwrap().modified().unwrap(),
            pid_before
        );
    }

    #[tokio::test]
    async fn test_temp_directory_removed_on_shutdown() {
        let control = Arc::new(FakeControl::default());
        let (env, _) = fake_env(Path::new("/nonexistent"), control.clone());

        let mut couch = Couch::open_with("tmp://couchtest#db", None, &env).await.unwrap();
        let dir = couch.instance().unwrap().dir().to_path_buf();

        assert!(dir.is_dir());
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("couchtest"));
        assert_eq!(couch.to_string(), format!("Couch(tmp://{}#db)", dir.display()));

        couch.shutdown().await.unwrap();
        assert_eq!(control.stops(), 1);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_desktop_service() {
        let tmp = tempfile::tempdir().unwrap();
        let uri_file = tmp.path().join("desktop-couchdb.uri");
        let (mut env, _) = remote_env();
        env.config.desktop_uri_file = Some(uri_file.clone());

        match Couch::open_with("desktopcouch://", None, &env).await {
            Err(CouchError::UnsupportedBackend(_)) => {}
            other => panic!("Expected UnsupportedBackend, got {:?}", other),
        }

        std::fs::write(&uri_file, format!("{}\n", FAKE_URI)).unwrap();
        let couch = Couch::open_with("desktopcouch://notes", None, &env)
            .await
            .unwrap();
        assert_eq!(couch.to_string(), "Couch(desktopcouch://#notes)");
        assert_eq!(couch.uri(), FAKE_URI);
    }

    #[tokio::test]
    async fn test_open_missing_database() {
        let (env, _) = remote_env();
        let mut couch = Couch::open_with("http://example.org/", None, &env)
            .await
            .unwrap();

        match couch.database("missing").await {
            Err(CouchError::NotFound(_)) => {}
            other => panic!("Expected NotFound, got {:?}", other.map(|db| db.name().to_string())),
        }

        couch.create_or_use("present").await.unwrap();
        assert!(couch.db_created());
        assert_eq!(couch.database("present").await.unwrap().name(), "present");
    }

    #[tokio::test]
    async fn test_record_type_base_is_shared() {
        let (env, _) = remote_env();
        let couch = Couch::open_with("http://example.org/#db", None, &env)
            .await
            .unwrap();
        couch.set_record_type_base("http://example/$$");

        let db = couch.db().unwrap();
        let record = db
            .create_record(
                match json!({"record_type": "note", "title": "x"}) {
                    serde_json::Value::Object(map) => map,
                    _ => unreachable!(),
                },
                None,
            )
            .await
            .unwrap();
        let fetched = db.get(record.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(fetched.record_type(), Some("http://example/note"));
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("x");
        let (env, connector) = fake_env(&dir, Arc::new(FakeControl::default()));
        let mut couch = Couch::open_with(&format!("file://{}#db", dir.display()), None, &env)
            .await
            .unwrap();
        let uri = couch.uri().to_string();

        connector.server.fail_restarts(true);
        match couch.restart().await {
            Err(CouchError::RestartFailed(_)) => {}
            other => panic!("Expected RestartFailed, got {:?}", other),
        }
        assert_eq!(couch.uri(), uri);
        assert_eq!(couch.dbname(), Some("db"));
    }
}
