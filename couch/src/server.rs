//! Access to a CouchDB server
//!
//! `CouchServer` is the small part of the CouchDB REST API we rely on.
//! `HttpServer` talks to a real server; `MemoryServer` (see `memory`)
//! keeps everything in process.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{CouchError, Result};
use crate::locator::strip_userinfo;
use crate::view::{ViewQuery, ViewResult};

/// JSON body of a document
pub type Document = Map<String, Value>;

pub const DESIGN_PREFIX: &str = "_design/";

#[async_trait]
pub trait CouchServer: Send + Sync {
    /// Server URL without credentials
    fn display_url(&self) -> String;

    async fn database_exists(&self, db: &str) -> Result<bool>;

    async fn create_database(&self, db: &str) -> Result<()>;

    async fn get_document(&self, db: &str, id: &str) -> Result<Option<Document>>;

    /// Write a document and return its new revision.
    ///
    /// The body must carry the current `_rev` when replacing a document.
    /// Writing a new document under a taken id fails with
    /// `IdentifierConflict`, a stale `_rev` with `Conflict`.
    async fn put_document(&self, db: &str, id: &str, body: &Document) -> Result<String>;

    async fn delete_document(&self, db: &str, id: &str, rev: &str) -> Result<()>;

    async fn query_view(
        &self,
        db: &str,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<ViewResult>;

    /// Soft restart through the control endpoint
    async fn restart(&self) -> Result<()>;
}

/// Creates server handles from URIs
pub trait Connector: Send + Sync {
    fn connect(&self, uri: &str) -> Result<Arc<dyn CouchServer>>;
}

/// Connects over HTTP
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn connect(&self, uri: &str) -> Result<Arc<dyn CouchServer>> {
        Ok(Arc::new(HttpServer::new(uri)?))
    }
}

#[derive(Deserialize)]
struct PutResponse {
    rev: String,
}

/// CouchDB over HTTP; credentials in the URI are sent as basic auth
pub struct HttpServer {
    client: Client,
    base: Url,
    credentials: Option<(String, String)>,
}

impl HttpServer {
    pub fn new(uri: &str) -> Result<Self> {
        let mut base = Url::parse(uri)?;

        let credentials = if base.username().is_empty() {
            None
        } else {
            let user = urlencoding::decode(base.username())
                .map_err(|e| CouchError::InvalidLocator(e.to_string()))?
                .into_owned();
            let password = urlencoding::decode(base.password().unwrap_or(""))
                .map_err(|e| CouchError::InvalidLocator(e.to_string()))?
                .into_owned();
            Some((user, password))
        };
        let _ = base.set_username("");
        let _ = base.set_password(None);

        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CouchError::Http(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            base,
            credentials,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| CouchError::InvalidLocator(format!("Cannot be a base: {}", self.base)))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn doc_url(&self, db: &str, id: &str) -> Result<Url> {
        match id.strip_prefix(DESIGN_PREFIX) {
            Some(name) => self.url(&[db, "_design", name]),
            None => self.url(&[db, id]),
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("{} {}", method, url);
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| CouchError::Http(format!("CouchDB request failed: {}", e)))
    }
}

async fn server_error(response: Response) -> CouchError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    CouchError::Server { status, message }
}

#[async_trait]
impl CouchServer for HttpServer {
    fn display_url(&self) -> String {
        strip_userinfo(self.base.as_str())
    }

    async fn database_exists(&self, db: &str) -> Result<bool> {
        let response = self.send(self.request(Method::HEAD, self.url(&[db])?)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(server_error(response).await),
        }
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        let response = self.send(self.request(Method::PUT, self.url(&[db])?)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(server_error(response).await)
        }
    }

    async fn get_document(&self, db: &str, id: &str) -> Result<Option<Document>> {
        let response = self
            .send(self.request(Method::GET, self.doc_url(db, id)?))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(server_error(response).await),
        }
    }

    async fn put_document(&self, db: &str, id: &str, body: &Document) -> Result<String> {
        let response = self
            .send(self.request(Method::PUT, self.doc_url(db, id)?).json(body))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json::<PutResponse>().await?.rev),
            StatusCode::CONFLICT if body.contains_key("_rev") => {
                Err(CouchError::Conflict(id.to_string()))
            }
            StatusCode::CONFLICT => Err(CouchError::IdentifierConflict(id.to_string())),
            _ => Err(server_error(response).await),
        }
    }

    async fn delete_document(&self, db: &str, id: &str, rev: &str) -> Result<()> {
        let mut url = self.doc_url(db, id)?;
        url.query_pairs_mut().append_pair("rev", rev);
        let response = self.send(self.request(Method::DELETE, url)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(CouchError::NotFound(id.to_string())),
            StatusCode::CONFLICT => Err(CouchError::Conflict(id.to_string())),
            _ => Err(server_error(response).await),
        }
    }

    async fn query_view(
        &self,
        db: &str,
        design: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<ViewResult> {
        let mut url = self.url(&[db, "_design", design, "_view", view])?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query.to_params() {
                pairs.append_pair(name, &value);
            }
        }

        let response = self.send(self.request(Method::GET, url)).await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(CouchError::NotFound(format!("{}/{}", design, view))),
            _ => Err(server_error(response).await),
        }
    }

    async fn restart(&self) -> Result<()> {
        let response = self
            .send(
                self.request(Method::POST, self.url(&["_restart"])?)
                    .header(reqwest::header::CONTENT_TYPE, "application/json"),
            )
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(server_error(response).await)
        }
    }
}
