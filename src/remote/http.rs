// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP client for a CouchDB-compatible remote.
//!
//! # Requests
//!
//! ```text
//! info        GET  /{db}                        (404 → PUT /{db}, then GET)
//! changes     GET  /{db}/_changes?style=all_docs&since=..&limit=..[&feed=longpoll&timeout=ms]
//!             POST /{db}/_bulk_get?revs=true    (leaf bodies with _revisions)
//! bulk_write  POST /{db}/_bulk_docs             { docs, new_edits: false }
//! ```
//!
//! # Status Mapping
//!
//! | Outcome | Error |
//! |---------|-------|
//! | connect error, timeout, 5xx | `RemoteUnreachable` |
//! | 401 / 403 | `AuthFailure` |
//! | other non-2xx, undecodable body | `RemoteProtocol` |

use super::{BoxFuture, ChangesPage, ChangesRequest, RemoteConnector, RemoteInfo, RemoteStore, WireDocument};
use crate::config::SupervisorSettings;
use crate::document::SyncConfig;
use crate::error::{LedgerError, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// Accept `host:port` as well as full URLs, and drop trailing slashes.
pub fn normalize_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(LedgerError::Config("remote_url is empty".into()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    // A trailing slash makes `join` append rather than replace the last segment.
    Url::parse(&format!("{}/", with_scheme))
        .map_err(|e| LedgerError::Config(format!("Invalid remote_url '{}': {}", raw, e)))
}

fn status_seq(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct DbInfo {
    #[serde(default)]
    doc_count: u64,
    #[serde(default)]
    update_seq: Value,
}

#[derive(Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<ChangeRow>,
    #[serde(default)]
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    id: String,
    #[serde(default)]
    changes: Vec<ChangeRev>,
}

#[derive(Deserialize)]
struct ChangeRev {
    rev: String,
}

#[derive(Deserialize)]
struct BulkGetResponse {
    #[serde(default)]
    results: Vec<BulkGetResult>,
}

#[derive(Deserialize)]
struct BulkGetResult {
    #[serde(default)]
    docs: Vec<BulkGetDoc>,
}

#[derive(Deserialize)]
struct BulkGetDoc {
    #[serde(default)]
    ok: Option<WireDocument>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct BulkDocsResult {
    #[serde(default)]
    id: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// A remote reached over HTTP.
pub struct HttpRemote {
    client: Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
    request_timeout: Duration,
}

impl HttpRemote {
    pub fn new(sync: &SyncConfig, request_timeout: Duration) -> Result<Self> {
        let base = normalize_base_url(&sync.remote_url)?;
        let client = Client::builder()
            .build()
            .map_err(|e| LedgerError::Config(format!("HTTP client: {}", e)))?;
        info!(base = %base, "HTTP remote configured");
        Ok(Self {
            client,
            base,
            username: sync.username.clone().filter(|u| !u.is_empty()),
            password: sync.password.clone(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, collection: &str, path: &str) -> Result<Url> {
        let joined = if path.is_empty() {
            collection.to_string()
        } else {
            format!("{}/{}", collection, path)
        };
        self.base
            .join(&joined)
            .map_err(|e| LedgerError::Config(format!("Invalid collection path '{}': {}", joined, e)))
    }

    fn request(&self, method: Method, url: Url, timeout: Duration) -> RequestBuilder {
        let builder = self.client.request(method, url).timeout(timeout);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, collection: &str, operation: &str, builder: RequestBuilder) -> Result<Response> {
        let start = Instant::now();
        let result = builder.send().await;
        crate::metrics::record_remote_latency(collection, operation, start.elapsed());

        let response = result.map_err(|e| {
            crate::metrics::record_remote_error(collection, if e.is_timeout() { "timeout" } else { "transport" });
            LedgerError::unreachable(operation, e.to_string())
        })?;
        Ok(response)
    }

    async fn check(collection: &str, operation: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        crate::metrics::record_remote_error(collection, status.as_str());
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LedgerError::AuthFailure(format!("{} returned {}", operation, status))
            }
            s if s.is_server_error() => LedgerError::unreachable(operation, format!("{}: {}", s, body)),
            s => LedgerError::RemoteProtocol {
                operation: operation.to_string(),
                status: s.as_u16(),
                message: body,
            },
        })
    }

    async fn decode<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| LedgerError::unreachable(operation, e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| LedgerError::RemoteProtocol {
            operation: operation.to_string(),
            status,
            message: e.to_string(),
        })
    }

    async fn get_info(&self, collection: &str) -> Result<Option<DbInfo>> {
        let url = self.url(collection, "")?;
        let response = self
            .send(collection, "info", self.request(Method::GET, url, self.request_timeout))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(collection, "info", response).await?;
        Ok(Some(Self::decode("info", response).await?))
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        let url = self.url(collection, "")?;
        let response = self
            .send(collection, "create", self.request(Method::PUT, url, self.request_timeout))
            .await?;
        // 412: somebody else created it first
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(());
        }
        Self::check(collection, "create", response).await?;
        info!(collection = %collection, "Created remote collection");
        Ok(())
    }

    async fn fetch_leaves(&self, collection: &str, rows: &[ChangeRow]) -> Result<Vec<WireDocument>> {
        let wanted: Vec<Value> = rows
            .iter()
            .flat_map(|row| row.changes.iter().map(move |c| json!({"id": row.id, "rev": c.rev})))
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut url = self.url(collection, "_bulk_get")?;
        url.query_pairs_mut().append_pair("revs", "true");
        let builder = self
            .request(Method::POST, url, self.request_timeout)
            .json(&json!({ "docs": wanted }));
        let response = self.send(collection, "bulk_get", builder).await?;
        let response = Self::check(collection, "bulk_get", response).await?;
        let body: BulkGetResponse = Self::decode("bulk_get", response).await?;

        let mut docs = Vec::new();
        for result in body.results {
            for entry in result.docs {
                match (entry.ok, entry.error) {
                    (Some(doc), _) => docs.push(doc),
                    (None, Some(err)) => debug!(collection = %collection, error = %err, "Leaf no longer available"),
                    (None, None) => {}
                }
            }
        }
        Ok(docs)
    }
}

impl RemoteStore for HttpRemote {
    fn info(&self, collection: &str) -> BoxFuture<'_, RemoteInfo> {
        let collection = collection.to_string();
        Box::pin(async move {
            let info = match self.get_info(&collection).await? {
                Some(info) => info,
                None => {
                    self.create_collection(&collection).await?;
                    self.get_info(&collection).await?.ok_or_else(|| LedgerError::RemoteProtocol {
                        operation: "info".into(),
                        status: 404,
                        message: format!("collection {} missing after create", collection),
                    })?
                }
            };
            Ok(RemoteInfo {
                doc_count: info.doc_count,
                update_seq: status_seq(&info.update_seq),
            })
        })
    }

    fn changes(&self, collection: &str, request: ChangesRequest) -> BoxFuture<'_, ChangesPage> {
        let collection = collection.to_string();
        Box::pin(async move {
            let mut url = self.url(&collection, "_changes")?;
            let mut timeout = self.request_timeout;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("style", "all_docs");
                query.append_pair("limit", &request.limit.max(1).to_string());
                if !request.since.is_empty() {
                    query.append_pair("since", &request.since);
                }
                if let Some(wait) = request.longpoll {
                    query.append_pair("feed", "longpoll");
                    query.append_pair("timeout", &wait.as_millis().to_string());
                    timeout += wait;
                }
            }

            let response = self
                .send(&collection, "changes", self.request(Method::GET, url, timeout))
                .await?;
            let response = Self::check(&collection, "changes", response).await?;
            let body: ChangesResponse = Self::decode("changes", response).await?;

            let last_seq = match status_seq(&body.last_seq) {
                s if s.is_empty() => request.since.clone(),
                s => s,
            };
            let docs = self.fetch_leaves(&collection, &body.results).await?;
            Ok(ChangesPage { docs, last_seq })
        })
    }

    fn bulk_write(&self, collection: &str, docs: Vec<WireDocument>) -> BoxFuture<'_, usize> {
        let collection = collection.to_string();
        Box::pin(async move {
            if docs.is_empty() {
                return Ok(0);
            }
            let total = docs.len();
            let url = self.url(&collection, "_bulk_docs")?;
            let builder = self
                .request(Method::POST, url, self.request_timeout)
                .json(&json!({ "docs": docs, "new_edits": false }));
            let response = self.send(&collection, "bulk_docs", builder).await?;
            let response = Self::check(&collection, "bulk_docs", response).await?;
            let results: Vec<BulkDocsResult> = Self::decode("bulk_docs", response).await?;

            let mut rejected = 0;
            for r in results.iter().filter(|r| r.error.is_some()) {
                rejected += 1;
                debug!(
                    collection = %collection,
                    id = %r.id,
                    error = r.error.as_deref().unwrap_or_default(),
                    reason = r.reason.as_deref().unwrap_or_default(),
                    "Remote rejected document"
                );
            }
            Ok(total.saturating_sub(rejected))
        })
    }
}

/// Default connector: one [`HttpRemote`] per sync configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl RemoteConnector for HttpConnector {
    fn connect(&self, sync: &SyncConfig, settings: &SupervisorSettings) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(HttpRemote::new(sync, settings.request_timeout_duration())?))
    }
}
