// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote aggregation endpoint.
//!
//! The remote speaks a CouchDB-compatible document API: per-collection
//! info, a change feed with optional long-poll, and bulk writes that keep
//! the sender's revision ids (`new_edits: false`).
//!
//! # Example
//!
//! ```rust,no_run
//! use gate_ledger::remote::{BoxFuture, ChangesPage, ChangesRequest, RemoteInfo, RemoteStore, WireDocument};
//!
//! struct Blackhole;
//!
//! impl RemoteStore for Blackhole {
//!     fn info(&self, _collection: &str) -> BoxFuture<'_, RemoteInfo> {
//!         Box::pin(async { Ok(RemoteInfo::default()) })
//!     }
//!
//!     fn changes(&self, _collection: &str, request: ChangesRequest) -> BoxFuture<'_, ChangesPage> {
//!         Box::pin(async move { Ok(ChangesPage { docs: vec![], last_seq: request.since }) })
//!     }
//!
//!     fn bulk_write(&self, _collection: &str, docs: Vec<WireDocument>) -> BoxFuture<'_, usize> {
//!         Box::pin(async move { Ok(docs.len()) })
//!     }
//! }
//! ```

pub mod http;
pub mod memory;

pub use http::{HttpConnector, HttpRemote};
pub use memory::InMemoryRemote;

use crate::config::SupervisorSettings;
use crate::document::{DocBody, DocKind, SyncConfig};
use crate::error::{LedgerError, Result};
use crate::ledger::RevisionRecord;
use crate::revision::{Revision, RevisionPath};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A document as the remote stores it: envelope fields plus business fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: Revision,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionPath>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl WireDocument {
    /// Newest-first ancestry, always starting with `rev`.
    pub fn history(&self) -> Vec<Revision> {
        match &self.revisions {
            Some(path) => {
                let history = path.to_history();
                if history.first() == Some(&self.rev) {
                    history
                } else {
                    vec![self.rev.clone()]
                }
            }
            None => vec![self.rev.clone()],
        }
    }

    /// Kind from the `type` field, falling back to the id prefix for tombstones.
    pub fn kind(&self) -> Option<DocKind> {
        self.fields
            .get("type")
            .and_then(Value::as_str)
            .and_then(DocKind::from_type_tag)
            .or_else(|| DocKind::from_id(&self.id))
    }

    /// Decode into a ledger record. Fields starting with `_` are remote
    /// metadata and are not part of the body.
    pub fn into_record(self) -> Result<RevisionRecord> {
        let history = self.history();
        let body = if self.deleted {
            None
        } else {
            let fields: Map<String, Value> = self
                .fields
                .into_iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .collect();
            let body: DocBody = serde_json::from_value(Value::Object(fields))
                .map_err(|e| LedgerError::DataIntegrity(format!("undecodable remote document {}: {}", self.id, e)))?;
            Some(body)
        };
        Ok(RevisionRecord {
            id: self.id,
            rev: self.rev,
            history,
            deleted: self.deleted,
            body,
        })
    }

    pub fn from_record(record: &RevisionRecord) -> Result<Self> {
        let fields = match &record.body {
            Some(body) if !record.deleted => match serde_json::to_value(body)? {
                Value::Object(map) => map,
                other => {
                    return Err(LedgerError::DataIntegrity(format!(
                        "{} encodes to a non-object: {}",
                        record.id, other
                    )))
                }
            },
            _ => Map::new(),
        };
        Ok(Self {
            id: record.id.clone(),
            rev: record.rev.clone(),
            deleted: record.deleted,
            revisions: RevisionPath::from_history(&record.history),
            fields,
        })
    }
}

/// Collection summary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteInfo {
    pub doc_count: u64,
    /// Opaque current sequence.
    pub update_seq: String,
}

/// One change-feed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesRequest {
    /// Opaque sequence from a previous page; empty for the beginning.
    pub since: String,
    pub limit: usize,
    /// Wait up to this long for a change when none is pending.
    pub longpoll: Option<Duration>,
}

/// Leaf revisions changed after `since`, with ancestry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangesPage {
    pub docs: Vec<WireDocument>,
    pub last_seq: String,
}

/// The remote's document API, per collection.
pub trait RemoteStore: Send + Sync + 'static {
    /// Collection info. Creates the collection when it does not exist.
    fn info(&self, collection: &str) -> BoxFuture<'_, RemoteInfo>;

    /// Changes after `request.since`, every leaf revision included.
    fn changes(&self, collection: &str, request: ChangesRequest) -> BoxFuture<'_, ChangesPage>;

    /// Store revisions as given (no new revision ids). Returns how many the
    /// remote accepted.
    fn bulk_write(&self, collection: &str, docs: Vec<WireDocument>) -> BoxFuture<'_, usize>;
}

/// Builds a [`RemoteStore`] from the station's sync settings.
pub trait RemoteConnector: Send + Sync + 'static {
    fn connect(&self, sync: &SyncConfig, settings: &SupervisorSettings) -> Result<Arc<dyn RemoteStore>>;
}
