// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict-safe writer: the only mutation path for multi-writer documents.
//!
//! ```text
//! attempt n:  get(id) ──► mutator(&mut doc) ──► put(doc) ──► Ok(new doc)
//!                 ▲                               │
//!                 └──── Conflict, jittered sleep ─┘   (n < max_attempts)
//!
//! exhausted:  UpdateConflict { id, attempts }
//! mutator Err (e.g. AlreadyClosed): returned as-is, no retry
//! ```
//!
//! Every attempt starts from a fresh read, so a mutator that checks a
//! precondition (such as "status is OPEN") re-checks it against the state
//! that actually won the race.

use crate::clock::Clock;
use crate::document::{DocBody, Document};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::resilience::ConflictRetry;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ConflictSafeWriter {
    ledger: Ledger,
    retry: ConflictRetry,
    clock: Arc<dyn Clock>,
}

impl ConflictSafeWriter {
    pub fn new(ledger: Ledger, retry: ConflictRetry, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, retry, clock }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Read-modify-write `id` with optimistic retry.
    ///
    /// When `id` does not exist, `default` supplies the initial body (and
    /// `NotFound` is returned when there is no default). The mutator may be
    /// called more than once; it must be a pure function of the document it
    /// is given. Returns the stored document with its new revision.
    pub async fn update<F>(&self, id: &str, default: Option<DocBody>, mutator: F) -> Result<Document>
    where
        F: Fn(&mut Document) -> Result<()>,
    {
        let mutator = &mutator;
        let default = &default;
        self.retry
            .run(id, move |attempt| async move {
                let mut doc = match self.ledger.get(id).await? {
                    Some(doc) => doc,
                    None => match default {
                        Some(body) => Document {
                            id: id.to_string(),
                            rev: None,
                            body: body.clone(),
                        },
                        None => return Err(LedgerError::NotFound(id.to_string())),
                    },
                };

                let kind = doc.kind();
                mutator(&mut doc)?;
                if doc.id != id || doc.kind() != kind {
                    return Err(LedgerError::DataIntegrity(format!(
                        "mutator changed identity of {}",
                        id
                    )));
                }
                doc.body.touch(self.clock.now());

                let rev = self.ledger.put(&doc).await?;
                debug!(id = %id, rev = %rev, attempt, "Update committed");
                doc.rev = Some(rev);
                Ok(doc)
            })
            .await
    }

    /// Insert a brand new document. Fails with `Conflict` if the id exists.
    pub async fn create(&self, body: DocBody) -> Result<Document> {
        let mut doc = Document::new(body);
        let rev = self.ledger.put(&doc).await?;
        doc.rev = Some(rev);
        Ok(doc)
    }

    /// Replace the body of `id` wholesale, creating it if absent.
    pub async fn upsert(&self, body: DocBody) -> Result<Document> {
        let id = body.doc_id();
        self.update(&id, Some(body.clone()), move |doc| {
            doc.body = body.clone();
            Ok(())
        })
        .await
    }
}
