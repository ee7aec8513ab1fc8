// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live change feed over the ledger's change log.
//!
//! ```text
//!   put/remove/merge ──► changes table (seq) ──► broadcast ChangeNotice
//!                                                  │
//!   ChangeFeed::next():  drain rows after `since` ◄┘ wait for notice / cancel
//! ```
//!
//! The feed subscribes to the broadcast *before* reading the backlog, so a
//! write landing between the two is never missed. A lagged receiver is
//! harmless: the next read goes back to the table.

use super::Ledger;
use crate::document::{DocKind, Document};
use crate::error::Result;
use crate::revision::Revision;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

const FEED_BATCH: i64 = 100;

/// Where a change came from. Replicated changes are never pushed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    Local,
    Replicated,
}

impl ChangeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOrigin::Local => "local",
            ChangeOrigin::Replicated => "replicated",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ChangeOrigin::Local),
            "replicated" => Some(ChangeOrigin::Replicated),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lightweight broadcast sent after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub seq: i64,
    pub id: String,
    pub kind: DocKind,
    pub origin: ChangeOrigin,
}

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    pub seq: i64,
    pub id: String,
    pub rev: Revision,
    pub kind: DocKind,
    pub deleted: bool,
    pub origin: ChangeOrigin,
}

/// A change with the document as it reads now (`None` = tombstone).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub seq: i64,
    pub id: String,
    pub rev: Revision,
    pub kind: DocKind,
    pub origin: ChangeOrigin,
    pub doc: Option<Document>,
}

/// Handle that ends a [`ChangeFeed`] from another task.
#[derive(Debug, Clone)]
pub struct FeedCanceller {
    tx: Arc<watch::Sender<bool>>,
}

impl FeedCanceller {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Live, cancelable sequence of [`ChangeEvent`]s.
pub struct ChangeFeed {
    ledger: Ledger,
    since: i64,
    buffer: VecDeque<ChangeEvent>,
    notices: broadcast::Receiver<ChangeNotice>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl ChangeFeed {
    pub(crate) fn new(ledger: Ledger, since: i64) -> Self {
        let notices = ledger.subscribe();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            ledger,
            since,
            buffer: VecDeque::new(),
            notices,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn canceller(&self) -> FeedCanceller {
        FeedCanceller {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Sequence of the last event handed out.
    pub fn position(&self) -> i64 {
        self.since
    }

    /// Next change, waiting if none is pending. `None` once cancelled.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            if *self.cancel_rx.borrow() {
                return None;
            }

            if let Some(event) = self.buffer.pop_front() {
                self.since = event.seq;
                return Some(Ok(event));
            }

            match self.ledger.changes_since(self.since, FEED_BATCH).await {
                Ok(batch) if !batch.is_empty() => {
                    self.buffer.extend(batch);
                    continue;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }

            tokio::select! {
                biased;

                changed = self.cancel_rx.changed() => {
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        return None;
                    }
                }

                notice = self.notices.recv() => {
                    match notice {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        }
    }
}
