// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Kind-scoped queries.
//!
//! A query is a range scan over one kind's id namespace followed by an
//! in-process predicate, sort and limit. There are no secondary indexes; the
//! per-kind document counts a gate station holds keep this cheap.

use crate::document::{DocKind, Document};
use std::cmp::Ordering;

type Predicate = Box<dyn Fn(&Document) -> bool + Send + Sync>;
type Comparator = Box<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

pub struct FindQuery {
    pub(crate) kind: DocKind,
    filter: Option<Predicate>,
    sort: Option<Comparator>,
    limit: Option<usize>,
}

impl FindQuery {
    pub fn kind(kind: DocKind) -> Self {
        Self {
            kind,
            filter: None,
            sort: None,
            limit: None,
        }
    }

    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(f));
        self
    }

    pub fn sort_by<F>(mut self, f: F) -> Self
    where
        F: Fn(&Document, &Document) -> Ordering + Send + Sync + 'static,
    {
        self.sort = Some(Box::new(f));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Inclusive lower / exclusive upper id bounds for the kind's namespace.
    pub(crate) fn id_range(&self) -> (String, String) {
        let prefix = self.kind.id_prefix();
        (prefix.to_string(), format!("{}\u{fff0}", prefix))
    }

    /// Apply predicate, sort and limit to scanned documents.
    pub(crate) fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut out: Vec<Document> = match &self.filter {
            Some(f) => docs.into_iter().filter(|d| f(d)).collect(),
            None => docs,
        };
        if let Some(cmp) = &self.sort {
            out.sort_by(|a, b| cmp(a, b));
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

impl std::fmt::Debug for FindQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindQuery")
            .field("kind", &self.kind)
            .field("filter", &self.filter.is_some())
            .field("sort", &self.sort.is_some())
            .field("limit", &self.limit)
            .finish()
    }
}
