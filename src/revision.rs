// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision tokens.
//!
//! A revision is `"{generation}-{hash}"`. The generation increments on every
//! write; the hash is the first 16 bytes (hex) of SHA-256 over the parent
//! revision and the canonical JSON body. The format is compatible with the
//! remote endpoint's own `_rev` tokens, so revisions round-trip unchanged.
//!
//! # Ordering
//!
//! Revisions are totally ordered by `(generation, hash)`. When two stations
//! edit the same document concurrently, both sides pick the greater revision
//! as the winner, so replicas converge without coordination:
//!
//! ```text
//! 2-3f..  ─┐
//!          ├─ concurrent edits of 1-a0..
//! 2-9c..  ─┘  winner = 2-9c.. (same generation, larger hash)
//! ```

use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Revision histories are trimmed to this many entries (newest first).
pub const MAX_HISTORY: usize = 100;

/// An opaque-but-ordered revision token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    /// Derive the revision that follows `parent` for the given body.
    pub fn next(parent: Option<&Revision>, body: &serde_json::Value, deleted: bool) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(if deleted { b"1" } else { b"0" });
        // serde_json::Value maps are sorted, so this is canonical.
        hasher.update(body.to_string().as_bytes());
        let digest = hasher.finalize();

        Self {
            generation: parent.map(|p| p.generation + 1).unwrap_or(1),
            hash: hex::encode(&digest[..16]),
        }
    }

    pub fn from_parts(generation: u64, hash: impl Into<String>) -> Result<Self, LedgerError> {
        let hash = hash.into();
        if generation == 0 {
            return Err(LedgerError::DataIntegrity("revision generation must be >= 1".into()));
        }
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(LedgerError::DataIntegrity(format!("invalid revision hash '{}'", hash)));
        }
        Ok(Self { generation, hash })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| LedgerError::DataIntegrity(format!("malformed revision '{}'", s)))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| LedgerError::DataIntegrity(format!("malformed revision '{}'", s)))?;
        Self::from_parts(generation, hash)
    }
}

impl TryFrom<String> for Revision {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

/// Revision history in the remote's compact form: `start` is the newest
/// generation and `ids` are the hashes, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionPath {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionPath {
    /// Compact a newest-first history.
    pub fn from_history(history: &[Revision]) -> Option<Self> {
        let first = history.first()?;
        Some(Self {
            start: first.generation,
            ids: history.iter().map(|r| r.hash.clone()).collect(),
        })
    }

    /// Expand back into newest-first revisions. Malformed entries are dropped.
    pub fn to_history(&self) -> Vec<Revision> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, hash)| {
                let generation = self.start.checked_sub(i as u64)?;
                Revision::from_parts(generation, hash.clone()).ok()
            })
            .collect()
    }
}

/// Prepend `rev` to a newest-first history, trimming to [`MAX_HISTORY`].
pub fn extend_history(history: &[Revision], rev: &Revision) -> Vec<Revision> {
    let mut out = Vec::with_capacity((history.len() + 1).min(MAX_HISTORY));
    out.push(rev.clone());
    out.extend(history.iter().take(MAX_HISTORY - 1).cloned());
    out
}
