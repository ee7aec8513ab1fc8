// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exit processor: closes an OPEN transaction at most once.
//!
//! # Flow
//!
//! ```text
//! identifier ──► find_open_transaction ──► snapshot tariff + member
//!                 (id / barcode / plate)        │
//!                                               ▼
//!                                compute_fee(entry, tariff, member, now)
//!                                               │
//!                                               ▼
//!                writer.update(id, |doc| { status == OPEN else AlreadyClosed; close })
//! ```
//!
//! The fee is computed once, before the optimistic loop, from a single
//! clock read. Inside the loop only the OPEN check and the close run, so a
//! retry after a lost race sees the winner's CLOSED status and stops with
//! `AlreadyClosed` instead of charging twice.

use crate::clock::Clock;
use crate::document::{normalize_plate, DocBody, DocKind, Document, ExitDetails, Transaction, TransactionStatus};
use crate::error::{LedgerError, Result};
use crate::fee::{compute_fee, FeeBasis, FeePolicy, FeeQuote};
use crate::ledger::{FindQuery, Ledger};
use crate::writer::ConflictSafeWriter;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A scanned exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    /// Ticket barcode, transaction id or plate.
    pub identifier: String,
    pub operator_id: String,
    pub gate_id: String,
    /// Reference to the exit snapshot captured by the UI.
    pub exit_image: Option<String>,
}

/// Result of a successful exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitReceipt {
    pub transaction: Transaction,
    pub fee: FeeQuote,
}

/// A vehicle arriving at an entry gate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryRequest {
    pub plate: String,
    pub vehicle_type: String,
    pub gate_id: String,
    pub operator_id: String,
    pub entry_fee: u64,
    pub barcode: Option<String>,
    pub entry_image: Option<String>,
}

/// Exits and revenue for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitStats {
    pub total_exits: u64,
    pub total_revenue: u64,
}

#[derive(Clone)]
pub struct ExitProcessor {
    ledger: Ledger,
    writer: ConflictSafeWriter,
    clock: Arc<dyn Clock>,
    policy: FeePolicy,
}

impl ExitProcessor {
    pub fn new(writer: ConflictSafeWriter, clock: Arc<dyn Clock>, policy: FeePolicy) -> Self {
        Self {
            ledger: writer.ledger().clone(),
            writer,
            clock,
            policy,
        }
    }

    /// Locate the OPEN stay for a scanned identifier.
    ///
    /// Tries the transaction id first, then the barcode alias, then the
    /// normalized plate. With several open stays for one plate, the latest
    /// entry wins.
    pub async fn find_open_transaction(&self, identifier: &str) -> Result<Option<Document>> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Ok(None);
        }

        let direct_id = if DocKind::from_id(identifier) == Some(DocKind::Transaction) {
            identifier.to_string()
        } else {
            DocKind::Transaction.doc_id(identifier)
        };
        if let Some(doc) = self.ledger.get(&direct_id).await? {
            if doc.as_transaction().map(Transaction::is_open).unwrap_or(false) {
                return Ok(Some(doc));
            }
        }

        let ticket = identifier.to_string();
        let by_ticket = self
            .latest_open(move |t| t.matches_ticket(&ticket))
            .await?;
        if by_ticket.is_some() {
            return Ok(by_ticket);
        }

        let plate = normalize_plate(identifier);
        self.latest_open(move |t| normalize_plate(&t.plate) == plate).await
    }

    async fn latest_open<P>(&self, predicate: P) -> Result<Option<Document>>
    where
        P: Fn(&Transaction) -> bool + Send + Sync + 'static,
    {
        let mut found = self
            .ledger
            .find(
                FindQuery::kind(DocKind::Transaction)
                    .filter(move |d| d.as_transaction().map(|t| t.is_open() && predicate(t)).unwrap_or(false))
                    .sort_by(|a, b| entry_time(b).cmp(&entry_time(a)))
                    .limit(1),
            )
            .await?;
        Ok(found.pop())
    }

    /// Close the OPEN transaction matching `identifier`.
    pub async fn process_exit(&self, identifier: &str, operator_id: &str, gate_id: &str) -> Result<ExitReceipt> {
        self.process_exit_with(ExitRequest {
            identifier: identifier.to_string(),
            operator_id: operator_id.to_string(),
            gate_id: gate_id.to_string(),
            exit_image: None,
        })
        .await
    }

    pub async fn process_exit_with(&self, request: ExitRequest) -> Result<ExitReceipt> {
        let Some(doc) = self.find_open_transaction(&request.identifier).await? else {
            crate::metrics::record_exit_rejected("no_open_transaction");
            info!(identifier = %request.identifier, gate_id = %request.gate_id, "No open transaction");
            return Err(LedgerError::NoOpenTransaction {
                identifier: request.identifier,
            });
        };
        let Some(open) = doc.as_transaction() else {
            return Err(LedgerError::Internal(format!("{} is not a transaction", doc.id)));
        };

        let now = self.clock.now();
        let tariff_doc = self.ledger.get(&DocKind::Tariff.doc_id(&open.vehicle_type)).await?;
        let member_doc = self.ledger.get(&DocKind::Member.doc_id(&normalize_plate(&open.plate))).await?;
        let fee = compute_fee(
            open.entry_time,
            tariff_doc.as_ref().and_then(Document::as_tariff),
            member_doc.as_ref().and_then(Document::as_member),
            now,
            &self.policy,
        );
        if fee.basis == FeeBasis::Default {
            warn!(
                transaction_id = %open.transaction_id,
                vehicle_type = %open.vehicle_type,
                default_fee = fee.amount,
                "No tariff for vehicle type, charging default fee"
            );
            crate::metrics::record_fee_default(&open.vehicle_type);
        }

        let exit = ExitDetails {
            time: now,
            gate: request.gate_id.clone(),
            operator: request.operator_id.clone(),
            fee: fee.amount,
            image: request.exit_image.clone(),
        };

        let result = self
            .writer
            .update(&doc.id, None, |current| match current.as_transaction_mut() {
                Some(tx) => tx.close(exit.clone()),
                None => Err(LedgerError::DataIntegrity(format!("{} is not a transaction", doc.id))),
            })
            .await;

        let closed = match result {
            Ok(closed) => closed,
            Err(e @ LedgerError::AlreadyClosed { .. }) => {
                crate::metrics::record_exit_rejected("already_closed");
                info!(id = %doc.id, gate_id = %request.gate_id, "Exit lost race, transaction already closed");
                return Err(e);
            }
            Err(LedgerError::NotFound(_)) => {
                crate::metrics::record_exit_rejected("no_open_transaction");
                return Err(LedgerError::NoOpenTransaction {
                    identifier: request.identifier,
                });
            }
            Err(e) => {
                crate::metrics::record_exit_rejected("error");
                return Err(e);
            }
        };

        let DocBody::Transaction(transaction) = closed.body else {
            return Err(LedgerError::Internal(format!("{} changed kind", closed.id)));
        };

        info!(
            transaction_id = %transaction.transaction_id,
            plate = %transaction.plate,
            gate_id = %request.gate_id,
            fee = fee.amount,
            basis = %fee.basis,
            hours = fee.billed_hours,
            "Exit processed"
        );
        crate::metrics::record_exit_processed(&request.gate_id, fee.amount);

        Ok(ExitReceipt { transaction, fee })
    }

    /// Create the OPEN transaction for a vehicle entering.
    pub async fn record_entry(&self, request: EntryRequest) -> Result<Transaction> {
        let plate = normalize_plate(&request.plate);
        if plate.is_empty() {
            return Err(LedgerError::DataIntegrity("entry without a plate".into()));
        }
        let now = self.clock.now();
        let transaction = Transaction {
            transaction_id: Uuid::new_v4().to_string(),
            plate,
            vehicle_type: request.vehicle_type,
            entry_time: now,
            entry_gate: request.gate_id,
            entry_operator: request.operator_id,
            entry_fee: request.entry_fee,
            exit_time: None,
            exit_gate: None,
            exit_operator: None,
            exit_fee: None,
            status: TransactionStatus::Open,
            barcode: request.barcode,
            entry_image: request.entry_image,
            exit_image: None,
            created_at: now,
            updated_at: now,
        };

        self.writer.create(DocBody::Transaction(transaction.clone())).await?;
        info!(transaction_id = %transaction.transaction_id, plate = %transaction.plate, "Entry recorded");
        crate::metrics::record_entry_recorded(&transaction.entry_gate);
        Ok(transaction)
    }

    /// Exits closed on `day` (UTC) and the revenue they brought in.
    pub async fn exit_stats(&self, day: NaiveDate) -> Result<ExitStats> {
        let closed = self
            .ledger
            .find(FindQuery::kind(DocKind::Transaction).filter(move |d| {
                d.as_transaction()
                    .and_then(|t| t.exit_time.filter(|_| t.status == TransactionStatus::Closed))
                    .map(|exit| exit.date_naive() == day)
                    .unwrap_or(false)
            }))
            .await?;

        Ok(closed
            .iter()
            .filter_map(Document::as_transaction)
            .fold(ExitStats::default(), |mut stats, t| {
                stats.total_exits += 1;
                stats.total_revenue += t.exit_fee.unwrap_or(0);
                stats
            }))
    }
}

fn entry_time(doc: &Document) -> Option<chrono::DateTime<chrono::Utc>> {
    doc.as_transaction().map(|t| t.entry_time)
}
