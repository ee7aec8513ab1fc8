// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document model.
//!
//! Every stored document is an envelope (`_id`, `_rev`) around a tagged
//! body. The `type` field on the wire selects the [`DocBody`] variant, and
//! ids are namespaced by kind so a prefix range scan finds all documents of
//! one kind:
//!
//! ```text
//! transaction_<business id>   type = "parking_transaction"
//! tariff_<vehicle type>       type = "tariff"
//! member_<plate>              type = "member"
//! settings_gate               type = "gate_settings"   (station-local)
//! ```
//!
//! # Transaction lifecycle
//!
//! ```text
//!   record_entry ──► OPEN ──(process_exit, exactly once)──► CLOSED
//! ```
//!
//! Exit fields are all-or-nothing: an OPEN transaction has none of them, a
//! CLOSED one has all of them and `exit_time >= entry_time`.
//! [`Transaction::validate`] enforces this and the ledger refuses to store
//! a transaction that fails it.

use crate::error::{LedgerError, Result};
use crate::revision::Revision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Id of the singleton gate settings document.
pub const SETTINGS_ID: &str = "settings_gate";

// =============================================================================
// Kinds
// =============================================================================

/// Document kind. Fixed set; no user-defined kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    Transaction,
    Tariff,
    Member,
    Settings,
}

impl DocKind {
    pub const ALL: [DocKind; 4] = [
        DocKind::Transaction,
        DocKind::Tariff,
        DocKind::Member,
        DocKind::Settings,
    ];

    /// The wire `type` discriminator.
    pub fn type_tag(&self) -> &'static str {
        match self {
            DocKind::Transaction => "parking_transaction",
            DocKind::Tariff => "tariff",
            DocKind::Member => "member",
            DocKind::Settings => "gate_settings",
        }
    }

    pub fn id_prefix(&self) -> &'static str {
        match self {
            DocKind::Transaction => "transaction_",
            DocKind::Tariff => "tariff_",
            DocKind::Member => "member_",
            DocKind::Settings => "settings_",
        }
    }

    pub fn from_type_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_tag() == tag)
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| id.starts_with(k.id_prefix()))
    }

    /// Build a namespaced id from a business key.
    pub fn doc_id(&self, key: &str) -> String {
        format!("{}{}", self.id_prefix(), key)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Transaction => "transaction",
            DocKind::Tariff => "tariff",
            DocKind::Member => "member",
            DocKind::Settings => "settings",
        }
    }
}

impl fmt::Display for DocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plates are compared upper-case with all whitespace removed.
pub fn normalize_plate(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

// =============================================================================
// Envelope
// =============================================================================

/// A stored document: id, current revision and typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,

    /// `None` for a document that has never been stored.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(flatten)]
    pub body: DocBody,
}

impl Document {
    /// A new, never-stored document. The id is derived from the body.
    pub fn new(body: DocBody) -> Self {
        Self {
            id: body.doc_id(),
            rev: None,
            body,
        }
    }

    pub fn kind(&self) -> DocKind {
        self.body.kind()
    }

    pub fn as_transaction(&self) -> Option<&Transaction> {
        match &self.body {
            DocBody::Transaction(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_transaction_mut(&mut self) -> Option<&mut Transaction> {
        match &mut self.body {
            DocBody::Transaction(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tariff(&self) -> Option<&Tariff> {
        match &self.body {
            DocBody::Tariff(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_member(&self) -> Option<&Member> {
        match &self.body {
            DocBody::Member(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_settings(&self) -> Option<&GateSettings> {
        match &self.body {
            DocBody::Settings(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_settings_mut(&mut self) -> Option<&mut GateSettings> {
        match &mut self.body {
            DocBody::Settings(s) => Some(s),
            _ => None,
        }
    }
}

/// Tagged document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocBody {
    #[serde(rename = "parking_transaction")]
    Transaction(Transaction),
    #[serde(rename = "tariff")]
    Tariff(Tariff),
    #[serde(rename = "member")]
    Member(Member),
    #[serde(rename = "gate_settings")]
    Settings(GateSettings),
}

impl DocBody {
    pub fn kind(&self) -> DocKind {
        match self {
            DocBody::Transaction(_) => DocKind::Transaction,
            DocBody::Tariff(_) => DocKind::Tariff,
            DocBody::Member(_) => DocKind::Member,
            DocBody::Settings(_) => DocKind::Settings,
        }
    }

    /// Namespaced id derived from the body's business key.
    pub fn doc_id(&self) -> String {
        match self {
            DocBody::Transaction(t) => DocKind::Transaction.doc_id(&t.transaction_id),
            DocBody::Tariff(t) => DocKind::Tariff.doc_id(&t.vehicle_type),
            DocBody::Member(m) => DocKind::Member.doc_id(&normalize_plate(&m.plate)),
            DocBody::Settings(_) => SETTINGS_ID.to_string(),
        }
    }

    /// Check kind-specific invariants before a write.
    pub fn validate(&self) -> Result<()> {
        match self {
            DocBody::Transaction(t) => t.validate(),
            DocBody::Tariff(t) => t.validate(),
            DocBody::Member(_) | DocBody::Settings(_) => Ok(()),
        }
    }

    /// Stamp `updated_at` on kinds that carry it.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        match self {
            DocBody::Transaction(t) => t.updated_at = now,
            DocBody::Settings(s) => s.updated_at = now,
            DocBody::Tariff(_) | DocBody::Member(_) => {}
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Open,
    Closed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Open => write!(f, "OPEN"),
            TransactionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// One vehicle stay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Business id; printed on the ticket and stable from entry to exit.
    pub transaction_id: String,
    pub plate: String,
    pub vehicle_type: String,
    pub entry_time: DateTime<Utc>,
    pub entry_gate: String,
    pub entry_operator: String,
    /// Prepaid amount at entry (0 for postpaid).
    #[serde(default)]
    pub entry_fee: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_gate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_fee: Option<u64>,

    pub status: TransactionStatus,

    /// Alternate barcode printed on some tickets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_image: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written by a successful exit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDetails {
    pub time: DateTime<Utc>,
    pub gate: String,
    pub operator: String,
    pub fee: u64,
    pub image: Option<String>,
}

impl Transaction {
    pub fn is_open(&self) -> bool {
        self.status == TransactionStatus::Open
    }

    /// Enforce the all-or-nothing exit invariant.
    pub fn validate(&self) -> Result<()> {
        let exit_fields = [
            self.exit_time.is_some(),
            self.exit_gate.is_some(),
            self.exit_operator.is_some(),
            self.exit_fee.is_some(),
        ];

        match self.status {
            TransactionStatus::Open => {
                if exit_fields.iter().any(|set| *set) {
                    return Err(LedgerError::DataIntegrity(format!(
                        "transaction {} is OPEN but has exit fields",
                        self.transaction_id
                    )));
                }
            }
            TransactionStatus::Closed => {
                if !exit_fields.iter().all(|set| *set) {
                    return Err(LedgerError::DataIntegrity(format!(
                        "transaction {} is CLOSED with missing exit fields",
                        self.transaction_id
                    )));
                }
                if let Some(exit_time) = self.exit_time {
                    if exit_time < self.entry_time {
                        return Err(LedgerError::DataIntegrity(format!(
                            "transaction {} exits before it entered",
                            self.transaction_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Close an OPEN transaction. Fails with `AlreadyClosed` otherwise.
    ///
    /// The exit time is clamped to the entry time so clock skew between
    /// stations can never produce a negative stay.
    pub fn close(&mut self, exit: ExitDetails) -> Result<()> {
        if !self.is_open() {
            return Err(LedgerError::AlreadyClosed {
                transaction_id: self.transaction_id.clone(),
            });
        }
        self.exit_time = Some(exit.time.max(self.entry_time));
        self.exit_gate = Some(exit.gate);
        self.exit_operator = Some(exit.operator);
        self.exit_fee = Some(exit.fee);
        if exit.image.is_some() {
            self.exit_image = exit.image;
        }
        self.status = TransactionStatus::Closed;
        Ok(())
    }

    /// Does `identifier` name this stay (business id, document id or barcode)?
    pub fn matches_ticket(&self, identifier: &str) -> bool {
        self.transaction_id == identifier
            || DocKind::Transaction.doc_id(&self.transaction_id) == identifier
            || self.barcode.as_deref() == Some(identifier)
    }
}

// =============================================================================
// Tariff / Member
// =============================================================================

/// Fee schedule for one vehicle type. Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub vehicle_type: String,
    /// Charged for the first `base_duration_minutes`.
    pub base_rate: u64,
    pub base_duration_minutes: u32,
    /// Charged per started `increment_minutes` beyond the base period.
    pub increment_rate: u64,
    pub increment_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_maximum: Option<u64>,
    /// Hourly flat rate for members without their own rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_rate: Option<u64>,
}

impl Tariff {
    pub fn validate(&self) -> Result<()> {
        if self.increment_minutes == 0 {
            return Err(LedgerError::DataIntegrity(format!(
                "tariff {} has a zero increment",
                self.vehicle_type
            )));
        }
        Ok(())
    }
}

/// Membership (season pass) for a plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub plate: String,
    #[serde(default)]
    pub name: String,
    /// Flat hourly rate; may be 0 for free parking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flat_rate: Option<u64>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl Member {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.valid_from.map_or(true, |from| from <= now)
            && self.valid_until.map_or(true, |until| until >= now)
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Replication target and schedule, editable at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote, without a database name.
    #[serde(default)]
    pub remote_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub auto_sync: bool,
    /// Live channels when true, timer-driven passes when false.
    #[serde(default = "default_continuous")]
    pub continuous: bool,
    /// Minutes between periodic passes.
    #[serde(default = "default_sync_interval_min")]
    pub sync_interval_min: u64,
    /// Retries for one failing periodic pass.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_continuous() -> bool {
    true
}

fn default_sync_interval_min() -> u64 {
    15
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            username: None,
            password: None,
            auto_sync: false,
            continuous: default_continuous(),
            sync_interval_min: default_sync_interval_min(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

impl SyncConfig {
    /// Replication runs only with auto-sync on and a remote configured.
    pub fn is_enabled(&self) -> bool {
        self.auto_sync && !self.remote_url.trim().is_empty()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_min.max(1) * 60)
    }
}

/// Station-local gate settings (`settings_gate`). Never replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    /// Seconds before an opened gate closes on its own.
    #[serde(default = "default_gate_timeout_sec")]
    pub gate_timeout_sec: u64,
    #[serde(default = "default_open_gate_on_exit")]
    pub open_gate_on_exit: bool,
    #[serde(default)]
    pub sync: SyncConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_gate_timeout_sec() -> u64 {
    10
}

fn default_open_gate_on_exit() -> bool {
    true
}

impl GateSettings {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            gate_timeout_sec: default_gate_timeout_sec(),
            open_gate_on_exit: default_open_gate_on_exit(),
            sync: SyncConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_sec)
    }

    /// Apply a partial update. Returns true when the sync target changed.
    pub fn apply(&mut self, patch: &SettingsPatch) -> bool {
        if let Some(t) = patch.gate_timeout_sec {
            self.gate_timeout_sec = t;
        }
        if let Some(open) = patch.open_gate_on_exit {
            self.open_gate_on_exit = open;
        }
        match &patch.sync {
            Some(sync) if *sync != self.sync => {
                self.sync = sync.clone();
                true
            }
            _ => false,
        }
    }
}

/// Partial settings update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub gate_timeout_sec: Option<u64>,
    #[serde(default)]
    pub open_gate_on_exit: Option<bool>,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn open_tx() -> Transaction {
        Transaction {
            transaction_id: "T1".into(),
            plate: "B1234XYZ".into(),
            vehicle_type: "car".into(),
            entry_time: t0(),
            entry_gate: "entry-1".into(),
            entry_operator: "op0".into(),
            entry_fee: 0,
            exit_time: None,
            exit_gate: None,
            exit_operator: None,
            exit_fee: None,
            status: TransactionStatus::Open,
            barcode: Some("BC-001".into()),
            entry_image: None,
            exit_image: None,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    #[test]
    fn test_kind_prefixes_and_tags() {
        for kind in DocKind::ALL {
            assert_eq!(DocKind::from_type_tag(kind.type_tag()), Some(kind));
            assert_eq!(DocKind::from_id(&kind.doc_id("x")), Some(kind));
        }
        assert_eq!(DocKind::from_id("unrelated"), None);
        assert_eq!(DocKind::Transaction.doc_id("T1"), "transaction_T1");
    }

    #[test]
    fn test_normalize_plate() {
        assert_eq!(normalize_plate(" b 1234 xyz "), "B1234XYZ");
        assert_eq!(normalize_plate("B1234XYZ"), "B1234XYZ");
    }

    #[test]
    fn test_document_serializes_type_tag() {
        let doc = Document::new(DocBody::Transaction(open_tx()));
        assert_eq!(doc.id, "transaction_T1");

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_id"], "transaction_T1");
        assert_eq!(value["type"], "parking_transaction");
        assert_eq!(value["status"], "OPEN");
        assert!(value.get("_rev").is_none());
        assert!(value.get("exit_time").is_none());

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = serde_json::json!({"_id": "x_1", "type": "invoice", "amount": 1});
        assert!(serde_json::from_value::<Document>(json).is_err());
    }

    #[test]
    fn test_open_with_exit_fields_is_invalid() {
        let mut tx = open_tx();
        tx.exit_fee = Some(1000);
        assert!(matches!(tx.validate(), Err(LedgerError::DataIntegrity(_))));
    }

    #[test]
    fn test_close_sets_all_exit_fields() {
        let mut tx = open_tx();
        tx.close(ExitDetails {
            time: t0() + ChronoDuration::hours(2),
            gate: "gate1".into(),
            operator: "op1".into(),
            fee: 8000,
            image: Some("exit.jpg".into()),
        })
        .unwrap();

        assert_eq!(tx.status, TransactionStatus::Closed);
        assert_eq!(tx.exit_fee, Some(8000));
        assert_eq!(tx.exit_image.as_deref(), Some("exit.jpg"));
        tx.validate().unwrap();
    }

    #[test]
    fn test_close_twice_is_already_closed() {
        let mut tx = open_tx();
        let exit = ExitDetails {
            time: t0(),
            gate: "gate1".into(),
            operator: "op1".into(),
            fee: 0,
            image: None,
        };
        tx.close(exit.clone()).unwrap();
        assert!(matches!(tx.close(exit), Err(LedgerError::AlreadyClosed { .. })));
    }

    #[test]
    fn test_close_clamps_skewed_exit_time() {
        let mut tx = open_tx();
        tx.close(ExitDetails {
            time: t0() - ChronoDuration::minutes(5),
            gate: "gate1".into(),
            operator: "op1".into(),
            fee: 5000,
            image: None,
        })
        .unwrap();
        assert_eq!(tx.exit_time, Some(t0()));
        tx.validate().unwrap();
    }

    #[test]
    fn test_closed_missing_field_is_invalid() {
        let mut tx = open_tx();
        tx.status = TransactionStatus::Closed;
        tx.exit_time = Some(t0());
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_matches_ticket() {
        let tx = open_tx();
        assert!(tx.matches_ticket("T1"));
        assert!(tx.matches_ticket("transaction_T1"));
        assert!(tx.matches_ticket("BC-001"));
        assert!(!tx.matches_ticket("B1234XYZ"));
    }

    #[test]
    fn test_member_activity_window() {
        let member = Member {
            plate: "B1".into(),
            name: "Tenant".into(),
            flat_rate: Some(0),
            active: true,
            valid_from: Some(t0() - ChronoDuration::days(1)),
            valid_until: Some(t0() + ChronoDuration::days(30)),
        };
        assert!(member.is_active_at(t0()));
        assert!(!member.is_active_at(t0() + ChronoDuration::days(31)));
        assert!(!Member { active: false, ..member }.is_active_at(t0()));
    }

    #[test]
    fn test_settings_patch_reports_sync_change() {
        let mut settings = GateSettings::new(t0());
        assert!(!settings.apply(&SettingsPatch {
            gate_timeout_sec: Some(20),
            ..Default::default()
        }));
        assert_eq!(settings.gate_timeout_sec, 20);

        let sync = SyncConfig {
            remote_url: "http://couch:5984".into(),
            auto_sync: true,
            ..Default::default()
        };
        assert!(settings.apply(&SettingsPatch {
            sync: Some(sync.clone()),
            ..Default::default()
        }));
        // Same value again is not a change
        assert!(!settings.apply(&SettingsPatch {
            sync: Some(sync),
            ..Default::default()
        }));
    }

    #[test]
    fn test_sync_config_enabled() {
        let mut sync = SyncConfig::default();
        assert!(!sync.is_enabled());
        sync.remote_url = "  ".into();
        sync.auto_sync = true;
        assert!(!sync.is_enabled());
        sync.remote_url = "couch:5984".into();
        assert!(sync.is_enabled());
        assert_eq!(sync.sync_interval(), Duration::from_secs(15 * 60));
    }
}
