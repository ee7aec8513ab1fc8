// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Station harness with a fixed clock and a recording gate
//! - Misbehaving remotes (flaky, stalling)
//! - Polling helpers for asynchronous state

#![allow(dead_code)]

pub mod mock_remote;

pub use mock_remote::*;

use chrono::{DateTime, TimeZone, Utc};
use gate_ledger::{
    EntryRequest, FixedClock, LedgerStoreConfig, NoOpGate, RemoteConnector, SettingsPatch, Station, StationConfig,
    SyncConfig, Tariff,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Route library logs to the test output. Honours `RUST_LOG`; safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gate_ledger=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// 2024-05-01 08:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

/// Car tariff: 5000 for the first hour, 3000 per started hour after, 25000 per day at most.
pub fn standard_tariff() -> Tariff {
    Tariff {
        vehicle_type: "car".into(),
        base_rate: 5000,
        base_duration_minutes: 60,
        increment_rate: 3000,
        increment_minutes: 60,
        daily_maximum: Some(25000),
        member_rate: None,
    }
}

pub struct TestStation {
    pub station: Station,
    pub clock: Arc<FixedClock>,
    pub gate: NoOpGate,
}

/// Open an in-memory station at [`t0`] that replicates through `connector`.
pub async fn open_station(name: &str, connector: Arc<dyn RemoteConnector>) -> TestStation {
    open_station_with(StationConfig::for_testing(name), connector).await
}

pub async fn open_station_with(config: StationConfig, connector: Arc<dyn RemoteConnector>) -> TestStation {
    let clock = Arc::new(FixedClock::new(t0()));
    let gate = NoOpGate::new();
    let station = Station::builder(config)
        .clock(clock.clone())
        .connector(connector)
        .gate(Arc::new(gate.clone()))
        .open()
        .await
        .expect("Failed to open station");
    TestStation { station, clock, gate }
}

/// Station config backed by a WAL ledger file inside `dir`.
pub fn disk_config(dir: &tempfile::TempDir, name: &str) -> StationConfig {
    let mut config = StationConfig::for_testing(name);
    config.ledger = LedgerStoreConfig {
        sqlite_path: dir.path().join(format!("{}.db", name)).to_string_lossy().into_owned(),
        ..LedgerStoreConfig::default()
    };
    config
}

pub fn sync_config(continuous: bool) -> SyncConfig {
    SyncConfig {
        remote_url: "memory://hub".into(),
        auto_sync: true,
        continuous,
        sync_interval_min: 60,
        retry_attempts: 0,
        ..Default::default()
    }
}

/// Point a station at the remote and start it.
pub async fn enable_sync(station: &Station, continuous: bool) {
    station
        .update_settings(SettingsPatch {
            sync: Some(sync_config(continuous)),
            ..Default::default()
        })
        .await
        .expect("Failed to store sync settings");
    station.start().await.expect("Failed to start station");
}

pub fn entry(plate: &str) -> EntryRequest {
    EntryRequest {
        plate: plate.into(),
        vehicle_type: "car".into(),
        gate_id: "gate-in".into(),
        operator_id: "op1".into(),
        ..Default::default()
    }
}

/// Poll `check` every 10ms until it returns true. Returns false on timeout.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
