// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stale channel watchdog.
//!
//! A healthy channel produces an event at least once per heartbeat (an
//! empty long-poll counts) or per backoff delay. A channel silent for longer
//! than `stale_threshold` is wedged somewhere the per-call timeout did not
//! catch; the monitor cancels and aborts its task and starts a new one from
//! `Idle`.

use super::types::{ChannelState, ChannelStatus, CollectionSpec};
use super::Core;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Channels with no event for longer than `threshold`. Stopped channels are
/// never stale.
pub(crate) fn find_stale(channels: &[(CollectionSpec, ChannelStatus)], threshold: Duration) -> Vec<CollectionSpec> {
    let threshold_ms = threshold.as_millis() as u64;
    channels
        .iter()
        .filter(|(_, status)| status.state != ChannelState::Stopped)
        .filter(|(_, status)| status.millis_since_event() > threshold_ms)
        .map(|(spec, _)| *spec)
        .collect()
}

pub(crate) async fn run_health_monitor(core: Arc<Core>, mut shutdown_rx: watch::Receiver<bool>) {
    let config = core.settings().health.clone();
    let check_interval = config.check_interval_duration();
    let stale_threshold = config.stale_threshold_duration();
    let mut timer = tokio::time::interval(check_interval);
    // The first tick fires immediately; channels have only just started.
    timer.tick().await;

    info!(
        check_interval_ms = check_interval.as_millis() as u64,
        stale_threshold_ms = stale_threshold.as_millis() as u64,
        "Starting channel health monitor"
    );

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let channels = core.running_channels();
                let stale = find_stale(&channels, stale_threshold);
                if stale.is_empty() {
                    debug!(channels = channels.len(), "All channels healthy");
                    continue;
                }
                for spec in stale {
                    let idle_ms = channels
                        .iter()
                        .find(|(s, _)| s.name == spec.name)
                        .map(|(_, status)| status.millis_since_event())
                        .unwrap_or_default();
                    warn!(collection = spec.name, idle_ms, "Channel stale, forcing restart");
                    core.restart_channel(spec).await;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Health monitor stopping");
                    break;
                }
            }
        }
    }

    info!("Channel health monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::types::COLLECTIONS;

    fn status(state: ChannelState, age_ms: u64) -> ChannelStatus {
        let mut s = ChannelStatus::new("transactions");
        s.state = state;
        s.last_event_ms = crate::clock::epoch_millis().saturating_sub(age_ms);
        s
    }

    #[test]
    fn test_find_stale() {
        let threshold = Duration::from_secs(180);
        let channels = vec![
            (COLLECTIONS[0], status(ChannelState::Connecting, 200_000)),
            (COLLECTIONS[1], status(ChannelState::Paused, 10_000)),
            (COLLECTIONS[2], status(ChannelState::Stopped, 900_000)),
        ];
        let stale = find_stale(&channels, threshold);
        assert_eq!(stale, vec![COLLECTIONS[0]]);
    }

    #[test]
    fn test_fresh_error_is_not_stale() {
        let channels = vec![(COLLECTIONS[0], status(ChannelState::Error, 5_000))];
        assert!(find_stale(&channels, Duration::from_secs(180)).is_empty());
    }
}
