// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fee engine.
//!
//! A pure function of (entry time, tariff, membership, now). No I/O, no
//! clock reads; identical inputs always produce identical quotes.
//!
//! # Rules
//!
//! ```text
//! billed_hours = max(1, ceil((now - entry) / 1h))       negative stays bill 1h
//!
//! active member with a flat rate      flat_rate * billed_hours
//! (own rate, else tariff.member_rate)
//!
//! tariff                              base_rate
//!                                     + ceil((billed_hours*60 - base_minutes) / increment_minutes)
//!                                       * increment_rate
//!                                     capped at daily_maximum
//!
//! no tariff                           policy.default_fee
//! ```

use crate::document::{Member, Tariff};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fallbacks for fee computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Charged when the vehicle type has no tariff.
    #[serde(default = "default_fee")]
    pub default_fee: u64,
}

fn default_fee() -> u64 {
    5000
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            default_fee: default_fee(),
        }
    }
}

/// Which rule produced a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeBasis {
    Member,
    Tariff,
    /// Tariff total hit the daily maximum.
    Capped,
    /// No tariff for the vehicle type.
    Default,
}

impl fmt::Display for FeeBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeBasis::Member => write!(f, "member"),
            FeeBasis::Tariff => write!(f, "tariff"),
            FeeBasis::Capped => write!(f, "capped"),
            FeeBasis::Default => write!(f, "default"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub amount: u64,
    pub billed_hours: u64,
    pub basis: FeeBasis,
}

/// Started hours between entry and `now`, never less than one.
pub fn billed_hours(entry: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let secs = (now - entry).num_seconds();
    if secs <= 0 {
        return 1;
    }
    let secs = secs as u64;
    secs.div_ceil(3600).max(1)
}

/// Compute the exit fee.
pub fn compute_fee(
    entry: DateTime<Utc>,
    tariff: Option<&Tariff>,
    member: Option<&Member>,
    now: DateTime<Utc>,
    policy: &FeePolicy,
) -> FeeQuote {
    let hours = billed_hours(entry, now);

    if let Some(member) = member.filter(|m| m.is_active_at(now)) {
        let rate = member.flat_rate.or_else(|| tariff.and_then(|t| t.member_rate));
        if let Some(rate) = rate {
            return FeeQuote {
                amount: rate.saturating_mul(hours),
                billed_hours: hours,
                basis: FeeBasis::Member,
            };
        }
    }

    let Some(tariff) = tariff else {
        return FeeQuote {
            amount: policy.default_fee,
            billed_hours: hours,
            basis: FeeBasis::Default,
        };
    };

    let billed_minutes = hours.saturating_mul(60);
    let extra_minutes = billed_minutes.saturating_sub(tariff.base_duration_minutes as u64);
    let step = (tariff.increment_minutes as u64).max(1);
    let increments = extra_minutes.div_ceil(step);
    let total = tariff
        .base_rate
        .saturating_add(increments.saturating_mul(tariff.increment_rate));

    match tariff.daily_maximum {
        Some(max) if total > max => FeeQuote {
            amount: max,
            billed_hours: hours,
            basis: FeeBasis::Capped,
        },
        _ => FeeQuote {
            amount: total,
            billed_hours: hours,
            basis: FeeBasis::Tariff,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn car() -> Tariff {
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

    fn member(flat_rate: Option<u64>, active: bool) -> Member {
        Member {
            plate: "B1234XYZ".into(),
            name: "Tenant".into(),
            flat_rate,
            active,
            valid_from: None,
            valid_until: None,
        }
    }

    #[test]
    fn test_short_stay_bills_base() {
        // 08:00 -> 08:45
        let quote = compute_fee(t0(), Some(&car()), None, t0() + Duration::minutes(45), &FeePolicy::default());
        assert_eq!(quote.amount, 5000);
        assert_eq!(quote.billed_hours, 1);
        assert_eq!(quote.basis, FeeBasis::Tariff);
    }

    #[test]
    fn test_three_and_a_half_hours() {
        // 08:00 -> 11:30 = 4 started hours
        let quote = compute_fee(t0(), Some(&car()), None, t0() + Duration::minutes(210), &FeePolicy::default());
        assert_eq!(quote.amount, 14000);
        assert_eq!(quote.billed_hours, 4);
    }

    #[test]
    fn test_daily_maximum_caps() {
        let quote = compute_fee(t0(), Some(&car()), None, t0() + Duration::hours(24), &FeePolicy::default());
        assert_eq!(quote.amount, 25000);
        assert_eq!(quote.basis, FeeBasis::Capped);
    }

    #[test]
    fn test_free_member() {
        let m = member(Some(0), true);
        let quote = compute_fee(t0(), Some(&car()), Some(&m), t0() + Duration::hours(5), &FeePolicy::default());
        assert_eq!(quote.amount, 0);
        assert_eq!(quote.basis, FeeBasis::Member);
    }

    #[test]
    fn test_member_rate_from_tariff() {
        let mut tariff = car();
        tariff.member_rate = Some(1000);
        let m = member(None, true);
        let quote = compute_fee(t0(), Some(&tariff), Some(&m), t0() + Duration::minutes(130), &FeePolicy::default());
        assert_eq!(quote.amount, 3000);
    }

    #[test]
    fn test_inactive_member_pays_tariff() {
        let m = member(Some(0), false);
        let quote = compute_fee(t0(), Some(&car()), Some(&m), t0() + Duration::minutes(30), &FeePolicy::default());
        assert_eq!(quote.amount, 5000);
        assert_eq!(quote.basis, FeeBasis::Tariff);
    }

    #[test]
    fn test_member_without_any_rate_pays_tariff() {
        let m = member(None, true);
        let quote = compute_fee(t0(), Some(&car()), Some(&m), t0() + Duration::minutes(30), &FeePolicy::default());
        assert_eq!(quote.basis, FeeBasis::Tariff);
    }

    #[test]
    fn test_missing_tariff_uses_default() {
        let policy = FeePolicy { default_fee: 4000 };
        let quote = compute_fee(t0(), None, None, t0() + Duration::hours(3), &policy);
        assert_eq!(quote.amount, 4000);
        assert_eq!(quote.basis, FeeBasis::Default);
    }

    #[test]
    fn test_clock_skew_bills_one_hour() {
        let quote = compute_fee(t0(), Some(&car()), None, t0() - Duration::minutes(10), &FeePolicy::default());
        assert_eq!(quote.billed_hours, 1);
        assert_eq!(quote.amount, 5000);
    }

    #[test]
    fn test_billed_hours_boundaries() {
        assert_eq!(billed_hours(t0(), t0()), 1);
        assert_eq!(billed_hours(t0(), t0() + Duration::seconds(3600)), 1);
        assert_eq!(billed_hours(t0(), t0() + Duration::seconds(3601)), 2);
    }

    #[test]
    fn test_finer_increments() {
        let tariff = Tariff {
            vehicle_type: "motor".into(),
            base_rate: 2000,
            base_duration_minutes: 120,
            increment_rate: 500,
            increment_minutes: 30,
            daily_maximum: None,
            member_rate: None,
        };
        // 3 billed hours = 180 min, 60 beyond base = 2 increments
        let quote = compute_fee(t0(), Some(&tariff), None, t0() + Duration::minutes(150), &FeePolicy::default());
        assert_eq!(quote.amount, 3000);
    }
}
