//! Per-connector dispatch throttling.
//!
//! The gate decision is a pure function over (profile, state, now) so it
//! can be tested without a store or a clock. The store-backed helpers
//! read/update the persisted `ThrottleState` row; that row is only ever
//! written by the owning connector's single dispatcher task.
//!
//! # Checks, in order
//! 1. Operator pause / remote rate-limit pause
//! 2. Requests-per-minute window (anchored at the first dispatch of the
//!    window; denies until it rolls over)
//! 3. Daily budget (denies until just past UTC midnight)
//! 4. Batch cooldown (after `batch_size` dispatches, denies until
//!    `batch_cooldown_secs` after the last dispatch)

use chrono::{DateTime, Duration, Utc};

use crate::store::connectors::Connector;
use crate::store::throttles::{ThrottleProfile, ThrottleState};
use crate::store::{Store, StoreResult};

/// Reason a dispatch was denied, surfaced in logs and scheduled_at parks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Paused,
    MinuteLimit,
    DailyBudget,
    BatchCooldown,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Paused => "paused",
            DenyReason::MinuteLimit => "minute-limit",
            DenyReason::DailyBudget => "daily-budget",
            DenyReason::BatchCooldown => "batch-cooldown",
        }
    }
}

/// Outcome of the gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny {
        until: DateTime<Utc>,
        reason: DenyReason,
    },
}

fn utc_day(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Start of the next UTC day, plus one second of slack.
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = (now + Duration::days(1)).date_naive();
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc() + Duration::seconds(1))
        .unwrap_or(now + Duration::days(1))
}

/// Pure gate decision; see the module docs for check order.
pub fn may_dispatch(
    profile: &ThrottleProfile,
    state: &ThrottleState,
    queue_paused: bool,
    now: DateTime<Utc>,
) -> GateDecision {
    // 1. Pauses
    if let Some(until) = state.paused_until {
        if until > now {
            return GateDecision::Deny {
                until,
                reason: DenyReason::Paused,
            };
        }
    }
    if queue_paused {
        // Operator pause has no natural expiry; re-check in a minute.
        return GateDecision::Deny {
            until: now + Duration::seconds(60),
            reason: DenyReason::Paused,
        };
    }

    // 2. Per-minute window
    if let Some(window_start) = state.minute_started_at {
        let window_end = window_start + Duration::seconds(60);
        if now < window_end && state.requests_this_minute >= profile.requests_per_minute {
            return GateDecision::Deny {
                until: window_end,
                reason: DenyReason::MinuteLimit,
            };
        }
    }

    // 3. Daily budget
    if let Some(budget) = profile.daily_budget {
        let counter_is_today = state.day.as_deref() == Some(utc_day(now).as_str());
        if counter_is_today && state.requests_today >= budget {
            return GateDecision::Deny {
                until: next_utc_midnight(now),
                reason: DenyReason::DailyBudget,
            };
        }
    }

    // 4. Batch cooldown
    if state.requests_this_batch >= profile.batch_size {
        if let Some(last) = state.last_dispatch_at {
            let cooled = last + Duration::seconds(i64::from(profile.batch_cooldown_secs));
            if now < cooled {
                return GateDecision::Deny {
                    until: cooled,
                    reason: DenyReason::BatchCooldown,
                };
            }
        }
    }

    GateDecision::Allow
}

/// Bump the three counters after an allowed dispatch, rolling any window
/// that has expired.
pub fn apply_dispatch(profile: &ThrottleProfile, state: &mut ThrottleState, now: DateTime<Utc>) {
    // Minute window
    let minute_rolled = state
        .minute_started_at
        .is_none_or(|start| now >= start + Duration::seconds(60));
    if minute_rolled {
        state.minute_started_at = Some(now);
        state.requests_this_minute = 1;
    } else {
        state.requests_this_minute += 1;
    }

    // Daily counter
    let today = utc_day(now);
    if state.day.as_deref() == Some(today.as_str()) {
        state.requests_today += 1;
    } else {
        state.day = Some(today);
        state.requests_today = 1;
    }

    // Batch counter: a full batch whose cooldown has elapsed starts over.
    let batch_expired = state.requests_this_batch >= profile.batch_size
        && state
            .last_dispatch_at
            .is_none_or(|last| now >= last + Duration::seconds(i64::from(profile.batch_cooldown_secs)));
    if batch_expired || state.requests_this_batch == 0 {
        state.batch_started_at = Some(now);
        state.requests_this_batch = 1;
    } else {
        state.requests_this_batch += 1;
    }

    state.last_dispatch_at = Some(now);
}

/// Remote rate-limit response: park the connector for the profile's pause
/// window so the dispatcher does not re-probe.
pub fn engage_pause(
    profile: &ThrottleProfile,
    state: &mut ThrottleState,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let until = now + Duration::seconds(i64::from(profile.rate_limit_pause_secs));
    state.paused_until = Some(until);
    state.pause_reason = Some("rate-limited".to_owned());
    until
}

// ---------------------------------------------------------------------------
// Store-backed wrappers (used by the dispatcher)
// ---------------------------------------------------------------------------

/// Gate a dispatch for a connector from persisted state.
pub fn gate(store: &Store, connector: &Connector, now: DateTime<Utc>) -> StoreResult<GateDecision> {
    let profile = store.profile_for_connector(connector.id)?;
    let state = store.throttle_state(connector.id)?;
    Ok(may_dispatch(&profile, &state, connector.queue_paused, now))
}

/// Record an allowed dispatch in persisted state.
pub fn record_dispatch(store: &mut Store, connector_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
    let profile = store.profile_for_connector(connector_id)?;
    let mut state = store.throttle_state(connector_id)?;
    apply_dispatch(&profile, &mut state, now);
    store.save_throttle_state(connector_id, &state)
}

/// Persist a remote rate-limit pause; returns the pause expiry.
pub fn record_rate_limit_pause(
    store: &mut Store,
    connector_id: i64,
    now: DateTime<Utc>,
) -> StoreResult<DateTime<Utc>> {
    let profile = store.profile_for_connector(connector_id)?;
    let mut state = store.throttle_state(connector_id)?;
    let until = engage_pause(&profile, &mut state, now);
    store.save_throttle_state(connector_id, &state)?;
    Ok(until)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn profile(rpm: u32) -> ThrottleProfile {
        ThrottleProfile {
            id: 1,
            name: "test".to_owned(),
            requests_per_minute: rpm,
            daily_budget: None,
            batch_size: 50,
            batch_cooldown_secs: 10,
            rate_limit_pause_secs: 600,
            is_default: true,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn minute_window_allows_exactly_rpm_dispatches() {
        let profile = profile(5);
        let mut state = ThrottleState::default();
        let now = at(12, 0, 0);
        for _ in 0..5 {
            assert_eq!(may_dispatch(&profile, &state, false, now), GateDecision::Allow);
            apply_dispatch(&profile, &mut state, now);
        }
        match may_dispatch(&profile, &state, false, now) {
            GateDecision::Deny { until, reason } => {
                assert_eq!(reason, DenyReason::MinuteLimit);
                assert_eq!(until, at(12, 1, 0));
            }
            GateDecision::Allow => panic!("sixth dispatch must be denied"),
        }

        // After the window rolls, dispatching resumes.
        let later = at(12, 1, 0);
        assert_eq!(may_dispatch(&profile, &state, false, later), GateDecision::Allow);
        apply_dispatch(&profile, &mut state, later);
        assert_eq!(state.requests_this_minute, 1);
    }

    #[test]
    fn daily_budget_denies_until_past_utc_midnight() {
        let profile = ThrottleProfile {
            daily_budget: Some(10),
            requests_per_minute: 60,
            ..profile(60)
        };
        let mut state = ThrottleState::default();
        let mut now = at(6, 0, 0);
        for i in 0..10 {
            assert_eq!(may_dispatch(&profile, &state, false, now), GateDecision::Allow);
            apply_dispatch(&profile, &mut state, now);
            now += Duration::minutes(i64::from(i) + 1);
        }
        match may_dispatch(&profile, &state, false, now) {
            GateDecision::Deny { until, reason } => {
                assert_eq!(reason, DenyReason::DailyBudget);
                assert_eq!(until, Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 1).unwrap());
            }
            GateDecision::Allow => panic!("budget must deny"),
        }

        // A new UTC day resets the counter.
        let tomorrow = Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 2).unwrap();
        assert_eq!(may_dispatch(&profile, &state, false, tomorrow), GateDecision::Allow);
    }

    #[test]
    fn batch_cooldown_engages_after_batch_size_dispatches() {
        let profile = ThrottleProfile {
            batch_size: 3,
            batch_cooldown_secs: 120,
            requests_per_minute: 60,
            ..profile(60)
        };
        let mut state = ThrottleState::default();
        let mut now = at(9, 0, 0);
        for _ in 0..3 {
            assert_eq!(may_dispatch(&profile, &state, false, now), GateDecision::Allow);
            apply_dispatch(&profile, &mut state, now);
            now += Duration::seconds(1);
        }
        match may_dispatch(&profile, &state, false, now) {
            GateDecision::Deny { until, reason } => {
                assert_eq!(reason, DenyReason::BatchCooldown);
                assert_eq!(until, at(9, 0, 2) + Duration::seconds(120));
            }
            GateDecision::Allow => panic!("batch must deny"),
        }

        // After the cooldown the batch counter starts over.
        let cooled = at(9, 3, 0);
        assert_eq!(may_dispatch(&profile, &state, false, cooled), GateDecision::Allow);
        apply_dispatch(&profile, &mut state, cooled);
        assert_eq!(state.requests_this_batch, 1);
    }

    #[test]
    fn pause_wins_over_everything() {
        let profile = profile(60);
        let mut state = ThrottleState::default();
        let now = at(10, 0, 0);
        let until = engage_pause(&profile, &mut state, now);
        assert_eq!(until, now + Duration::seconds(600));
        match may_dispatch(&profile, &state, false, now) {
            GateDecision::Deny { reason, until: u } => {
                assert_eq!(reason, DenyReason::Paused);
                assert_eq!(u, until);
            }
            GateDecision::Allow => panic!("paused connector must deny"),
        }
        // Expired pause no longer denies.
        assert_eq!(
            may_dispatch(&profile, &state, false, until + Duration::seconds(1)),
            GateDecision::Allow
        );
    }

    #[test]
    fn operator_queue_pause_denies_with_re_check_window() {
        let profile = profile(60);
        let state = ThrottleState::default();
        let now = at(10, 0, 0);
        match may_dispatch(&profile, &state, true, now) {
            GateDecision::Deny { reason, until } => {
                assert_eq!(reason, DenyReason::Paused);
                assert_eq!(until, now + Duration::seconds(60));
            }
            GateDecision::Allow => panic!("queue-paused connector must deny"),
        }
    }
}
